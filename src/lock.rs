//! Named write locks.
//!
//! Writes into one target repository are serialized through a lock keyed by
//! the repository name. Acquisition is bounded by a timeout; the guard
//! releases the lock on drop.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::warn;

use crate::error::PublishError;

#[derive(Debug, Default)]
pub struct NamedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held write lock of one repository.
#[derive(Debug)]
pub struct WriteLock {
    pub name: String,
    _guard: OwnedMutexGuard<()>,
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry(name.to_string()).or_default().clone()
    }

    pub async fn acquire(&self, name: &str, timeout: Duration) -> Result<WriteLock, PublishError> {
        let lock = self.entry(name);
        match tokio::time::timeout(timeout, lock.lock_owned()).await {
            Ok(guard) => Ok(WriteLock {
                name: name.to_string(),
                _guard: guard,
            }),
            Err(_) => {
                warn!(repository = name, ?timeout, "write lock not acquired in time");
                Err(PublishError::LockTimeout {
                    repository: name.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Whether the lock of `name` is currently held.
    pub fn is_locked(&self, name: &str) -> bool {
        self.entry(name).try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_times_out_while_held() {
        let locks = NamedLocks::new();
        let held = locks.acquire("mesh", Duration::from_millis(50)).await.unwrap();
        assert!(locks.is_locked("mesh"));
        assert!(!locks.is_locked("other"));

        let err = locks
            .acquire("mesh", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::LockTimeout { .. }));

        drop(held);
        assert!(locks.acquire("mesh", Duration::from_millis(20)).await.is_ok());
    }
}
