use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use crate::identity::IdentityError;
use crate::mapping::MappingError;
use crate::model::ObjectKey;
use crate::target::TargetError;

/// Failure of a publish run or of a single write within it.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("target system: {0}")]
    Target(#[from] TargetError),

    #[error("source system: {0:#}")]
    Source(#[from] anyhow::Error),

    #[error("timed out after {timeout:?} waiting for the write lock of {repository}")]
    LockTimeout {
        repository: String,
        timeout: Duration,
    },

    #[error("{key} ({uuid}) failed again after being postponed: {reason}")]
    PostponedTwice {
        key: ObjectKey,
        uuid: String,
        reason: String,
    },

    #[error("migration of {name} {version} in branch {branch} failed")]
    MigrationFailed {
        branch: String,
        name: String,
        version: String,
    },

    #[error("{key} and {other} both map to {uuid} ({language}) in branch {branch}")]
    DuplicateIdentity {
        key: ObjectKey,
        other: ObjectKey,
        uuid: String,
        language: String,
        branch: String,
    },

    #[error("write of {key} ({uuid}) failed: {source}")]
    Write {
        key: ObjectKey,
        uuid: String,
        #[source]
        source: TargetError,
    },

    #[error("publish run cancelled")]
    Cancelled,

    #[error("write queue closed")]
    QueueClosed,
}

impl PublishError {
    /// Short machine readable kind, stored in the journal.
    pub fn kind(&self) -> &'static str {
        match self {
            PublishError::Configuration(_) | PublishError::Mapping(_) => "configuration",
            PublishError::Identity(_) => "identity",
            PublishError::Target(_) => "target",
            PublishError::Source(_) => "source",
            PublishError::LockTimeout { .. } => "lock_timeout",
            PublishError::PostponedTwice { .. } => "postponed_twice",
            PublishError::MigrationFailed { .. } => "migration_failed",
            PublishError::DuplicateIdentity { .. } => "duplicate_identity",
            PublishError::Write { .. } => "write",
            PublishError::Cancelled => "cancelled",
            PublishError::QueueClosed => "queue_closed",
        }
    }

    /// Whether the error ends the run. Object-local failures are collected
    /// while the remaining work continues.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PublishError::PostponedTwice { .. } | PublishError::DuplicateIdentity { .. }
        )
    }

    /// Object the error is about, if any.
    pub fn object(&self) -> Option<ObjectKey> {
        match self {
            PublishError::PostponedTwice { key, .. }
            | PublishError::DuplicateIdentity { key, .. }
            | PublishError::Write { key, .. } => Some(*key),
            _ => None,
        }
    }
}

/// Errors collected during one run, reported together when the run closes.
#[derive(Debug, Default)]
pub struct ErrorLog {
    errors: Mutex<Vec<PublishError>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, err: PublishError) {
        self.errors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(err);
    }

    pub fn extend(&self, errs: impl IntoIterator<Item = PublishError>) {
        self.errors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(errs);
    }

    pub fn len(&self) -> usize {
        self.errors.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take(&self) -> Vec<PublishError> {
        std::mem::take(&mut *self.errors.lock().unwrap_or_else(|p| p.into_inner()))
    }
}
