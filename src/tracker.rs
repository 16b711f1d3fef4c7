//! Counting tracker for render and write tasks, and the run-wide
//! cancellation flag.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::PublishError;

/// Cooperative cancellation shared by every stage of a run.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), PublishError> {
        if self.is_cancelled() {
            Err(PublishError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Default)]
pub struct TaskTracker {
    renders_total: AtomicUsize,
    renders_done: AtomicUsize,
    writes_total: AtomicUsize,
    writes_done: AtomicUsize,
    changed: Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counts {
    pub total: usize,
    pub remaining: usize,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render_scheduled(&self) {
        self.renders_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn render_done(&self) {
        self.renders_done.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    pub fn write_scheduled(&self) {
        self.writes_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn write_done(&self) {
        self.writes_done.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    pub fn renders(&self) -> Counts {
        let total = self.renders_total.load(Ordering::SeqCst);
        let done = self.renders_done.load(Ordering::SeqCst);
        Counts {
            total,
            remaining: total.saturating_sub(done),
        }
    }

    pub fn writes(&self) -> Counts {
        let total = self.writes_total.load(Ordering::SeqCst);
        let done = self.writes_done.load(Ordering::SeqCst);
        Counts {
            total,
            remaining: total.saturating_sub(done),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.renders().remaining > 0 || self.writes().remaining > 0
    }

    async fn wait_until(
        &self,
        cancel: &Cancellation,
        poll: Duration,
        idle: impl Fn(&Self) -> bool,
    ) -> Result<(), PublishError> {
        loop {
            if idle(self) {
                return Ok(());
            }
            cancel.check()?;
            let _ = tokio::time::timeout(poll, self.changed.notified()).await;
        }
    }

    pub async fn wait_renders(&self, cancel: &Cancellation, poll: Duration) -> Result<(), PublishError> {
        self.wait_until(cancel, poll, |t| t.renders().remaining == 0)
            .await
    }

    pub async fn wait_idle(&self, cancel: &Cancellation, poll: Duration) -> Result<(), PublishError> {
        self.wait_until(cancel, poll, |t| !t.is_busy()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn waits_for_outstanding_writes() {
        let tracker = Arc::new(TaskTracker::new());
        let cancel = Cancellation::new();
        tracker.write_scheduled();
        tracker.write_scheduled();
        assert_eq!(tracker.writes(), Counts { total: 2, remaining: 2 });

        let t = tracker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            t.write_done();
            t.write_done();
        });
        tokio::time::timeout(
            Duration::from_secs(1),
            tracker.wait_idle(&cancel, Duration::from_millis(5)),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!tracker.is_busy());
    }

    #[tokio::test]
    async fn wait_returns_on_cancellation() {
        let tracker = TaskTracker::new();
        let cancel = Cancellation::new();
        tracker.render_scheduled();
        cancel.cancel();
        let err = tracker
            .wait_renders(&cancel, Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Cancelled));
    }
}
