//! Best-effort run journal on top of the `db` repository functions.
//!
//! Every method logs and swallows its own failures; a broken journal never
//! aborts a publish run.
use anyhow::Result;
use tracing::{debug, warn};

use crate::db::{self, Pool, RunState};
use crate::error::PublishError;
use crate::pipeline::Attempt;
use crate::reconcile::ReconcileMode;

#[derive(Debug, Clone)]
pub struct Journal {
    pool: Pool,
}

impl Journal {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Opens the database at `database_url` and applies pending migrations.
    pub async fn open(database_url: &str) -> Result<Self> {
        let pool = db::init_pool(database_url).await?;
        db::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub async fn begin(&self, repository: &str, mode: ReconcileMode) -> Option<JournalRun> {
        match db::begin_run(&self.pool, repository, mode.check_only, mode.repair).await {
            Ok(id) => {
                debug!(run_id = id, repository, "journal run opened");
                Some(JournalRun {
                    pool: self.pool.clone(),
                    id,
                })
            }
            Err(err) => {
                warn!(?err, repository, "failed to open journal run");
                None
            }
        }
    }
}

/// One journaled publish run.
#[derive(Debug, Clone)]
pub struct JournalRun {
    pool: Pool,
    id: i64,
}

impl JournalRun {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub async fn phase_begin(&self, phase: &str) {
        if let Err(err) = db::phase_begin(&self.pool, self.id, phase).await {
            warn!(?err, run_id = self.id, phase, "failed to journal phase begin");
        }
    }

    pub async fn phase_done(&self, phase: &str) {
        if let Err(err) = db::phase_done(&self.pool, self.id, phase).await {
            warn!(?err, run_id = self.id, phase, "failed to journal phase end");
        }
    }

    pub async fn error(&self, err: &PublishError) {
        let message = err.to_string();
        if let Err(e) = db::record_error(&self.pool, self.id, err.kind(), err.object(), &message).await {
            warn!(err = ?e, run_id = self.id, "failed to journal error");
        }
    }

    pub async fn postponed(&self, attempt: &Attempt) {
        let task = &attempt.task;
        if let Err(err) = db::record_postponed(
            &self.pool,
            self.id,
            task.key,
            &task.uuid,
            &task.language,
            attempt.reason.as_deref(),
        )
        .await
        {
            warn!(?err, run_id = self.id, "failed to journal postponed task");
        }
    }

    pub async fn finish(&self, state: RunState, renders: usize, writes: usize, errors: usize) {
        if let Err(err) = db::finish_run(
            &self.pool,
            self.id,
            state,
            renders as i64,
            writes as i64,
            errors as i64,
        )
        .await
        {
            warn!(?err, run_id = self.id, "failed to journal run end");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repo::tests::setup_pool;
    use crate::model::{ObjectKey, ObjectType};

    #[tokio::test]
    async fn journal_survives_a_closed_pool() {
        let pool = setup_pool().await;
        let journal = Journal::new(pool.clone());
        let run = journal
            .begin("mesh", ReconcileMode::default())
            .await
            .unwrap();
        run.phase_begin("init").await;
        pool.close().await;
        // Nothing below may panic or return an error.
        run.phase_done("init").await;
        run.error(&PublishError::Cancelled).await;
        run.finish(RunState::Cancelled, 0, 0, 1).await;
        assert!(journal.begin("mesh", ReconcileMode::default()).await.is_none());
    }

    #[tokio::test]
    async fn errors_keep_their_object() {
        let pool = setup_pool().await;
        let run = Journal::new(pool.clone())
            .begin("mesh", ReconcileMode::repair())
            .await
            .unwrap();
        run.error(&PublishError::PostponedTwice {
            key: ObjectKey::new(ObjectType::Folder, 5),
            uuid: "u".into(),
            reason: "conflict".into(),
        })
        .await;
        let errors = db::run_errors(&pool, run.id()).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, "postponed_twice");
        assert_eq!(errors[0].object_id, Some(5));
    }
}
