//! Write stage: performs write attempts against the target system.
//!
//! One writer exists per repository. All writes run under the repository's
//! named lock; a missing parent is written inside the same lock before the
//! child is retried.
use futures::future::{BoxFuture, FutureExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, instrument, warn};

use super::queue::WriteReceiver;
use super::render::RenderStage;
use super::task::{Attempt, Continuation, WriteMessage, WriteTask};
use crate::cache::{ExistenceCache, IdentityClaims};
use crate::context::RepositoryContext;
use crate::error::{ErrorLog, PublishError};
use crate::lock::NamedLocks;
use crate::source::SourceSystem;
use crate::target::model::{
    BinaryUpload, NameRef, NodeResponse, NodeUpsertRequest, PermissionTarget, UuidRef,
};
use crate::target::{retry_transient, Conflict, TargetError, TargetService};
use crate::tracker::{Cancellation, TaskTracker};

/// Upper bound for nested parent writes and retries of one attempt.
const MAX_DEPTH: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Postponed,
}

pub struct Writer {
    ctx: Arc<RepositoryContext>,
    target: Arc<dyn TargetService>,
    source: Arc<dyn SourceSystem>,
    render: Arc<RenderStage>,
    cache: Arc<ExistenceCache>,
    claims: IdentityClaims,
    locks: Arc<NamedLocks>,
    postponed: Mutex<Vec<Attempt>>,
    postponed_count: Arc<AtomicUsize>,
}

fn write_error(task: &WriteTask, source: TargetError) -> PublishError {
    PublishError::Write {
        key: task.key,
        uuid: task.uuid.clone(),
        source,
    }
}

fn ignore_not_found(res: Result<(), TargetError>) -> Result<(), TargetError> {
    match res {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

impl Writer {
    pub fn new(
        ctx: Arc<RepositoryContext>,
        target: Arc<dyn TargetService>,
        source: Arc<dyn SourceSystem>,
        render: Arc<RenderStage>,
        cache: Arc<ExistenceCache>,
        locks: Arc<NamedLocks>,
    ) -> Self {
        Self {
            ctx,
            target,
            source,
            render,
            cache,
            claims: IdentityClaims::default(),
            locks,
            postponed: Mutex::new(Vec::new()),
            postponed_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared counter of postponed attempts, for status reporting.
    pub fn postponed_counter(&self) -> Arc<AtomicUsize> {
        self.postponed_count.clone()
    }

    pub fn postponed_len(&self) -> usize {
        self.postponed_count.load(Ordering::SeqCst)
    }

    /// Snapshot of the attempts waiting for the replay phase.
    pub fn postponed_tasks(&self) -> Vec<Attempt> {
        self.postponed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn stash(&self, attempt: Attempt) {
        self.postponed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(attempt);
        self.postponed_count.fetch_add(1, Ordering::SeqCst);
    }

    fn take_postponed(&self) -> Vec<Attempt> {
        let taken = std::mem::take(&mut *self.postponed.lock().unwrap_or_else(|p| p.into_inner()));
        self.postponed_count.fetch_sub(taken.len(), Ordering::SeqCst);
        taken
    }

    fn postpone(&self, attempt: Attempt, reason: String) -> Result<Outcome, PublishError> {
        let task = attempt.task.clone();
        let postponed = attempt.postpone(reason)?;
        info!(
            object_type = %task.key.object_type,
            object_id = task.key.id,
            uuid = %task.uuid,
            language = %task.language,
            reason = postponed.reason.as_deref().unwrap_or_default(),
            "write postponed"
        );
        self.stash(postponed);
        Ok(Outcome::Postponed)
    }

    /// Performs one attempt under the repository write lock.
    pub async fn write(&self, attempt: Attempt) -> Result<Outcome, PublishError> {
        let _lock = self
            .locks
            .acquire(self.ctx.name(), self.ctx.app.lock_timeout())
            .await?;
        self.perform(attempt, 0).await
    }

    fn perform(&self, attempt: Attempt, depth: u32) -> BoxFuture<'_, Result<Outcome, PublishError>> {
        async move {
            let task = attempt.task.clone();
            if depth > MAX_DEPTH {
                return Err(write_error(
                    &task,
                    TargetError::BadRequest("parent chain or retries too deep".into()),
                ));
            }
            self.claim(&task)?;

            let publish = task.continuations.is_empty() || !attempt.delta.is_empty();
            let req = NodeUpsertRequest {
                language: task.language.clone(),
                parent_node: task.parent_uuid.clone().map(|uuid| UuidRef { uuid }),
                schema: NameRef {
                    name: task.schema.clone(),
                },
                fields: attempt.request_fields(),
                publish,
                grant: if self.ctx.config.atomic_permissions {
                    task.roles.clone()
                } else {
                    None
                },
            };
            let app = &self.ctx.app;
            let upserted = retry_transient(
                app.transient_retries,
                app.transient_retry_delay(),
                "upsert node",
                || self.target.upsert_node(&task.scope, &task.uuid, &req),
            )
            .await;

            let node = match upserted {
                Ok(node) => node,
                Err(TargetError::MissingParent(parent)) => {
                    return self.write_parent_first(attempt, &parent, depth).await;
                }
                Err(TargetError::Conflict(conflict)) => {
                    if attempt.retries == 0 && self.remove_stale(&task, &conflict).await? {
                        return self.perform(attempt.retried(), depth + 1).await;
                    }
                    return self.postpone(attempt, format!("conflict: {}", conflict.message));
                }
                Err(err) => return Err(write_error(&task, err)),
            };

            self.after_upsert(&attempt, &node, publish).await?;
            self.cache.written(task.key);
            if attempt.needs_field_replay() {
                debug!(uuid = %task.uuid, "fields with pending references queued for replay");
                self.stash(Attempt::deferred_fields(task.clone()));
            }
            if let Some(dirt_id) = task.dirt_id {
                self.source.report_done(self.ctx.name(), dirt_id).await?;
            }
            Ok(Outcome::Done)
        }
        .boxed()
    }

    fn claim(&self, task: &WriteTask) -> Result<(), PublishError> {
        self.claims
            .claim(&task.scope, &task.uuid, &task.language, task.key)
            .map_err(|other| {
                let branch = task
                    .scope
                    .branch
                    .clone()
                    .unwrap_or_else(|| task.scope.project.clone());
                warn!(
                    object = %task.key,
                    other = %other,
                    uuid = %task.uuid,
                    language = %task.language,
                    branch = %branch,
                    "two objects map to the same item"
                );
                PublishError::DuplicateIdentity {
                    key: task.key,
                    other,
                    uuid: task.uuid.clone(),
                    language: task.language.clone(),
                    branch,
                }
            })
    }

    async fn write_parent_first(
        &self,
        attempt: Attempt,
        parent_uuid: &str,
        depth: u32,
    ) -> Result<Outcome, PublishError> {
        let task = attempt.task.clone();
        match self.render.parent_task(&task).await? {
            Some(parent) => {
                info!(
                    object = %task.key,
                    parent = %parent.key,
                    uuid = %parent.uuid,
                    "parent missing in target; writing it first"
                );
                match self.perform(Attempt::new(parent), depth + 1).await? {
                    Outcome::Done => self.perform(attempt.retried(), depth + 1).await,
                    Outcome::Postponed => {
                        self.postpone(attempt, format!("parent {} postponed", parent_uuid))
                    }
                }
            }
            None => {
                if let Some(parent_key) = task.parent {
                    self.cache.missing(parent_key);
                }
                self.postpone(attempt, format!("parent {} does not exist", parent_uuid))
            }
        }
    }

    /// Removes the colliding item when the source system no longer needs it.
    /// Returns whether anything was removed.
    async fn remove_stale(&self, task: &WriteTask, conflict: &Conflict) -> Result<bool, PublishError> {
        let Some(uuid) = conflict.conflicting_uuid.as_deref() else {
            return Ok(false);
        };
        let language = conflict.conflicting_language.as_deref();
        if uuid == task.uuid && language.map_or(true, |l| l == task.language) {
            return Ok(false);
        }
        let repository = self.ctx.name();
        let stale = match self.source.object_by_uuid(repository, uuid, language).await? {
            None => true,
            Some(object) => !self.source.must_contain(&object, repository, task.site_id).await?,
        };
        if !stale {
            debug!(uuid, ?language, "colliding item is still needed");
            return Ok(false);
        }
        info!(
            object = %task.key,
            colliding = uuid,
            language = language.unwrap_or("*"),
            "removing stale colliding item"
        );
        let removed = match language {
            Some(lang) => self.target.delete_language(&task.scope, uuid, lang).await,
            None => self.target.delete_node(&task.scope, uuid).await,
        };
        ignore_not_found(removed).map_err(|e| write_error(task, e))?;
        Ok(true)
    }

    async fn after_upsert(
        &self,
        attempt: &Attempt,
        node: &NodeResponse,
        published: bool,
    ) -> Result<(), PublishError> {
        let task = &attempt.task;
        let scope = &task.scope;
        let full_write = attempt.delta.is_empty();

        if let (Some(want), Some(have)) = (task.parent_uuid.as_deref(), node.parent_uuid()) {
            if want != have {
                debug!(uuid = %task.uuid, from = have, to = want, "moving item");
                self.target
                    .move_node(scope, &task.uuid, want)
                    .await
                    .map_err(|e| write_error(task, e))?;
            }
        }

        if full_write {
            if let Some(roles) = task.roles.as_deref() {
                self.grant(task, roles).await?;
            }
            for continuation in &task.continuations {
                match continuation {
                    Continuation::UploadBinary { field, binary } => {
                        let upload = BinaryUpload {
                            field: field.clone(),
                            language: task.language.clone(),
                            version: node.version.clone(),
                            file_name: binary.file_name.clone(),
                            mime_type: binary.mime_type.clone(),
                            data: binary.data.clone(),
                        };
                        self.target
                            .upload_binary(scope, &task.uuid, &upload)
                            .await
                            .map_err(|e| write_error(task, e))?;
                    }
                    Continuation::FocalPoint { field, point } => {
                        self.target
                            .set_focal_point(scope, &task.uuid, &task.language, field, *point)
                            .await
                            .map_err(|e| write_error(task, e))?;
                    }
                }
            }
        }

        if !published {
            self.target
                .publish_language(scope, &task.uuid, &task.language)
                .await
                .map_err(|e| write_error(task, e))?;
        }

        if let Some(expected) = &task.expected_languages {
            for language in node
                .available_languages
                .iter()
                .filter(|l| !expected.contains(*l))
            {
                info!(uuid = %task.uuid, language = %language, "deleting language no longer expected");
                ignore_not_found(self.target.delete_language(scope, &task.uuid, language).await)
                    .map_err(|e| write_error(task, e))?;
            }
        }
        Ok(())
    }

    async fn grant(&self, task: &WriteTask, roles: &[String]) -> Result<(), PublishError> {
        let project = task.scope.project.clone();
        let granted = self
            .ctx
            .project(&project)
            .map(|p| p.granted_roles)
            .unwrap_or_default();
        let missing: Vec<String> = roles
            .iter()
            .filter(|r| !granted.contains(*r))
            .cloned()
            .collect();
        if !missing.is_empty() {
            self.target
                .grant_roles(&PermissionTarget::Project { project: project.clone() }, &missing)
                .await
                .map_err(|e| write_error(task, e))?;
            self.ctx
                .update_project(&project, |p| p.granted_roles.extend(missing));
        }
        if !self.ctx.config.atomic_permissions && !roles.is_empty() {
            let target = PermissionTarget::Node {
                project,
                uuid: task.uuid.clone(),
            };
            self.target
                .grant_roles(&target, roles)
                .await
                .map_err(|e| write_error(task, e))?;
        }
        Ok(())
    }

    /// Replays every postponed attempt once. Object-local failures are
    /// collected; a fatal one stops the replay.
    #[instrument(skip_all, fields(repository = %self.ctx.name()))]
    pub async fn replay_postponed(&self, cancel: &Cancellation) -> Vec<PublishError> {
        let attempts = self.take_postponed();
        if attempts.is_empty() {
            return Vec::new();
        }
        info!(count = attempts.len(), "replaying postponed writes");
        let mut errors = Vec::new();
        for attempt in attempts {
            if let Err(err) = cancel.check() {
                errors.push(err);
                break;
            }
            match self.write(attempt).await {
                Ok(_) => {}
                Err(err) if err.is_fatal() => {
                    error!(error = %err, "postponed write failed");
                    errors.push(err);
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "postponed write failed");
                    errors.push(err);
                }
            }
        }
        // Parents written during the replay may leave deferred field writes.
        for attempt in self.take_postponed() {
            if let Err(err) = self.write(attempt).await {
                errors.push(err);
            }
        }
        errors
    }
}

/// Single consumer of a repository's write queue. Stops on `Stop`, on a
/// closed queue or when the run is cancelled; on cancellation the queue is
/// drained.
pub async fn run_consumer(
    writer: Arc<Writer>,
    mut rx: WriteReceiver,
    tracker: Arc<TaskTracker>,
    cancel: Cancellation,
    errors: Arc<ErrorLog>,
) {
    loop {
        if cancel.is_cancelled() {
            let dropped = rx.drain();
            for _ in 0..dropped {
                tracker.write_done();
            }
            if dropped > 0 {
                warn!(dropped, "discarded queued writes after cancellation");
            }
            break;
        }
        let attempt = match rx.pull().await {
            Some(WriteMessage::Work(attempt)) => attempt,
            Some(WriteMessage::Stop) | None => break,
        };
        if !cancel.is_cancelled() {
            match writer.write(attempt).await {
                Ok(_) => {}
                Err(err) if err.is_fatal() => {
                    error!(error = %err, "write failed; cancelling run");
                    errors.push(err);
                    cancel.cancel();
                }
                Err(err) => {
                    warn!(error = %err, "write failed");
                    errors.push(err);
                }
            }
        }
        tracker.write_done();
    }
}
