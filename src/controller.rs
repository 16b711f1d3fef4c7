//! Publish controller: drives one repository through the phases of a run.
//!
//! Rendering runs on a bounded pool of tasks, writing on a single consumer
//! behind a bounded queue. Phases only move forward; every transition is
//! logged, journaled and handed to the [`PhaseListener`].
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{ExistenceCache, Presence};
use crate::consistency::{ConsistencyChecker, ConsistencyReport};
use crate::context::RepositoryContext;
use crate::db::RunState;
use crate::error::{ErrorLog, PublishError};
use crate::journal::{Journal, JournalRun};
use crate::lock::NamedLocks;
use crate::model::{ObjectType, ScheduledUnit};
use crate::pipeline::{run_consumer, write_queue, Attempt, RenderStage, WriteQueue, Writer};
use crate::reconcile::{reconcile, wait_for_migrations, ReconcileMode, ReconcileReport};
use crate::source::{FieldRenderer, SourceSystem};
use crate::target::TargetService;
use crate::tracker::{Cancellation, TaskTracker};

const IDLE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    CheckSchemas,
    WaitForMigrations,
    PublishFoldersAndFiles,
    PublishPages,
    CheckOfflineFiles,
    HandlePostponedTasks,
    RemoveOfflineObjects,
    WaitForRenderers,
    WaitForWriteTasks,
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::CheckSchemas => "check_schemas",
            Phase::WaitForMigrations => "wait_for_migrations",
            Phase::PublishFoldersAndFiles => "publish_folders_and_files",
            Phase::PublishPages => "publish_pages",
            Phase::CheckOfflineFiles => "check_offline_files",
            Phase::HandlePostponedTasks => "handle_postponed_tasks",
            Phase::RemoveOfflineObjects => "remove_offline_objects",
            Phase::WaitForRenderers => "wait_for_renderers",
            Phase::WaitForWriteTasks => "wait_for_write_tasks",
            Phase::Done => "done",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hooks of the surrounding publish process.
pub trait PhaseListener: Send + Sync {
    fn phase_begin(&self, _repository: &str, _phase: Phase) {}
    fn phase_done(&self, _repository: &str, _phase: Phase) {}
}

pub struct NoopListener;

impl PhaseListener for NoopListener {}

/// Read-only snapshot for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct PublishStatus {
    pub repository: String,
    pub phase: Phase,
    pub queue_depth: usize,
    pub postponed: usize,
    pub renders_total: usize,
    pub renders_remaining: usize,
    pub writes_total: usize,
    pub writes_remaining: usize,
    /// Items written in this run.
    pub written: usize,
    /// Referenced items known not to exist.
    pub missing: usize,
    /// Whether a write currently holds the repository lock.
    pub write_locked: bool,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub check_only: bool,
    pub repair: bool,
}

impl RunOptions {
    fn mode(&self) -> ReconcileMode {
        ReconcileMode {
            check_only: self.check_only,
            repair: self.repair,
        }
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub repository: String,
    pub success: bool,
    pub state: RunState,
    pub reconcile: Option<ReconcileReport>,
    pub consistency: Option<ConsistencyReport>,
    pub offline_files: usize,
    pub errors: Vec<PublishError>,
}

impl RunReport {
    fn new(repository: &str) -> Self {
        Self {
            repository: repository.to_string(),
            success: false,
            state: RunState::Running,
            reconcile: None,
            consistency: None,
            offline_files: 0,
            errors: Vec::new(),
        }
    }
}

pub struct PublishController {
    ctx: Arc<RepositoryContext>,
    target: Arc<dyn TargetService>,
    source: Arc<dyn SourceSystem>,
    renderer: Arc<dyn FieldRenderer>,
    locks: Arc<NamedLocks>,
    listener: Arc<dyn PhaseListener>,
    journal: Option<Journal>,
    tracker: Arc<TaskTracker>,
    cache: Arc<ExistenceCache>,
    started: AtomicBool,
    cancel: Cancellation,
    errors: Arc<ErrorLog>,
    phase: Mutex<Phase>,
    queue_depth: Arc<AtomicUsize>,
    postponed: Mutex<Option<Arc<AtomicUsize>>>,
}

impl PublishController {
    pub fn new(
        ctx: Arc<RepositoryContext>,
        target: Arc<dyn TargetService>,
        source: Arc<dyn SourceSystem>,
        renderer: Arc<dyn FieldRenderer>,
    ) -> Self {
        Self {
            ctx,
            target,
            source,
            renderer,
            locks: Arc::new(NamedLocks::new()),
            listener: Arc::new(NoopListener),
            journal: None,
            tracker: Arc::new(TaskTracker::new()),
            cache: Arc::new(ExistenceCache::new()),
            started: AtomicBool::new(false),
            cancel: Cancellation::new(),
            errors: Arc::new(ErrorLog::new()),
            phase: Mutex::new(Phase::Init),
            queue_depth: Arc::new(AtomicUsize::new(0)),
            postponed: Mutex::new(None),
        }
    }

    /// Shares write locks with controllers of other sites of the same repository.
    pub fn with_locks(mut self, locks: Arc<NamedLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn PhaseListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Handle to cancel the run from outside.
    pub fn cancellation(&self) -> Cancellation {
        self.cancel.clone()
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn status(&self) -> PublishStatus {
        let renders = self.tracker.renders();
        let writes = self.tracker.writes();
        let postponed = self
            .postponed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map_or(0, |c| c.load(Ordering::SeqCst));
        PublishStatus {
            repository: self.ctx.name().to_string(),
            phase: self.phase(),
            queue_depth: self.queue_depth.load(Ordering::SeqCst),
            postponed,
            renders_total: renders.total,
            renders_remaining: renders.remaining,
            writes_total: writes.total,
            writes_remaining: writes.remaining,
            written: self.cache.count(Presence::Written),
            missing: self.cache.count(Presence::Missing),
            write_locked: self.locks.is_locked(self.ctx.name()),
            cancelled: self.cancel.is_cancelled(),
        }
    }

    async fn enter(&self, phase: Phase, run: Option<&JournalRun>) {
        {
            let mut current = self.phase.lock().unwrap_or_else(|p| p.into_inner());
            if phase <= *current && phase != Phase::Init {
                warn!(current = %*current, requested = %phase, "ignoring backward phase transition");
                return;
            }
            *current = phase;
        }
        info!(repository = %self.ctx.name(), phase = %phase, "phase begin");
        self.listener.phase_begin(self.ctx.name(), phase);
        if let Some(run) = run {
            run.phase_begin(phase.as_str()).await;
        }
    }

    async fn leave(&self, phase: Phase, run: Option<&JournalRun>) {
        debug!(repository = %self.ctx.name(), phase = %phase, "phase done");
        self.listener.phase_done(self.ctx.name(), phase);
        if let Some(run) = run {
            run.phase_done(phase.as_str()).await;
        }
    }

    /// Runs one publish. Errors never escape; they are collected in the report.
    /// A controller runs once; later calls fail without touching anything.
    #[instrument(skip_all, fields(repository = %self.ctx.name(), check_only = options.check_only, repair = options.repair))]
    pub async fn run(&self, options: RunOptions) -> RunReport {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!(repository = %self.ctx.name(), "controller already ran; refusing a second run");
            let mut report = RunReport::new(self.ctx.name());
            report.state = RunState::Failed;
            report.errors.push(PublishError::Configuration(format!(
                "publish controller of {} has already run",
                self.ctx.name()
            )));
            return report;
        }
        let mode = options.mode();
        let run = match &self.journal {
            Some(journal) => journal.begin(self.ctx.name(), mode).await,
            None => None,
        };
        let mut report = RunReport::new(self.ctx.name());
        self.enter(Phase::Init, run.as_ref()).await;
        self.leave(Phase::Init, run.as_ref()).await;
        let outcome = self.execute(mode, &mut report, run.as_ref()).await;
        self.close(outcome, report, run).await
    }

    async fn execute(
        &self,
        mode: ReconcileMode,
        report: &mut RunReport,
        run: Option<&JournalRun>,
    ) -> Result<(), PublishError> {
        self.enter(Phase::CheckSchemas, run).await;
        let reconciled = reconcile(&self.ctx, self.target.as_ref(), self.source.as_ref(), mode).await?;
        let ok = reconciled.success;
        let diagnostics = reconciled.diagnostics.join("; ");
        report.reconcile = Some(reconciled);
        self.leave(Phase::CheckSchemas, run).await;
        if !ok {
            return Err(PublishError::Configuration(format!(
                "reconciliation of {} failed: {}",
                self.ctx.name(),
                diagnostics
            )));
        }
        if mode.check_only {
            return Ok(());
        }

        self.enter(Phase::WaitForMigrations, run).await;
        wait_for_migrations(&self.ctx, self.target.as_ref(), &self.cancel).await?;
        self.leave(Phase::WaitForMigrations, run).await;

        let cache = self.cache.clone();
        let render = Arc::new(RenderStage::new(
            self.ctx.clone(),
            self.source.clone(),
            self.renderer.clone(),
            cache.clone(),
        ));
        let writer = Arc::new(Writer::new(
            self.ctx.clone(),
            self.target.clone(),
            self.source.clone(),
            render.clone(),
            cache.clone(),
            self.locks.clone(),
        ));
        *self.postponed.lock().unwrap_or_else(|p| p.into_inner()) = Some(writer.postponed_counter());

        let (queue, rx) = write_queue(self.ctx.app.write_queue_capacity, self.queue_depth.clone());
        let consumer = tokio::spawn(run_consumer(
            writer.clone(),
            rx,
            self.tracker.clone(),
            self.cancel.clone(),
            self.errors.clone(),
        ));
        let mut renders = JoinSet::new();

        let result = self
            .publish(&render, &writer, &cache, &queue, &mut renders, report, run)
            .await;

        if result.is_err() {
            self.cancel.cancel();
        }
        if self.cancel.is_cancelled() {
            renders.abort_all();
        }
        while let Some(joined) = renders.join_next().await {
            if let Err(err) = joined {
                if !err.is_cancelled() {
                    error!(error = %err, "render task panicked");
                }
            }
        }
        queue.stop().await;
        if let Err(err) = consumer.await {
            error!(error = %err, "write consumer panicked");
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn publish(
        &self,
        render: &Arc<RenderStage>,
        writer: &Arc<Writer>,
        cache: &Arc<ExistenceCache>,
        queue: &WriteQueue,
        renders: &mut JoinSet<()>,
        report: &mut RunReport,
        run: Option<&JournalRun>,
    ) -> Result<(), PublishError> {
        self.enter(Phase::PublishFoldersAndFiles, run).await;
        // Pages are known as pending before folders render references to them.
        let folders = self.collect(&[ObjectType::Folder, ObjectType::File], cache).await?;
        let pages = self.collect(&[ObjectType::Page, ObjectType::Form], cache).await?;
        self.schedule(folders, render, queue, renders).await?;
        self.tracker.wait_idle(&self.cancel, IDLE_POLL).await?;
        self.leave(Phase::PublishFoldersAndFiles, run).await;

        self.enter(Phase::PublishPages, run).await;
        self.schedule(pages, render, queue, renders).await?;
        self.tracker.wait_idle(&self.cancel, IDLE_POLL).await?;
        self.leave(Phase::PublishPages, run).await;

        let checker =
            ConsistencyChecker::build(self.ctx.clone(), self.target.clone(), self.source.clone())
                .await?;

        self.enter(Phase::CheckOfflineFiles, run).await;
        report.offline_files = checker.check_offline_files(&self.cancel).await?;
        self.leave(Phase::CheckOfflineFiles, run).await;

        self.enter(Phase::HandlePostponedTasks, run).await;
        if let Some(run) = run {
            for attempt in writer.postponed_tasks() {
                run.postponed(&attempt).await;
            }
        }
        let mut fatal = None;
        for err in writer.replay_postponed(&self.cancel).await {
            if err.is_fatal() && fatal.is_none() {
                fatal = Some(err);
            } else {
                self.errors.push(err);
            }
        }
        if let Some(err) = fatal {
            return Err(err);
        }
        self.leave(Phase::HandlePostponedTasks, run).await;

        self.enter(Phase::RemoveOfflineObjects, run).await;
        report.consistency = Some(checker.run(&self.cancel).await?);
        self.leave(Phase::RemoveOfflineObjects, run).await;

        self.enter(Phase::WaitForRenderers, run).await;
        self.tracker.wait_renders(&self.cancel, IDLE_POLL).await?;
        self.leave(Phase::WaitForRenderers, run).await;

        self.enter(Phase::WaitForWriteTasks, run).await;
        self.tracker.wait_idle(&self.cancel, IDLE_POLL).await?;
        self.leave(Phase::WaitForWriteTasks, run).await;
        Ok(())
    }

    /// Turns the dirt entries of `types` into units and marks them pending.
    /// Entries whose object is gone or no longer belongs to the repository are
    /// acknowledged right away and their objects cached as missing.
    async fn collect(
        &self,
        types: &[ObjectType],
        cache: &ExistenceCache,
    ) -> Result<Vec<ScheduledUnit>, PublishError> {
        let repository = self.ctx.name();
        let mut units = Vec::new();
        for entry in self.source.dirted_objects(repository, types).await? {
            if entry.action.is_removal() {
                continue;
            }
            self.cancel.check()?;
            let Some(object) = self.source.object(entry.key).await? else {
                debug!(object = %entry.key, "dirted object vanished");
                cache.missing(entry.key);
                self.source.report_done(repository, entry.id).await?;
                continue;
            };
            if !self.source.must_contain(&object, repository, entry.site_id).await? {
                debug!(object = %entry.key, site_id = entry.site_id, "object does not belong here");
                cache.missing(entry.key);
                self.source.report_done(repository, entry.id).await?;
                continue;
            }
            units.push(ScheduledUnit::new(entry.site_id, object).with_dirt_id(entry.id));
        }
        for unit in &units {
            cache.schedule(unit.object.key());
        }
        debug!(count = units.len(), types = ?types, "dirt entries collected");
        Ok(units)
    }

    /// Renders `units` on the bounded pool and queues their write tasks.
    async fn schedule(
        &self,
        units: Vec<ScheduledUnit>,
        render: &Arc<RenderStage>,
        queue: &WriteQueue,
        renders: &mut JoinSet<()>,
    ) -> Result<(), PublishError> {
        let repository = self.ctx.name();
        info!(count = units.len(), "scheduling renders");

        let permits = Arc::new(Semaphore::new(self.ctx.app.render_workers.max(1)));
        for unit in units {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| PublishError::Cancelled)?;
            self.cancel.check()?;
            self.tracker.render_scheduled();

            let render = render.clone();
            let queue = queue.clone();
            let tracker = self.tracker.clone();
            let cancel = self.cancel.clone();
            let errors = self.errors.clone();
            let source = self.source.clone();
            let repository = repository.to_string();
            renders.spawn(async move {
                let _permit = permit;
                match render.render(&unit).await {
                    Ok(tasks) if tasks.is_empty() => {
                        if let Some(id) = unit.dirt_id {
                            if let Err(err) = source.report_done(&repository, id).await {
                                warn!(?err, dirt_id = id, "failed to acknowledge dirt entry");
                            }
                        }
                    }
                    Ok(tasks) => {
                        for task in tasks {
                            tracker.write_scheduled();
                            if let Err(err) = queue.push(Attempt::new(task)).await {
                                tracker.write_done();
                                if !cancel.is_cancelled() {
                                    errors.push(err);
                                    cancel.cancel();
                                }
                                break;
                            }
                        }
                    }
                    Err(err) if err.is_fatal() => {
                        error!(object = %unit.object.key(), error = %err, "render failed; cancelling run");
                        errors.push(err);
                        cancel.cancel();
                    }
                    Err(err) => {
                        warn!(object = %unit.object.key(), error = %err, "render failed");
                        errors.push(err);
                    }
                }
                tracker.render_done();
            });
        }
        Ok(())
    }

    /// Reports every collected error and records the end of the run.
    async fn close(
        &self,
        outcome: Result<(), PublishError>,
        mut report: RunReport,
        run: Option<JournalRun>,
    ) -> RunReport {
        let mut errors = self.errors.take();
        if let Err(err) = outcome {
            // A cancellation caused by an error already collected adds nothing.
            if !(matches!(err, PublishError::Cancelled) && !errors.is_empty()) {
                errors.push(err);
            }
        }
        for err in &errors {
            match err.object() {
                Some(key) => error!(repository = %self.ctx.name(), object = %key, kind = err.kind(), error = %err, "publish error"),
                None => error!(repository = %self.ctx.name(), kind = err.kind(), error = %err, "publish error"),
            }
        }

        let state = if errors.is_empty() {
            RunState::Succeeded
        } else if errors.iter().all(|e| matches!(e, PublishError::Cancelled)) {
            RunState::Cancelled
        } else {
            RunState::Failed
        };
        report.success = state == RunState::Succeeded;
        report.state = state;

        self.enter(Phase::Done, run.as_ref()).await;
        if let Some(run) = &run {
            for err in &errors {
                run.error(err).await;
            }
            run.finish(
                state,
                self.tracker.renders().total,
                self.tracker.writes().total,
                errors.len(),
            )
            .await;
        }
        self.leave(Phase::Done, run.as_ref()).await;
        info!(
            repository = %self.ctx.name(),
            state = state.as_str(),
            errors = errors.len(),
            renders = self.tracker.renders().total,
            writes = self.tracker.writes().total,
            "publish run finished"
        );
        report.errors = errors;
        report
    }
}
