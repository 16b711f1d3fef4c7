//! Structural reconciliation of a target repository.
//!
//! Brings schemas, microschemas, projects, branches and role permissions in
//! the target system in line with the repository configuration. Sub-checks
//! record problems in the report instead of returning early, so one pass
//! lists everything that is wrong. Without `repair`, the run stops after the
//! first step that found a problem.
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::context::RepositoryContext;
use crate::error::PublishError;
use crate::source::SourceSystem;
use crate::target::TargetService;

mod branch;
mod migration;
mod permission;
mod project;
mod schema;

pub use migration::wait_for_migrations;
pub use schema::is_noise;

/// What the reconciler may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ReconcileMode {
    /// Only report; never create or update anything.
    pub check_only: bool,
    /// Update elements that exist but deviate from the configuration.
    pub repair: bool,
}

impl ReconcileMode {
    pub fn check_only() -> Self {
        Self {
            check_only: true,
            repair: false,
        }
    }

    pub fn repair() -> Self {
        Self {
            check_only: false,
            repair: true,
        }
    }

    /// Missing elements are created unless only checking.
    pub fn may_create(&self) -> bool {
        !self.check_only
    }

    pub fn may_update(&self) -> bool {
        self.repair && !self.check_only
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub success: bool,
    pub diagnostics: Vec<String>,
    /// Changes made to the target system.
    pub repairs: Vec<String>,
}

impl ReconcileReport {
    fn new() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub(crate) fn fail(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        warn!(problem = %msg, "reconciliation problem");
        self.success = false;
        self.diagnostics.push(msg);
    }

    pub(crate) fn note(&mut self, msg: impl Into<String>) {
        self.diagnostics.push(msg.into());
    }

    pub(crate) fn repaired(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        info!(change = %msg, "reconciled");
        self.repairs.push(msg);
    }
}

pub struct Reconciler<'a> {
    ctx: &'a RepositoryContext,
    target: &'a dyn TargetService,
    source: &'a dyn SourceSystem,
    mode: ReconcileMode,
    report: ReconcileReport,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        ctx: &'a RepositoryContext,
        target: &'a dyn TargetService,
        source: &'a dyn SourceSystem,
        mode: ReconcileMode,
    ) -> Self {
        Self {
            ctx,
            target,
            source,
            mode,
            report: ReconcileReport::new(),
        }
    }

    fn stop_here(&self) -> bool {
        !self.report.success && !self.mode.repair
    }

    /// Runs all steps in order and fills the repository context with the
    /// resolved projects, branches and schema versions.
    #[instrument(skip_all, fields(repository = %self.ctx.name(), check_only = self.mode.check_only, repair = self.mode.repair))]
    pub async fn run(mut self) -> Result<ReconcileReport, PublishError> {
        if !self.check_path_settings() {
            return Ok(self.report);
        }
        self.reconcile_schemas().await?;
        if self.stop_here() {
            return Ok(self.report);
        }
        self.reconcile_microschemas().await?;
        if self.stop_here() {
            return Ok(self.report);
        }
        let projects = self.reconcile_projects().await?;
        if self.stop_here() {
            return Ok(self.report);
        }
        self.reconcile_branches(&projects).await?;
        if self.stop_here() {
            return Ok(self.report);
        }
        self.reconcile_alternative_projects().await?;
        if self.stop_here() {
            return Ok(self.report);
        }
        self.check_permission_property().await?;
        Ok(self.report)
    }

    /// All sites of one repository must agree on the publish directory
    /// segment setting. Mixed settings abort the reconciliation.
    fn check_path_settings(&mut self) -> bool {
        let mut settings = self.ctx.sites.iter().map(|s| s.publish_dir_segment);
        let Some(first) = settings.next() else {
            return true;
        };
        if settings.all(|s| s == first) {
            return true;
        }
        let (with, without): (Vec<_>, Vec<_>) = self
            .ctx
            .sites
            .iter()
            .partition(|s| s.publish_dir_segment);
        self.report.fail(format!(
            "sites disagree on publish directory segments: [{}] use them, [{}] do not",
            with.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(", "),
            without.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(", "),
        ));
        false
    }
}

/// Reconciles one repository.
pub async fn reconcile(
    ctx: &RepositoryContext,
    target: &dyn TargetService,
    source: &dyn SourceSystem,
    mode: ReconcileMode,
) -> Result<ReconcileReport, PublishError> {
    Reconciler::new(ctx, target, source, mode).run().await
}
