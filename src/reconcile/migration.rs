use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, error, info, instrument};

use crate::context::{BranchInfo, RepositoryContext};
use crate::error::PublishError;
use crate::target::model::MigrationState;
use crate::target::TargetService;
use crate::tracker::Cancellation;

/// Polls the migration status of every reconciled branch until no schema or
/// microschema migration is queued or running.
#[instrument(skip_all, fields(repository = %ctx.name()))]
pub async fn wait_for_migrations(
    ctx: &RepositoryContext,
    target: &dyn TargetService,
    cancel: &Cancellation,
) -> Result<(), PublishError> {
    let branches: Vec<(String, BranchInfo)> = ctx
        .projects()
        .into_iter()
        .flat_map(|p| {
            let name = p.name;
            p.default_branch
                .into_iter()
                .chain(p.channel_branches.into_values())
                .map(move |b| (name.clone(), b))
        })
        .collect();
    let poll = ctx.app.migration_poll_interval();
    let started = Instant::now();
    let mut running: HashSet<(String, String, String)> = HashSet::new();

    loop {
        cancel.check()?;
        let mut pending = 0usize;
        for (project, branch) in &branches {
            let status = target.branch_migration_status(project, &branch.uuid).await?;
            for job in status.schemas.iter().chain(status.microschemas.iter()) {
                let key = (branch.uuid.clone(), job.name.clone(), job.version.clone());
                match job.status {
                    MigrationState::Failed => {
                        error!(branch = %branch.name, schema = %job.name, version = %job.version, "migration failed");
                        return Err(PublishError::MigrationFailed {
                            branch: branch.name.clone(),
                            name: job.name.clone(),
                            version: job.version.clone(),
                        });
                    }
                    MigrationState::Queued | MigrationState::Running => {
                        pending += 1;
                        running.insert(key);
                    }
                    MigrationState::Completed => {
                        if running.remove(&key) {
                            info!(
                                branch = %branch.name,
                                schema = %job.name,
                                version = %job.version,
                                waited_ms = started.elapsed().as_millis() as u64,
                                "migration completed"
                            );
                        }
                    }
                }
            }
        }
        if pending == 0 {
            return Ok(());
        }
        debug!(pending, "waiting for migrations");
        tokio::time::sleep(poll).await;
    }
}
