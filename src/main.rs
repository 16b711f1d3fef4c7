use anyhow::{Context, Result};
use clap::Parser;
use mesh_publisher::config::{self, Config};
use mesh_publisher::context::RepositoryContext;
use mesh_publisher::controller::{PublishController, RunOptions, RunReport};
use mesh_publisher::db;
use mesh_publisher::journal::Journal;
use mesh_publisher::lock::NamedLocks;
use mesh_publisher::source::{SnapshotSource, SourceSystem};
use mesh_publisher::target::{MemoryTarget, MeshClient, TargetService};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Source system snapshot (JSON export)
    #[arg(long)]
    source: Option<PathBuf>,

    /// Only check the target structure, change nothing
    #[arg(long)]
    check_only: bool,

    /// Update deviating schemas, branches and projects
    #[arg(long)]
    repair: bool,

    /// Publish into an in-memory target instead of the configured one
    #[arg(long)]
    dry_run: bool,

    /// Print the last journaled run per repository and exit
    #[arg(long)]
    status: bool,
}

fn database_url(cfg: &Config) -> String {
    std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/journal.db", cfg.app.resolved_data_dir()))
}

async fn print_status(cfg: &Config) -> Result<()> {
    let journal = Journal::open(&database_url(cfg)).await?;
    for repo in &cfg.repositories {
        let Some(run) = db::last_run(journal.pool(), Some(&repo.name)).await? else {
            println!("{}: no runs recorded", repo.name);
            continue;
        };
        let phases = db::run_phases(journal.pool(), run.id).await?;
        let errors = db::run_errors(journal.pool(), run.id).await?;
        let out = serde_json::json!({ "run": run, "phases": phases, "errors": errors });
        println!("{}", serde_json::to_string_pretty(&out)?);
    }
    Ok(())
}

fn summarize(report: &RunReport) {
    if let Some(reconcile) = &report.reconcile {
        for line in &reconcile.diagnostics {
            info!(repository = %report.repository, "{}", line);
        }
        for line in &reconcile.repairs {
            info!(repository = %report.repository, "repaired: {}", line);
        }
    }
    if let Some(c) = &report.consistency {
        info!(
            repository = %report.repository,
            removed = c.removed,
            taken_offline = c.taken_offline,
            kept = c.kept,
            scrubbed = c.scrubbed,
            offline_files = report.offline_files,
            "consistency"
        );
    }
    if report.success {
        info!(repository = %report.repository, "run succeeded");
    } else {
        error!(repository = %report.repository, state = report.state.as_str(), errors = report.errors.len(), "run failed");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    if args.status {
        return print_status(&cfg).await;
    }

    let snapshot = args
        .source
        .as_deref()
        .context("--source is required unless --status is given")?;
    let source = Arc::new(SnapshotSource::load(snapshot).await?);

    let journal = if cfg.app.journal {
        match Journal::open(&database_url(&cfg)).await {
            Ok(journal) => Some(journal),
            Err(err) => {
                warn!(?err, "journal unavailable; continuing without it");
                None
            }
        }
    } else {
        None
    };

    let options = RunOptions {
        check_only: args.check_only,
        repair: args.repair,
    };
    let locks = Arc::new(NamedLocks::new());
    let mut runs = JoinSet::new();
    for repo in &cfg.repositories {
        let sites = source.sites(&repo.name).await?;
        if sites.is_empty() {
            warn!(repository = %repo.name, "no sites publish into this repository");
        }
        let target: Arc<dyn TargetService> = if args.dry_run {
            Arc::new(MemoryTarget::new())
        } else {
            Arc::new(MeshClient::new(&repo.url, repo.token.clone())?)
        };
        let ctx = Arc::new(RepositoryContext::new(repo.clone(), cfg.app.clone(), sites));
        let mut controller =
            PublishController::new(ctx, target, source.clone(), source.clone()).with_locks(locks.clone());
        if let Some(journal) = &journal {
            controller = controller.with_journal(journal.clone());
        }
        runs.spawn(async move { controller.run(options).await });
    }

    let mut failed = 0usize;
    while let Some(joined) = runs.join_next().await {
        match joined {
            Ok(report) => {
                summarize(&report);
                if !report.success {
                    failed += 1;
                }
            }
            Err(err) => {
                error!(error = %err, "publish run panicked");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        error!(failed, "publish finished with failures");
        std::process::exit(1);
    }
    Ok(())
}
