use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;
use mesh_publisher::config;
use mesh_publisher::mapping::expected_schema;
use mesh_publisher::model::ObjectType;
use mesh_publisher::reconcile::is_noise;
use mesh_publisher::target::{MeshClient, TargetService};

#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Repository to inspect
    #[arg(long)]
    repository: String,

    /// Restrict to one content kind (folder, page, file, form)
    #[arg(long)]
    kind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let cfg = config::load(Some(&args.config))?;
    let repo = cfg
        .repository(&args.repository)
        .ok_or_else(|| anyhow!("unknown repository {}", args.repository))?;
    let kinds = match &args.kind {
        Some(k) => vec![ObjectType::parse(k).ok_or_else(|| anyhow!("unknown kind {}", k))?],
        None => ObjectType::ALL.to_vec(),
    };
    let client = MeshClient::new(&repo.url, repo.token.clone())?;

    for kind in kinds {
        let expected = expected_schema(repo, kind)?;
        println!("== {} ({})", expected.name, kind);
        println!("expected:\n{}", serde_json::to_string_pretty(&expected)?);
        let Some(existing) = client.find_schema(&expected.name).await? else {
            println!("existing: none");
            continue;
        };
        println!(
            "existing (version {}):\n{}",
            existing.version,
            serde_json::to_string_pretty(&existing.model)?
        );
        let changes: Vec<_> = client
            .diff_schema(&existing.uuid, &expected)
            .await?
            .into_iter()
            .filter(|c| !is_noise(c, &existing.model.url_fields))
            .collect();
        if changes.is_empty() {
            println!("diff: no changes");
        } else {
            println!("diff:\n{}", serde_json::to_string_pretty(&changes)?);
        }
    }
    Ok(())
}
