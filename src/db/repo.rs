use super::model::{ErrorRecord, PhaseRecord, RunState, RunSummary};
use crate::model::ObjectKey;
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use sqlx::SqlitePool;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open journal {}", normalized))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    // Rebuild URL, prefer sqlite:// form; create the file when missing.
    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    match query_part {
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn begin_run(pool: &Pool, repository: &str, check_only: bool, repair: bool) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO runs (repository, check_only, repair, state, started_at) VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(repository)
    .bind(check_only)
    .bind(repair)
    .bind(RunState::Running.as_str())
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

#[instrument(skip_all)]
pub async fn phase_begin(pool: &Pool, run_id: i64, phase: &str) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO run_phases (run_id, phase, began_at) VALUES (?, ?, ?)")
        .bind(run_id)
        .bind(phase)
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn phase_done(pool: &Pool, run_id: i64, phase: &str) -> Result<()> {
    sqlx::query("UPDATE run_phases SET done_at = ? WHERE run_id = ? AND phase = ?")
        .bind(Utc::now())
        .bind(run_id)
        .bind(phase)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn record_error(
    pool: &Pool,
    run_id: i64,
    kind: &str,
    object: Option<ObjectKey>,
    message: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO run_errors (run_id, kind, object_type, object_id, message) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(run_id)
    .bind(kind)
    .bind(object.map(|k| k.object_type.as_str()))
    .bind(object.map(|k| k.id))
    .bind(message)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn record_postponed(
    pool: &Pool,
    run_id: i64,
    key: ObjectKey,
    uuid: &str,
    language: &str,
    reason: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO postponed_tasks (run_id, object_type, object_id, uuid, language, reason) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(run_id)
    .bind(key.object_type.as_str())
    .bind(key.id)
    .bind(uuid)
    .bind(language)
    .bind(reason)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn finish_run(
    pool: &Pool,
    run_id: i64,
    state: RunState,
    renders_total: i64,
    writes_total: i64,
    error_count: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE runs SET state = ?, finished_at = ?, renders_total = ?, writes_total = ?, error_count = ? WHERE id = ?",
    )
    .bind(state.as_str())
    .bind(Utc::now())
    .bind(renders_total)
    .bind(writes_total)
    .bind(error_count)
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(())
}

fn run_from_row(row: &SqliteRow) -> Result<RunSummary> {
    let state: String = row.get("state");
    Ok(RunSummary {
        id: row.get("id"),
        repository: row.get("repository"),
        check_only: row.get("check_only"),
        repair: row.get("repair"),
        state: RunState::parse_state(&state)
            .with_context(|| format!("unknown run state {}", state))?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        renders_total: row.get("renders_total"),
        writes_total: row.get("writes_total"),
        error_count: row.get("error_count"),
    })
}

/// Most recent run, optionally restricted to one repository.
#[instrument(skip_all)]
pub async fn last_run(pool: &Pool, repository: Option<&str>) -> Result<Option<RunSummary>> {
    let row = sqlx::query(
        "SELECT * FROM runs WHERE (?1 IS NULL OR repository = ?1) ORDER BY id DESC LIMIT 1",
    )
    .bind(repository)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(run_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn run_phases(pool: &Pool, run_id: i64) -> Result<Vec<PhaseRecord>> {
    let rows = sqlx::query("SELECT phase, began_at, done_at FROM run_phases WHERE run_id = ? ORDER BY id")
        .bind(run_id)
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|r| {
            Ok(PhaseRecord {
                phase: r.get("phase"),
                began_at: r.try_get("began_at")?,
                done_at: r.try_get("done_at")?,
            })
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn run_errors(pool: &Pool, run_id: i64) -> Result<Vec<ErrorRecord>> {
    let rows = sqlx::query(
        "SELECT kind, object_type, object_id, message FROM run_errors WHERE run_id = ? ORDER BY id",
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(|r| ErrorRecord {
            kind: r.get("kind"),
            object_type: r.get("object_type"),
            object_id: r.get("object_id"),
            message: r.get("message"),
        })
        .collect())
}

#[instrument(skip_all)]
pub async fn count_postponed(pool: &Pool, run_id: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM postponed_tasks WHERE run_id = ?")
        .bind(run_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::ObjectType;
    use sqlx::sqlite::SqlitePoolOptions;

    pub(crate) async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[test]
    fn sqlite_url_is_normalized() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/nested/journal.db", dir.path().display());
        let normalized = prepare_sqlite_url(&url);
        assert!(normalized.ends_with("nested/journal.db?mode=rwc"));
        assert!(dir.path().join("nested").is_dir());
    }

    #[tokio::test]
    async fn run_lifecycle_is_recorded() {
        let pool = setup_pool().await;
        let run = begin_run(&pool, "mesh", false, true).await.unwrap();
        phase_begin(&pool, run, "check_schemas").await.unwrap();
        phase_done(&pool, run, "check_schemas").await.unwrap();
        phase_begin(&pool, run, "publish_pages").await.unwrap();
        let key = ObjectKey::new(ObjectType::Page, 7);
        record_error(&pool, run, "write", Some(key), "boom").await.unwrap();
        record_postponed(&pool, run, key, "u", "en", Some("conflict"))
            .await
            .unwrap();
        finish_run(&pool, run, RunState::Failed, 3, 4, 1).await.unwrap();

        let last = last_run(&pool, Some("mesh")).await.unwrap().unwrap();
        assert_eq!(last.id, run);
        assert_eq!(last.state, RunState::Failed);
        assert!(last.repair && !last.check_only);
        assert_eq!((last.renders_total, last.writes_total, last.error_count), (3, 4, 1));
        assert!(last.finished_at.is_some());

        let phases = run_phases(&pool, run).await.unwrap();
        assert_eq!(phases.len(), 2);
        assert!(phases[0].done_at.is_some());
        assert!(phases[1].done_at.is_none());

        let errors = run_errors(&pool, run).await.unwrap();
        assert_eq!(errors[0].object_type.as_deref(), Some("page"));
        assert_eq!(errors[0].object_id, Some(7));
        assert_eq!(count_postponed(&pool, run).await.unwrap(), 1);
        assert!(last_run(&pool, Some("other")).await.unwrap().is_none());
        assert_eq!(last_run(&pool, None).await.unwrap().unwrap().id, run);
    }
}
