use anyhow::Result;
use async_trait::async_trait;
use mesh_publisher::config::{self, Config};
use mesh_publisher::context::RepositoryContext;
use mesh_publisher::controller::{Phase, PublishController, RunOptions};
use mesh_publisher::db::{self, RunState};
use mesh_publisher::error::PublishError;
use mesh_publisher::journal::Journal;
use mesh_publisher::model::{DirtEntry, ObjectKey, ObjectType, Site, SourceObject};
use mesh_publisher::source::{SnapshotSource, SourceSystem};
use mesh_publisher::target::model::{NameRef, NodeUpsertRequest, Scope, UuidRef};
use mesh_publisher::target::{Conflict, MemoryTarget, TargetError, TargetService};
use serde_json::{json, Map};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use tokio::sync::Mutex;

const NEWS: &str = "a5470000000000000000000000000101";
const SPORTS: &str = "a5470000000000000000000000000102";

fn snapshot(dirt: &str) -> String {
    format!(
        r#"{{
      "sites": [
        {{ "repository": "mesh", "id": 1, "name": "a", "global_id": "A547.1",
          "hostname": "a.example.com", "languages": ["en", "de"], "root_folder": 100 }}
      ],
      "objects": [
        {{ "identity": {{ "key": {{ "object_type": "folder", "id": 100 }}, "global_id": "A547.100",
                        "root_of_site": 1 }},
          "name": "root", "site_id": 1, "language": "en",
          "fields": {{ "en": {{ "name": {{ "type": "text", "value": "Root" }} }} }} }},
        {{ "identity": {{ "key": {{ "object_type": "folder", "id": 101 }}, "global_id": "A547.101" }},
          "name": "news", "site_id": 1, "parent": {{ "object_type": "folder", "id": 100 }},
          "language": "en", "alternate_languages": ["de"],
          "fields": {{
            "en": {{ "name": {{ "type": "text", "value": "News" }},
                    "pub_dir_segment": {{ "type": "text", "value": "news" }} }},
            "de": {{ "name": {{ "type": "text", "value": "Neuigkeiten" }},
                    "pub_dir_segment": {{ "type": "text", "value": "neuigkeiten" }} }} }} }},
        {{ "identity": {{ "key": {{ "object_type": "folder", "id": 102 }}, "global_id": "A547.102" }},
          "name": "sports", "site_id": 1, "parent": {{ "object_type": "folder", "id": 101 }},
          "language": "en",
          "fields": {{ "en": {{ "name": {{ "type": "text", "value": "Sports" }},
                              "pub_dir_segment": {{ "type": "text", "value": "sports" }} }} }} }},
        {{ "identity": {{ "key": {{ "object_type": "folder", "id": 105 }}, "global_id": "A547.102" }},
          "name": "sports copy", "site_id": 1, "parent": {{ "object_type": "folder", "id": 101 }},
          "language": "en",
          "fields": {{ "en": {{ "name": {{ "type": "text", "value": "Sports" }} }} }} }}
      ],
      "dirt": [ {} ]
    }}"#,
        dirt
    )
}

fn dirt(id: i64, object: i64) -> String {
    format!(
        r#"{{ "repository": "mesh", "id": {}, "key": {{ "object_type": "folder", "id": {} }},
             "site_id": 1, "action": "update" }}"#,
        id, object
    )
}

fn source(dirt_entries: &[String]) -> Arc<SnapshotSource> {
    Arc::new(SnapshotSource::from_json(&snapshot(&dirt_entries.join(", "))).unwrap())
}

async fn controller(target: Arc<MemoryTarget>, source: Arc<dyn SourceSystem>, renderer: Arc<SnapshotSource>) -> PublishController {
    let cfg: Config = serde_yaml::from_str(config::example()).unwrap();
    let mut repo = cfg.repositories[0].clone();
    repo.permission_property = None;
    let mut app = cfg.app.clone();
    app.transient_retry_delay_ms = 1;
    let sites = source.sites(&repo.name).await.unwrap();
    let ctx = Arc::new(RepositoryContext::new(repo, app, sites));
    PublishController::new(ctx, target, source, renderer)
}

async fn run(target: &Arc<MemoryTarget>, source: &Arc<SnapshotSource>, options: RunOptions) -> (PublishController, mesh_publisher::controller::RunReport) {
    let controller = controller(target.clone(), source.clone(), source.clone()).await;
    let report = controller.run(options).await;
    (controller, report)
}

fn repair() -> RunOptions {
    RunOptions {
        check_only: false,
        repair: true,
    }
}

fn scope() -> Scope {
    Scope::new("a", None)
}

fn upserts(target: &MemoryTarget) -> Vec<String> {
    target
        .calls()
        .into_iter()
        .filter(|c| c.op == "upsert_node")
        .map(|c| c.target)
        .collect()
}

async fn plant_variant(target: &MemoryTarget, uuid: &str, language: &str) {
    let parent = target
        .node(&scope(), uuid, Some("en"))
        .and_then(|n| n.parent_uuid().map(str::to_string))
        .unwrap();
    let mut fields = Map::new();
    fields.insert("name".into(), json!(format!("leftover {}", language)));
    target
        .upsert_node(
            &scope(),
            uuid,
            &NodeUpsertRequest {
                language: language.into(),
                parent_node: Some(UuidRef { uuid: parent }),
                schema: NameRef {
                    name: "cms_folder".into(),
                },
                fields,
                publish: true,
                grant: None,
            },
        )
        .await
        .unwrap();
}

/// Source wrapper recording which colliding uuids were looked up.
#[derive(Clone)]
struct RecordingSource {
    inner: Arc<SnapshotSource>,
    lookups: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

#[async_trait]
impl SourceSystem for RecordingSource {
    async fn sites(&self, repository: &str) -> Result<Vec<Site>> {
        self.inner.sites(repository).await
    }
    async fn object(&self, key: ObjectKey) -> Result<Option<SourceObject>> {
        self.inner.object(key).await
    }
    async fn object_by_uuid(
        &self,
        repository: &str,
        uuid: &str,
        language: Option<&str>,
    ) -> Result<Option<SourceObject>> {
        self.lookups
            .lock()
            .await
            .push((uuid.to_string(), language.map(str::to_string)));
        self.inner.object_by_uuid(repository, uuid, language).await
    }
    async fn must_contain(&self, object: &SourceObject, repository: &str, site_id: i64) -> Result<bool> {
        self.inner.must_contain(object, repository, site_id).await
    }
    async fn dirted_objects(&self, repository: &str, types: &[ObjectType]) -> Result<Vec<DirtEntry>> {
        self.inner.dirted_objects(repository, types).await
    }
    async fn report_done(&self, repository: &str, dirt_id: i64) -> Result<()> {
        self.inner.report_done(repository, dirt_id).await
    }
    async fn repository_objects(&self, repository: &str) -> Result<Vec<SourceObject>> {
        self.inner.repository_objects(repository).await
    }
    async fn offline_files(&self, repository: &str) -> Result<Vec<ObjectKey>> {
        self.inner.offline_files(repository).await
    }
    async fn permission_values(&self, property: &str) -> Result<Option<Vec<String>>> {
        self.inner.permission_values(property).await
    }
    async fn store_permission_values(&self, property: &str, values: &[String]) -> Result<()> {
        self.inner.store_permission_values(property, values).await
    }
}

#[tokio::test]
async fn clean_create_then_check_only_is_quiet() {
    let target = Arc::new(MemoryTarget::new());
    let (_, report) = run(&target, &source(&[dirt(1, 101)]), repair()).await;
    assert!(report.success, "{:?}", report.errors);
    for name in ["cms_folder", "cms_content", "cms_binary_content", "cms_form"] {
        assert!(target.schema(name).is_some(), "{} missing", name);
    }
    assert_eq!(target.project_names(), vec!["a".to_string()]);
    assert!(target.branch("a", "a_1.0").unwrap().latest);

    target.clear_calls();
    let (controller, check) = run(
        &target,
        &source(&[dirt(1, 101)]),
        RunOptions {
            check_only: true,
            repair: false,
        },
    )
    .await;
    assert!(check.success, "{:?}", check.errors);
    assert!(check.reconcile.unwrap().repairs.is_empty());
    assert!(target.mutations().is_empty(), "{:?}", target.mutations());
    assert_eq!(controller.phase(), Phase::Done);
}

#[tokio::test]
async fn reconciling_correct_schemas_sends_no_updates() {
    let target = Arc::new(MemoryTarget::new());
    let (_, first) = run(&target, &source(&[]), repair()).await;
    assert!(first.success, "{:?}", first.errors);
    target.clear_calls();
    let (_, second) = run(&target, &source(&[]), repair()).await;
    assert!(second.success, "{:?}", second.errors);
    assert!(!target
        .calls()
        .iter()
        .any(|c| c.op == "update_schema" || c.op == "update_microschema"));
}

#[tokio::test]
async fn language_fan_out_removes_unexpected_variant() {
    let target = Arc::new(MemoryTarget::new());
    let (_, first) = run(&target, &source(&[dirt(1, 101)]), repair()).await;
    assert!(first.success, "{:?}", first.errors);
    plant_variant(&target, NEWS, "fr").await;

    target.clear_calls();
    let (controller, second) = run(&target, &source(&[dirt(1, 101)]), RunOptions::default()).await;
    assert!(second.success, "{:?}", second.errors);
    assert_eq!(controller.status().writes_total, 2);
    assert_eq!(
        upserts(&target),
        vec![format!("{}/en", NEWS), format!("{}/de", NEWS)]
    );
    let deleted: Vec<String> = target
        .mutations()
        .into_iter()
        .filter(|c| c.op == "delete_language")
        .map(|c| c.target)
        .collect();
    assert_eq!(deleted, vec![format!("{}/fr", NEWS)]);
    let mut languages = target.node(&scope(), NEWS, None).unwrap().available_languages;
    languages.sort();
    assert_eq!(languages, vec!["de".to_string(), "en".to_string()]);
}

#[tokio::test]
async fn stale_collision_is_removed_without_postponement() {
    let target = Arc::new(MemoryTarget::new());
    let (_, first) = run(&target, &source(&[dirt(1, 102)]), repair()).await;
    assert!(first.success, "{:?}", first.errors);
    plant_variant(&target, SPORTS, "de").await;
    target.inject_upsert_error(
        SPORTS,
        TargetError::Conflict(Conflict {
            message: "segment taken".into(),
            conflicting_uuid: Some(SPORTS.into()),
            conflicting_language: Some("de".into()),
            field: Some("pub_dir_segment".into()),
        }),
    );

    let inner = source(&[dirt(1, 102)]);
    let recording = RecordingSource {
        inner: inner.clone(),
        lookups: Arc::new(Mutex::new(Vec::new())),
    };
    let controller = controller(target.clone(), Arc::new(recording.clone()), inner).await;
    let report = controller.run(RunOptions::default()).await;
    assert!(report.success, "{:?}", report.errors);
    assert_eq!(controller.status().postponed, 0);
    assert_eq!(
        *recording.lookups.lock().await,
        vec![(SPORTS.to_string(), Some("de".to_string()))]
    );
    let node = target.node(&scope(), SPORTS, None).unwrap();
    assert_eq!(node.available_languages, vec!["en".to_string()]);
}

#[tokio::test]
async fn missing_parent_is_written_first() {
    let target = Arc::new(MemoryTarget::new());
    let (_, report) = run(&target, &source(&[dirt(1, 102)]), repair()).await;
    assert!(report.success, "{:?}", report.errors);
    let writes = upserts(&target);
    let news = writes.iter().position(|w| w == &format!("{}/en", NEWS)).unwrap();
    let last_sports = writes.iter().rposition(|w| w == &format!("{}/en", SPORTS)).unwrap();
    assert!(news < last_sports, "{:?}", writes);
    let sports = target.node(&scope(), SPORTS, Some("en")).unwrap();
    assert_eq!(sports.parent_uuid(), Some(NEWS));
}

#[tokio::test]
async fn repeated_conflict_after_replay_fails_the_object_and_is_journaled() {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    let target = Arc::new(MemoryTarget::new());
    let (_, first) = run(&target, &source(&[]), repair()).await;
    assert!(first.success, "{:?}", first.errors);
    let conflict = || {
        TargetError::Conflict(Conflict {
            message: "segment taken".into(),
            conflicting_uuid: Some(SPORTS.into()),
            conflicting_language: Some("en".into()),
            field: None,
        })
    };
    target.inject_upsert_error(SPORTS, conflict());
    target.inject_upsert_error(SPORTS, conflict());

    let src = source(&[dirt(1, 102)]);
    let controller = controller(target.clone(), src.clone(), src)
        .await
        .with_journal(Journal::new(pool.clone()));
    let report = controller.run(RunOptions::default()).await;
    assert!(!report.success);
    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.errors.len(), 1);
    assert!(matches!(report.errors[0], PublishError::PostponedTwice { .. }));
    assert!(target.node(&scope(), SPORTS, None).is_none());

    let last = db::last_run(&pool, Some("mesh")).await.unwrap().unwrap();
    assert_eq!(last.state, RunState::Failed);
    assert_eq!(db::count_postponed(&pool, last.id).await.unwrap(), 1);
    let errors = db::run_errors(&pool, last.id).await.unwrap();
    assert_eq!(errors[0].kind, "postponed_twice");
    assert_eq!(errors[0].object_id, Some(102));
    let phases = db::run_phases(&pool, last.id).await.unwrap();
    assert_eq!(phases.len(), 11);
    assert!(phases.iter().all(|p| p.done_at.is_some()));
}

#[tokio::test]
async fn two_sources_for_one_item_are_refused() {
    let target = Arc::new(MemoryTarget::new());
    let (_, first) = run(&target, &source(&[dirt(1, 101)]), repair()).await;
    assert!(first.success, "{:?}", first.errors);

    let (_, report) = run(&target, &source(&[dirt(1, 102), dirt(2, 105)]), RunOptions::default()).await;
    assert!(!report.success);
    assert_eq!(report.errors.len(), 1);
    assert!(matches!(report.errors[0], PublishError::DuplicateIdentity { .. }));
    assert!(target.node(&scope(), SPORTS, Some("en")).is_some());
}
