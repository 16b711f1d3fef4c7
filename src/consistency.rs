//! Post-run consistency: removes or takes offline target items that should
//! not exist any more, and scrubs content left in alternative projects.
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::context::RepositoryContext;
use crate::error::PublishError;
use crate::identity::IdentityMapper;
use crate::model::{DirtAction, DirtEntry, ObjectKey, ObjectType};
use crate::source::SourceSystem;
use crate::target::model::Scope;
use crate::target::{TargetError, TargetService};
use crate::tracker::Cancellation;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub removed: usize,
    pub taken_offline: usize,
    /// Removals skipped because another source object still needs the item.
    pub kept: usize,
    pub scrubbed: usize,
}

fn gone(res: Result<(), TargetError>) -> Result<(), TargetError> {
    match res {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

pub struct ConsistencyChecker {
    ctx: Arc<RepositoryContext>,
    target: Arc<dyn TargetService>,
    source: Arc<dyn SourceSystem>,
    mapper: IdentityMapper,
    /// Source objects currently producing each target uuid, with the language
    /// they write. Language variants of a page share one uuid.
    producers: HashMap<String, BTreeSet<(ObjectKey, Option<String>)>>,
}

impl ConsistencyChecker {
    /// Builds the uuid to producer table from the objects the repository
    /// currently publishes.
    #[instrument(skip_all, fields(repository = %ctx.name()))]
    pub async fn build(
        ctx: Arc<RepositoryContext>,
        target: Arc<dyn TargetService>,
        source: Arc<dyn SourceSystem>,
    ) -> Result<Self, PublishError> {
        let mapper = ctx.mapper();
        let mut producers: HashMap<String, BTreeSet<(ObjectKey, Option<String>)>> = HashMap::new();
        for object in source.repository_objects(ctx.name()).await? {
            match mapper.target_wire(&object.identity) {
                Ok(uuid) => {
                    producers
                        .entry(uuid)
                        .or_default()
                        .insert((object.key(), object.language.clone()));
                }
                Err(err) => warn!(object = %object.key(), error = %err, "object has no target identity"),
            }
        }
        debug!(uuids = producers.len(), "identity table built");
        Ok(Self {
            ctx,
            target,
            source,
            mapper,
            producers,
        })
    }

    /// Whether any current producer of `uuid` must still exist in the site.
    /// With a `language`, only producers of that language count.
    async fn still_needed(
        &self,
        uuid: &str,
        language: Option<&str>,
        site_id: i64,
    ) -> Result<bool, PublishError> {
        let Some(producers) = self.producers.get(uuid) else {
            return Ok(false);
        };
        for (key, produced) in producers {
            if let (Some(want), Some(have)) = (language, produced.as_deref()) {
                if want != have {
                    continue;
                }
            }
            let Some(object) = self.source.object(*key).await? else {
                continue;
            };
            if self
                .source
                .must_contain(&object, self.ctx.name(), site_id)
                .await?
            {
                debug!(uuid, producer = %key, "item is still produced");
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn entry_uuid(&self, entry: &DirtEntry) -> Result<Option<String>, PublishError> {
        if let Some(uuid) = &entry.uuid {
            return Ok(Some(uuid.clone()));
        }
        Ok(match self.source.object(entry.key).await? {
            Some(object) => Some(self.mapper.target_wire(&object.identity)?),
            None => None,
        })
    }

    /// Handles the removal entries of the dirt queue. An item is only removed
    /// or taken offline when no source object still needs it in that site.
    #[instrument(skip_all, fields(repository = %self.ctx.name()))]
    pub async fn remove_offline_objects(&self, cancel: &Cancellation) -> Result<ConsistencyReport, PublishError> {
        let repository = self.ctx.name();
        let mut report = ConsistencyReport::default();
        let entries = self
            .source
            .dirted_objects(repository, &ObjectType::ALL)
            .await?;
        for entry in entries.into_iter().filter(|e| e.action.is_removal()) {
            cancel.check()?;
            let Some(uuid) = self.entry_uuid(&entry).await? else {
                debug!(object = %entry.key, "removed object has no known target item");
                self.source.report_done(repository, entry.id).await?;
                continue;
            };
            let language = entry
                .language
                .as_deref()
                .filter(|_| entry.key.object_type == ObjectType::Page);
            if self.still_needed(&uuid, language, entry.site_id).await? {
                report.kept += 1;
                self.source.report_done(repository, entry.id).await?;
                continue;
            }
            let scope = self.ctx.scope_for_site(entry.site_id)?;
            let res = match (entry.action, language) {
                (DirtAction::Offline, _) => {
                    report.taken_offline += 1;
                    self.target.take_offline(&scope, &uuid).await
                }
                (_, Some(lang)) => {
                    report.removed += 1;
                    self.target.delete_language(&scope, &uuid, lang).await
                }
                (_, None) => {
                    report.removed += 1;
                    self.target.delete_node(&scope, &uuid).await
                }
            };
            gone(res)?;
            info!(
                object_type = %entry.key.object_type,
                object_id = entry.key.id,
                uuid = %uuid,
                action = ?entry.action,
                "removed item from target"
            );
            self.source.report_done(repository, entry.id).await?;
        }
        Ok(report)
    }

    /// Takes files offline that the source system no longer uses.
    #[instrument(skip_all, fields(repository = %self.ctx.name()))]
    pub async fn check_offline_files(&self, cancel: &Cancellation) -> Result<usize, PublishError> {
        let repository = self.ctx.name();
        let mut count = 0;
        for key in self.source.offline_files(repository).await? {
            cancel.check()?;
            let Some(object) = self.source.object(key).await? else {
                continue;
            };
            let uuid = self.mapper.target_wire(&object.identity)?;
            let scope = self.ctx.scope_for_site(object.site_id)?;
            gone(self.target.take_offline(&scope, &uuid).await)?;
            debug!(file = %key, uuid = %uuid, "file taken offline");
            count += 1;
        }
        Ok(count)
    }

    /// Deletes items below the root of alternative projects that this
    /// repository now publishes elsewhere.
    #[instrument(skip_all, fields(repository = %self.ctx.name()))]
    pub async fn scrub_alternative_projects(&self, cancel: &Cancellation) -> Result<usize, PublishError> {
        let mut scrubbed = 0;
        for project in self.ctx.alternative_projects() {
            let scope = Scope::new(project.name.clone(), None);
            let children = match self
                .target
                .list_children(&scope, &project.root_node.uuid)
                .await
            {
                Ok(children) => children,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };
            for child in children {
                cancel.check()?;
                if !self.producers.contains_key(&child.uuid) {
                    continue;
                }
                gone(self.target.delete_node(&scope, &child.uuid).await)?;
                info!(project = %project.name, uuid = %child.uuid, "scrubbed item from alternative project");
                scrubbed += 1;
            }
        }
        Ok(scrubbed)
    }

    /// Runs the removal and scrub steps of a run.
    pub async fn run(&self, cancel: &Cancellation) -> Result<ConsistencyReport, PublishError> {
        let mut report = self.remove_offline_objects(cancel).await?;
        report.scrubbed = self.scrub_alternative_projects(cancel).await?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::{context, site};
    use crate::reconcile::{reconcile, ReconcileMode};
    use crate::source::SnapshotSource;
    use crate::target::model::{NameRef, NodeUpsertRequest, UuidRef};
    use crate::target::MemoryTarget;
    use serde_json::{json, Map};

    const SNAPSHOT: &str = r#"{
      "sites": [
        { "repository": "mesh", "id": 1, "name": "a", "global_id": "A547.1",
          "hostname": "a.example.com", "languages": ["en"], "root_folder": 100 }
      ],
      "objects": [
        { "identity": { "key": { "object_type": "folder", "id": 101 }, "global_id": "A547.101" },
          "name": "kept", "site_id": 1, "language": "en" },
        { "identity": { "key": { "object_type": "folder", "id": 102 }, "global_id": "A547.102" },
          "name": "excluded", "site_id": 1, "language": "en", "excluded_from": [1] },
        { "identity": { "key": { "object_type": "file", "id": 300 }, "global_id": "A547.300" },
          "name": "old.pdf", "site_id": 1 }
      ],
      "dirt": [
        { "repository": "mesh", "id": 1, "key": { "object_type": "folder", "id": 101 },
          "site_id": 1, "action": "delete", "uuid": "a5470000000000000000000000000101" },
        { "repository": "mesh", "id": 2, "key": { "object_type": "folder", "id": 102 },
          "site_id": 1, "action": "delete" },
        { "repository": "mesh", "id": 3, "key": { "object_type": "folder", "id": 103 },
          "site_id": 1, "action": "remove" },
        { "repository": "mesh", "id": 4, "key": { "object_type": "folder", "id": 101 },
          "site_id": 1, "action": "update" }
      ],
      "offline_files": [ { "object_type": "file", "id": 300 } ],
      "permission_values": { "roles": ["editor"] }
    }"#;

    type Setup = (Arc<RepositoryContext>, Arc<MemoryTarget>, Arc<SnapshotSource>, Scope);

    async fn reconciled(snapshot: &str) -> Setup {
        let ctx = Arc::new(context(vec![site(1, "a", None)]));
        let target = Arc::new(MemoryTarget::new().with_roles(&["editor"]));
        let source = Arc::new(SnapshotSource::from_json(snapshot).unwrap());
        let report = reconcile(&ctx, target.as_ref(), source.as_ref(), ReconcileMode::repair())
            .await
            .unwrap();
        assert!(report.success, "{:?}", report.diagnostics);
        let scope = ctx.scope_for_site(1).unwrap();
        (ctx, target, source, scope)
    }

    async fn put(setup: &Setup, uuid: &str, schema: &str, language: &str) {
        let (ctx, target, _, scope) = setup;
        let mut fields = Map::new();
        fields.insert("name".into(), json!(format!("{}-{}", uuid, language)));
        target
            .upsert_node(
                scope,
                uuid,
                &NodeUpsertRequest {
                    language: language.into(),
                    parent_node: Some(UuidRef {
                        uuid: ctx.root_uuid_for_site(1).unwrap(),
                    }),
                    schema: NameRef { name: schema.into() },
                    fields,
                    publish: true,
                    grant: None,
                },
            )
            .await
            .unwrap();
    }

    async fn setup() -> Setup {
        let setup = reconciled(SNAPSHOT).await;
        for (uuid, schema) in [
            ("a5470000000000000000000000000101", "cms_folder"),
            ("a5470000000000000000000000000102", "cms_folder"),
            ("a5470000000000000000000000000300", "cms_binary_content"),
        ] {
            put(&setup, uuid, schema, "en").await;
        }
        setup
    }

    #[tokio::test]
    async fn removal_is_guarded_by_must_contain() {
        let (ctx, target, source, scope) = setup().await;
        let checker = ConsistencyChecker::build(ctx, target.clone(), source.clone())
            .await
            .unwrap();
        let report = checker
            .remove_offline_objects(&Cancellation::new())
            .await
            .unwrap();
        assert_eq!(report.kept, 1);
        assert_eq!(report.removed, 1);
        assert!(target
            .node(&scope, "a5470000000000000000000000000101", None)
            .is_some());
        assert!(target
            .node(&scope, "a5470000000000000000000000000102", None)
            .is_none());
        assert_eq!(source.reported_done(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn removed_page_language_goes_while_its_sibling_stays() {
        const PAGES: &str = r#"{
          "sites": [
            { "repository": "mesh", "id": 1, "name": "a", "global_id": "A547.1",
              "hostname": "a.example.com", "languages": ["en", "de"], "root_folder": 100 }
          ],
          "objects": [
            { "identity": { "key": { "object_type": "page", "id": 21 }, "global_id": "A547.21",
                            "content_set": "A547.900" },
              "name": "seite", "site_id": 1, "language": "de" }
          ],
          "dirt": [
            { "repository": "mesh", "id": 1, "key": { "object_type": "page", "id": 20 },
              "site_id": 1, "action": "delete", "uuid": "a5470000000000000000000000000900",
              "language": "en" },
            { "repository": "mesh", "id": 2, "key": { "object_type": "page", "id": 22 },
              "site_id": 1, "action": "delete", "uuid": "a5470000000000000000000000000900",
              "language": "de" }
          ],
          "permission_values": { "roles": ["editor"] }
        }"#;
        let setup = reconciled(PAGES).await;
        let uuid = "a5470000000000000000000000000900";
        put(&setup, uuid, "cms_content", "en").await;
        put(&setup, uuid, "cms_content", "de").await;
        let (ctx, target, source, scope) = setup;

        let checker = ConsistencyChecker::build(ctx, target.clone(), source.clone())
            .await
            .unwrap();
        let report = checker
            .remove_offline_objects(&Cancellation::new())
            .await
            .unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.kept, 1);
        let node = target.node(&scope, uuid, None).unwrap();
        assert_eq!(node.available_languages, vec!["de".to_string()]);
        assert_eq!(source.reported_done(), vec![1, 2]);
    }

    #[tokio::test]
    async fn unused_files_are_taken_offline() {
        let (ctx, target, source, scope) = setup().await;
        let checker = ConsistencyChecker::build(ctx, target.clone(), source)
            .await
            .unwrap();
        let count = checker
            .check_offline_files(&Cancellation::new())
            .await
            .unwrap();
        assert_eq!(count, 1);
        let file = target
            .node(&scope, "a5470000000000000000000000000300", None)
            .unwrap();
        assert!(!file.published);
    }

    #[tokio::test]
    async fn scrub_deletes_only_produced_items() {
        let (ctx, target, source, _) = setup().await;
        let mut shared = context(vec![site(1, "a", None)]);
        shared.config.project_per_site = false;
        shared.config.project_name = Some("shared".into());
        reconcile(&shared, target.as_ref(), source.as_ref(), ReconcileMode::repair())
            .await
            .unwrap();
        let shared_scope = shared.scope_for_site(1).unwrap();
        let shared_root = shared.root_uuid_for_site(1).unwrap();
        for uuid in ["a5470000000000000000000000000101", "a54700000000000000000000000009ff"] {
            let mut fields = Map::new();
            fields.insert("name".into(), json!(uuid));
            target
                .upsert_node(
                    &shared_scope,
                    uuid,
                    &NodeUpsertRequest {
                        language: "en".into(),
                        parent_node: Some(UuidRef {
                            uuid: shared_root.clone(),
                        }),
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

        let mut cfg_ctx = context(vec![site(1, "a", None)]);
        cfg_ctx.config.project_name = Some("shared".into());
        let ctx = Arc::new(cfg_ctx);
        reconcile(&ctx, target.as_ref(), source.as_ref(), ReconcileMode::repair())
            .await
            .unwrap();
        let checker = ConsistencyChecker::build(ctx, target.clone(), source)
            .await
            .unwrap();
        let scrubbed = checker
            .scrub_alternative_projects(&Cancellation::new())
            .await
            .unwrap();
        assert_eq!(scrubbed, 1);
        assert!(target
            .node(&shared_scope, "a5470000000000000000000000000101", None)
            .is_none());
        assert!(target
            .node(&shared_scope, "a54700000000000000000000000009ff", None)
            .is_some());
    }
}
