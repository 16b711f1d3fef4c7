//! Render stage: scheduled units to write tasks.
use std::sync::Arc;
use tracing::{debug, instrument};

use super::task::{Continuation, WriteTask};
use crate::cache::{CacheResolver, ExistenceCache, Presence};
use crate::context::RepositoryContext;
use crate::error::PublishError;
use crate::identity::IdentityMapper;
use crate::mapping::{
    binary_field, effective_entries, field_values, referenced_identities, roles_from,
};
use crate::model::{ObjectKey, RenderedFields, ScheduledUnit, SourceObject};
use crate::source::{FieldRenderer, SourceSystem};

const FALLBACK_LANGUAGE: &str = "en";

pub struct RenderStage {
    ctx: Arc<RepositoryContext>,
    mapper: IdentityMapper,
    source: Arc<dyn SourceSystem>,
    renderer: Arc<dyn FieldRenderer>,
    cache: Arc<ExistenceCache>,
}

impl RenderStage {
    pub fn new(
        ctx: Arc<RepositoryContext>,
        source: Arc<dyn SourceSystem>,
        renderer: Arc<dyn FieldRenderer>,
        cache: Arc<ExistenceCache>,
    ) -> Self {
        let mapper = ctx.mapper();
        Self {
            ctx,
            mapper,
            source,
            renderer,
            cache,
        }
    }

    pub fn mapper(&self) -> &IdentityMapper {
        &self.mapper
    }

    fn primary_language(&self, unit: &ScheduledUnit) -> String {
        unit.language
            .clone()
            .or_else(|| unit.object.language.clone())
            .or_else(|| {
                self.ctx
                    .site(unit.site_id)
                    .and_then(|s| s.languages.first().cloned())
            })
            .unwrap_or_else(|| FALLBACK_LANGUAGE.to_string())
    }

    async fn parent_uuid(&self, unit: &ScheduledUnit) -> Result<Option<String>, PublishError> {
        let object = &unit.object;
        if self.mapper.is_root_item(&object.identity) {
            return Ok(None);
        }
        match object.parent {
            Some(parent_key) => {
                let parent = self.source.object(parent_key).await?.ok_or_else(|| {
                    PublishError::Configuration(format!(
                        "parent {} of {} does not exist in the source system",
                        parent_key,
                        object.key()
                    ))
                })?;
                Ok(Some(self.mapper.target_wire(&parent.identity)?))
            }
            None => self
                .ctx
                .root_uuid_for_site(unit.site_id)
                .map(Some)
                .ok_or_else(|| {
                    PublishError::Configuration(format!(
                        "no project root for site {}",
                        unit.site_id
                    ))
                }),
        }
    }

    /// Renders one unit into a task per target language. Kinds with language
    /// variants get one task for the item's own language followed by one per
    /// alternate language; the first task carries the expected language set.
    #[instrument(skip_all, fields(object = %unit.object.key(), site = unit.site_id))]
    pub async fn render(&self, unit: &ScheduledUnit) -> Result<Vec<WriteTask>, PublishError> {
        let object = &unit.object;
        let key = object.key();
        let kind = key.object_type;
        let repo = &self.ctx.config;
        let scope = self.ctx.scope_for_site(unit.site_id)?;
        let uuid = self.mapper.target_wire(&object.identity)?;
        let parent_uuid = self.parent_uuid(unit).await?;
        let entries = effective_entries(repo, kind);

        let primary = self.primary_language(unit);
        let mut languages = vec![primary.clone()];
        if kind.has_language_variants() {
            for lang in &object.alternate_languages {
                if !languages.contains(lang) {
                    languages.push(lang.clone());
                }
            }
        }

        let continuations = self.continuations(object);
        let resolver = CacheResolver {
            mapper: &self.mapper,
            cache: &self.cache,
        };

        let mut tasks = Vec::with_capacity(languages.len());
        for (i, language) in languages.iter().enumerate() {
            let rendered = match (&unit.rendered, i) {
                (Some(pre), 0) => pre.clone(),
                _ => {
                    self.renderer
                        .render(object, &entries, Some(language.as_str()))
                        .await?
                }
            };
            self.confirm_references(&rendered).await?;
            let values = field_values(repo, kind, &rendered, unit.attributes.as_deref(), &resolver);
            if !values.dependencies.is_empty() {
                debug!(
                    language = %language,
                    dependencies = values.dependencies.len(),
                    "fields postponed until dependencies are written"
                );
            }
            let roles = repo
                .permission_property
                .as_deref()
                .and_then(|p| roles_from(&rendered, p));
            tasks.push(WriteTask {
                key,
                site_id: unit.site_id,
                scope: scope.clone(),
                uuid: uuid.clone(),
                parent_uuid: parent_uuid.clone(),
                parent: object.parent,
                language: language.clone(),
                schema: repo.schema_name(kind),
                fields: values.fields,
                roles,
                postponed_fields: (!values.postponed.is_empty()).then_some(values.postponed),
                continuations: continuations.clone(),
                postponable: true,
                dirt_id: if i == 0 { unit.dirt_id } else { None },
                expected_languages: (i == 0 && kind.has_language_variants())
                    .then(|| languages.clone()),
            });
        }
        Ok(tasks)
    }

    /// Asks the source system about referenced items this run knows nothing
    /// about. Items it no longer has, or no longer publishes into their site,
    /// are cached as missing so references to them are written as null.
    async fn confirm_references(&self, rendered: &RenderedFields) -> Result<(), PublishError> {
        for identity in referenced_identities(rendered) {
            let key = identity.key;
            if self.cache.presence(key) != Presence::Unknown {
                continue;
            }
            let exists = match self.source.object(key).await? {
                Some(object) => {
                    self.source
                        .must_contain(&object, self.ctx.name(), object.site_id)
                        .await?
                }
                None => false,
            };
            if !exists {
                debug!(reference = %key, "referenced item does not exist");
                self.cache.missing(key);
            }
        }
        Ok(())
    }

    fn continuations(&self, object: &SourceObject) -> Vec<Continuation> {
        let Some(binary) = &object.binary else {
            return Vec::new();
        };
        let Some(field) = binary_field(&self.ctx.config, object.key().object_type) else {
            return Vec::new();
        };
        let mut out = vec![Continuation::UploadBinary {
            field: field.clone(),
            binary: binary.clone(),
        }];
        if let Some(point) = binary.focal_point {
            out.push(Continuation::FocalPoint { field, point });
        }
        out
    }

    /// Task writing the source parent of `task` in the language of `task`.
    /// The synthesized task is not postponable.
    pub async fn parent_task(&self, task: &WriteTask) -> Result<Option<WriteTask>, PublishError> {
        let Some(parent_key) = task.parent else {
            return Ok(None);
        };
        self.object_task(parent_key, task.site_id, Some(task.language.clone()))
            .await
    }

    pub async fn object_task(
        &self,
        key: ObjectKey,
        site_id: i64,
        language: Option<String>,
    ) -> Result<Option<WriteTask>, PublishError> {
        let Some(object) = self.source.object(key).await? else {
            self.cache.missing(key);
            return Ok(None);
        };
        let mut unit = ScheduledUnit::new(site_id, object);
        if unit.object.key().object_type.has_language_variants() {
            unit.language = language.or(unit.language);
            unit.object.alternate_languages.clear();
        }
        let mut tasks = self.render(&unit).await?;
        if tasks.is_empty() {
            return Ok(None);
        }
        let mut task = tasks.swap_remove(0);
        task.postponable = false;
        task.expected_languages = None;
        Ok(Some(task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::{context, site};
    use crate::context::{BranchInfo, ProjectInfo};
    use crate::source::SnapshotSource;
    use std::collections::{BTreeMap, BTreeSet};

    const SNAPSHOT: &str = r#"{
      "sites": [
        { "repository": "mesh", "id": 1, "name": "a", "global_id": "A547.1",
          "hostname": "a.example.com", "languages": ["en", "de"], "root_folder": 100 }
      ],
      "objects": [
        { "identity": { "key": { "object_type": "folder", "id": 100 }, "global_id": "A547.100",
                        "root_of_site": 1 },
          "name": "root", "site_id": 1 },
        { "identity": { "key": { "object_type": "folder", "id": 101 }, "global_id": "A547.101" },
          "name": "news", "site_id": 1, "parent": { "object_type": "folder", "id": 100 },
          "language": "en", "alternate_languages": ["de"],
          "fields": {
            "en": { "name": { "type": "text", "value": "News" },
                    "roles": { "type": "list", "value": [ { "type": "text", "value": "editor" } ] } },
            "de": { "name": { "type": "text", "value": "Neuigkeiten" } } } },
        { "identity": { "key": { "object_type": "file", "id": 300 }, "global_id": "A547.300" },
          "name": "logo.png", "site_id": 1, "parent": { "object_type": "folder", "id": 101 },
          "binary": { "file_name": "logo.png", "mime_type": "image/png", "data": [1, 2, 3],
                      "focal_point": [0.5, 0.25] },
          "fields": { "default": { "name": { "type": "text", "value": "logo" } } } },
        { "identity": { "key": { "object_type": "page", "id": 400 }, "global_id": "A547.400",
                        "content_set": "A547.400" },
          "name": "home", "site_id": 1, "parent": { "object_type": "folder", "id": 101 },
          "language": "en",
          "fields": { "en": {
            "name": { "type": "text", "value": "Home" },
            "link": { "type": "link", "value": { "internal": {
              "key": { "object_type": "page", "id": 999 }, "global_id": "A547.999",
              "content_set": "A547.999" } } },
            "related": { "type": "overview", "value": {
              "list_type": "PAGE", "select_type": null, "order_direction": null,
              "order_by": null, "source": null, "max_items": null,
              "items": [
                { "key": { "object_type": "page", "id": 401 }, "global_id": "A547.401",
                  "content_set": "A547.401" },
                { "key": { "object_type": "page", "id": 999 }, "global_id": "A547.999",
                  "content_set": "A547.999" } ],
              "item_sites": [1, 1] } } } } },
        { "identity": { "key": { "object_type": "page", "id": 401 }, "global_id": "A547.401",
                        "content_set": "A547.401" },
          "name": "about", "site_id": 1, "parent": { "object_type": "folder", "id": 101 },
          "language": "en" }
      ]
    }"#;

    fn stage() -> (RenderStage, Arc<SnapshotSource>) {
        let ctx = context(vec![site(1, "a", None)]);
        ctx.set_project(ProjectInfo {
            name: "a".into(),
            uuid: "p".into(),
            root_uuid: "0123456789abcdef0123456789abcdef".into(),
            owner_site: Some(1),
            default_branch: Some(BranchInfo {
                uuid: "b".into(),
                name: "a_1.0".into(),
            }),
            channel_branches: BTreeMap::new(),
            granted_roles: BTreeSet::new(),
        });
        let source = Arc::new(SnapshotSource::from_json(SNAPSHOT).unwrap());
        let stage = RenderStage::new(
            Arc::new(ctx),
            source.clone(),
            source.clone(),
            Arc::new(ExistenceCache::new()),
        );
        (stage, source)
    }

    #[tokio::test]
    async fn folder_fans_out_into_alternate_languages() {
        let (stage, source) = stage();
        let folder = source
            .object(ObjectKey::new(crate::model::ObjectType::Folder, 101))
            .await
            .unwrap()
            .unwrap();
        let tasks = stage.render(&ScheduledUnit::new(1, folder)).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].language, "en");
        assert_eq!(tasks[1].language, "de");
        assert_eq!(tasks[0].uuid, tasks[1].uuid);
        assert_eq!(
            tasks[0].parent_uuid.as_deref(),
            Some("0123456789abcdef0123456789abcdef")
        );
        assert_eq!(
            tasks[0].expected_languages,
            Some(vec!["en".to_string(), "de".to_string()])
        );
        assert_eq!(tasks[1].expected_languages, None);
        assert_eq!(tasks[0].fields["name"], "News");
        assert_eq!(tasks[1].fields["name"], "Neuigkeiten");
        assert_eq!(tasks[0].roles, Some(vec!["editor".to_string()]));
        assert_eq!(tasks[0].scope.branch.as_deref(), Some("a_1.0"));
    }

    #[tokio::test]
    async fn root_folder_has_no_parent_and_files_get_continuations() {
        let (stage, source) = stage();
        let root = source
            .object(ObjectKey::new(crate::model::ObjectType::Folder, 100))
            .await
            .unwrap()
            .unwrap();
        let tasks = stage.render(&ScheduledUnit::new(1, root)).await.unwrap();
        assert_eq!(tasks[0].uuid, "0123456789abcdef0123456789abcdef");
        assert_eq!(tasks[0].parent_uuid, None);

        let file = source
            .object(ObjectKey::new(crate::model::ObjectType::File, 300))
            .await
            .unwrap()
            .unwrap();
        let tasks = stage.render(&ScheduledUnit::new(1, file)).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].language, "en");
        assert_eq!(tasks[0].continuations.len(), 2);
        assert!(matches!(
            tasks[0].continuations[0],
            Continuation::UploadBinary { .. }
        ));
        assert!(!tasks[0].fields.contains_key("binarycontent"));
    }

    #[tokio::test]
    async fn parent_task_is_not_postponable() {
        let (stage, source) = stage();
        let file = source
            .object(ObjectKey::new(crate::model::ObjectType::File, 300))
            .await
            .unwrap()
            .unwrap();
        let tasks = stage.render(&ScheduledUnit::new(1, file)).await.unwrap();
        let parent = stage.parent_task(&tasks[0]).await.unwrap().unwrap();
        assert_eq!(parent.key, ObjectKey::new(crate::model::ObjectType::Folder, 101));
        assert!(!parent.postponable);
        assert_eq!(parent.language, "en");
    }

    #[tokio::test]
    async fn references_to_items_gone_from_the_source_are_written_as_null() {
        let (stage, source) = stage();
        let home = source
            .object(ObjectKey::new(crate::model::ObjectType::Page, 400))
            .await
            .unwrap()
            .unwrap();
        let tasks = stage.render(&ScheduledUnit::new(1, home)).await.unwrap();
        let fields = &tasks[0].fields;
        assert_eq!(fields["link_internal"], serde_json::Value::Null);
        assert_eq!(
            fields["related_items"],
            serde_json::json!([{ "uuid": "a5470000000000000000000000000401" }])
        );
        assert_eq!(fields["related_nodeIds"], serde_json::json!([1]));
        assert!(tasks[0].postponed_fields.is_none());
        assert_eq!(
            stage
                .cache
                .presence(ObjectKey::new(crate::model::ObjectType::Page, 999)),
            Presence::Missing
        );
        assert_eq!(
            stage
                .cache
                .presence(ObjectKey::new(crate::model::ObjectType::Page, 401)),
            Presence::Unknown
        );
    }
}
