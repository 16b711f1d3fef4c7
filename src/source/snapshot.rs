//! Source system backed by a JSON export.
//!
//! The export carries sites, objects with their pre-rendered attribute values
//! per language and the dirt queue. Acknowledged dirt entries and written-back
//! permission values are kept in memory.
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use super::{FieldRenderer, SourceSystem};
use crate::identity::{uuid_from_global_id, wire};
use crate::mapping::MappingEntry;
use crate::model::{
    DirtEntry, ObjectKey, ObjectType, RenderedFields, Site, SourceObject,
};

const DEFAULT_LANGUAGE_KEY: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotSite {
    pub repository: String,
    #[serde(flatten)]
    pub site: Site,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotObject {
    #[serde(flatten)]
    pub object: SourceObject,
    /// Rendered values keyed by language (`default` when language-less).
    #[serde(default)]
    pub fields: BTreeMap<String, RenderedFields>,
    /// Sites this object must not exist in any more.
    #[serde(default)]
    pub excluded_from: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotDirt {
    pub repository: String,
    #[serde(flatten)]
    pub entry: DirtEntry,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Snapshot {
    #[serde(default)]
    pub sites: Vec<SnapshotSite>,
    #[serde(default)]
    pub objects: Vec<SnapshotObject>,
    #[serde(default)]
    pub dirt: Vec<SnapshotDirt>,
    #[serde(default)]
    pub offline_files: Vec<ObjectKey>,
    #[serde(default)]
    pub permission_values: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Default)]
struct State {
    done: BTreeSet<i64>,
    permission_values: BTreeMap<String, Vec<String>>,
}

#[derive(Debug)]
pub struct SnapshotSource {
    snapshot: Snapshot,
    state: Mutex<State>,
}

impl SnapshotSource {
    pub fn new(snapshot: Snapshot) -> Self {
        let state = State {
            done: BTreeSet::new(),
            permission_values: snapshot.permission_values.clone(),
        };
        Self {
            snapshot,
            state: Mutex::new(state),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Snapshot = serde_json::from_str(json).context("invalid source snapshot")?;
        Ok(Self::new(snapshot))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read snapshot {}", path.display()))?;
        Self::from_json(&raw)
    }

    /// Dirt entry ids acknowledged so far.
    pub fn reported_done(&self) -> Vec<i64> {
        self.lock().done.iter().copied().collect()
    }

    pub fn stored_permission_values(&self, property: &str) -> Option<Vec<String>> {
        self.lock().permission_values.get(property).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn repository_site_ids(&self, repository: &str) -> BTreeSet<i64> {
        self.snapshot
            .sites
            .iter()
            .filter(|s| s.repository == repository)
            .map(|s| s.site.id)
            .collect()
    }

    fn find(&self, key: ObjectKey) -> Option<&SnapshotObject> {
        self.snapshot.objects.iter().find(|o| o.object.key() == key)
    }

    fn object_uuid(object: &SourceObject) -> Option<String> {
        let gid = match object.key().object_type {
            ObjectType::Page => object.identity.content_set.as_deref()?,
            _ => object.identity.global_id.as_str(),
        };
        uuid_from_global_id(gid).ok().map(|u| wire(&u))
    }
}

#[async_trait]
impl SourceSystem for SnapshotSource {
    async fn sites(&self, repository: &str) -> Result<Vec<Site>> {
        Ok(self
            .snapshot
            .sites
            .iter()
            .filter(|s| s.repository == repository)
            .map(|s| s.site.clone())
            .collect())
    }

    async fn object(&self, key: ObjectKey) -> Result<Option<SourceObject>> {
        Ok(self.find(key).map(|o| o.object.clone()))
    }

    async fn object_by_uuid(
        &self,
        repository: &str,
        uuid: &str,
        language: Option<&str>,
    ) -> Result<Option<SourceObject>> {
        let sites = self.repository_site_ids(repository);
        let speaks = |o: &SourceObject| match (language, o.language.as_deref()) {
            (Some(wanted), Some(own)) => {
                own == wanted || o.alternate_languages.iter().any(|l| l == wanted)
            }
            _ => true,
        };
        Ok(self
            .snapshot
            .objects
            .iter()
            .filter(|o| sites.contains(&o.object.site_id))
            .filter(|o| speaks(&o.object))
            .find(|o| Self::object_uuid(&o.object).as_deref() == Some(uuid))
            .map(|o| o.object.clone()))
    }

    async fn must_contain(
        &self,
        object: &SourceObject,
        repository: &str,
        site_id: i64,
    ) -> Result<bool> {
        if !self.repository_site_ids(repository).contains(&site_id) {
            return Ok(false);
        }
        Ok(match self.find(object.key()) {
            Some(o) => o.object.online && !o.excluded_from.contains(&site_id),
            None => false,
        })
    }

    async fn dirted_objects(
        &self,
        repository: &str,
        types: &[ObjectType],
    ) -> Result<Vec<DirtEntry>> {
        let state = self.lock();
        Ok(self
            .snapshot
            .dirt
            .iter()
            .filter(|d| d.repository == repository)
            .filter(|d| types.contains(&d.entry.key.object_type))
            .filter(|d| !state.done.contains(&d.entry.id))
            .map(|d| d.entry.clone())
            .collect())
    }

    async fn report_done(&self, repository: &str, dirt_id: i64) -> Result<()> {
        debug!(repository, dirt_id, "dirt entry done");
        self.lock().done.insert(dirt_id);
        Ok(())
    }

    async fn repository_objects(&self, repository: &str) -> Result<Vec<SourceObject>> {
        let sites = self.repository_site_ids(repository);
        Ok(self
            .snapshot
            .objects
            .iter()
            .filter(|o| sites.contains(&o.object.site_id) && o.object.online)
            .map(|o| o.object.clone())
            .collect())
    }

    async fn offline_files(&self, repository: &str) -> Result<Vec<ObjectKey>> {
        let sites = self.repository_site_ids(repository);
        Ok(self
            .snapshot
            .offline_files
            .iter()
            .filter(|k| {
                self.find(**k)
                    .map_or(true, |o| sites.contains(&o.object.site_id))
            })
            .copied()
            .collect())
    }

    async fn permission_values(&self, property: &str) -> Result<Option<Vec<String>>> {
        Ok(self.lock().permission_values.get(property).cloned())
    }

    async fn store_permission_values(&self, property: &str, values: &[String]) -> Result<()> {
        self.lock()
            .permission_values
            .insert(property.to_string(), values.to_vec());
        Ok(())
    }
}

#[async_trait]
impl FieldRenderer for SnapshotSource {
    async fn render(
        &self,
        object: &SourceObject,
        entries: &[&MappingEntry],
        language: Option<&str>,
    ) -> Result<RenderedFields> {
        let stored = self
            .find(object.key())
            .with_context(|| format!("object {} is not part of the snapshot", object.key()))?;
        let by_language = language
            .and_then(|l| stored.fields.get(l))
            .or_else(|| stored.fields.get(DEFAULT_LANGUAGE_KEY));
        let mut rendered = RenderedFields::new();
        if let Some(values) = by_language {
            for entry in entries {
                if let Some(v) = values.get(&entry.field) {
                    rendered.insert(entry.field.clone(), v.clone());
                }
            }
        }
        Ok(rendered)
    }
}
