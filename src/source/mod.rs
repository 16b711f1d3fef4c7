//! Source system collaborator: object model lookups, dirt queue and rendering.
use anyhow::Result;
use async_trait::async_trait;

use crate::mapping::MappingEntry;
use crate::model::{DirtEntry, ObjectKey, ObjectType, RenderedFields, Site, SourceObject};

pub mod snapshot;

pub use snapshot::SnapshotSource;

#[async_trait]
pub trait SourceSystem: Send + Sync {
    /// Sites bound to the repository.
    async fn sites(&self, repository: &str) -> Result<Vec<Site>>;

    async fn object(&self, key: ObjectKey) -> Result<Option<SourceObject>>;

    /// Object currently producing the given target uuid (in `language`, when
    /// given), if any.
    async fn object_by_uuid(
        &self,
        repository: &str,
        uuid: &str,
        language: Option<&str>,
    ) -> Result<Option<SourceObject>>;

    /// Whether the object must (still) exist in the repository for this site.
    async fn must_contain(&self, object: &SourceObject, repository: &str, site_id: i64)
        -> Result<bool>;

    /// Pending dirt queue entries of the given kinds.
    async fn dirted_objects(&self, repository: &str, types: &[ObjectType])
        -> Result<Vec<DirtEntry>>;

    async fn report_done(&self, repository: &str, dirt_id: i64) -> Result<()>;

    /// All objects the repository currently publishes, used for identity tables.
    async fn repository_objects(&self, repository: &str) -> Result<Vec<SourceObject>>;

    /// Files that are offline now because nothing uses them any more.
    async fn offline_files(&self, repository: &str) -> Result<Vec<ObjectKey>>;

    /// Backing value set of the permission property.
    async fn permission_values(&self, property: &str) -> Result<Option<Vec<String>>>;

    async fn store_permission_values(&self, property: &str, values: &[String]) -> Result<()>;
}

#[async_trait]
pub trait FieldRenderer: Send + Sync {
    async fn render(
        &self,
        object: &SourceObject,
        entries: &[&MappingEntry],
        language: Option<&str>,
    ) -> Result<RenderedFields>;
}
