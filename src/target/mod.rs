//! Abstract REST surface of the target system.
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub mod client;
pub mod memory;
pub mod model;

pub use client::MeshClient;
pub use memory::MemoryTarget;
use model::*;

/// Details reported by the target system about a uniqueness clash.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Conflict {
    pub message: String,
    pub conflicting_uuid: Option<String>,
    pub conflicting_language: Option<String>,
    pub field: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("parent node {0} does not exist")]
    MissingParent(String),
    #[error("conflict: {}", .0.message)]
    Conflict(Conflict),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid response: {0}")]
    Decode(String),
}

impl TargetError {
    /// Errors worth a short, bounded retry.
    pub fn is_transient(&self) -> bool {
        match self {
            TargetError::NotFound(_) | TargetError::Transport(_) => true,
            TargetError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TargetError::NotFound(_))
    }
}

impl From<reqwest::Error> for TargetError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            TargetError::Decode(err.to_string())
        } else {
            TargetError::Transport(err.to_string())
        }
    }
}

pub type TargetResult<T> = Result<T, TargetError>;

#[async_trait]
pub trait TargetService: Send + Sync {
    async fn find_schema(&self, name: &str) -> TargetResult<Option<SchemaResponse>>;
    async fn create_schema(&self, schema: &SchemaModel) -> TargetResult<SchemaResponse>;
    async fn diff_schema(&self, uuid: &str, schema: &SchemaModel)
        -> TargetResult<Vec<SchemaChange>>;
    async fn update_schema(&self, uuid: &str, schema: &SchemaModel)
        -> TargetResult<SchemaResponse>;

    async fn list_microschemas(&self) -> TargetResult<Vec<MicroschemaResponse>>;
    async fn create_microschema(
        &self,
        microschema: &MicroschemaModel,
    ) -> TargetResult<MicroschemaResponse>;
    async fn diff_microschema(
        &self,
        uuid: &str,
        microschema: &MicroschemaModel,
    ) -> TargetResult<Vec<SchemaChange>>;
    async fn update_microschema(
        &self,
        uuid: &str,
        microschema: &MicroschemaModel,
    ) -> TargetResult<MicroschemaResponse>;

    async fn list_projects(&self) -> TargetResult<Vec<ProjectResponse>>;
    async fn create_project(&self, req: &ProjectCreateRequest) -> TargetResult<ProjectResponse>;
    async fn delete_project(&self, uuid: &str) -> TargetResult<()>;
    async fn project_schemas(&self, project: &str) -> TargetResult<Vec<SchemaReference>>;
    async fn assign_schema(&self, project: &str, schema_uuid: &str) -> TargetResult<()>;
    async fn project_microschemas(&self, project: &str) -> TargetResult<Vec<SchemaReference>>;
    async fn assign_microschema(&self, project: &str, microschema_uuid: &str) -> TargetResult<()>;

    async fn list_branches(&self, project: &str) -> TargetResult<Vec<BranchResponse>>;
    async fn create_branch(
        &self,
        project: &str,
        req: &BranchCreateRequest,
    ) -> TargetResult<BranchResponse>;
    async fn update_branch(
        &self,
        project: &str,
        branch_uuid: &str,
        req: &BranchUpdateRequest,
    ) -> TargetResult<BranchResponse>;
    async fn set_branch_latest(&self, project: &str, branch_uuid: &str) -> TargetResult<()>;
    async fn add_branch_tag(
        &self,
        project: &str,
        branch_uuid: &str,
        tag: &TagReference,
    ) -> TargetResult<()>;
    async fn remove_branch_tag(
        &self,
        project: &str,
        branch_uuid: &str,
        tag: &TagReference,
    ) -> TargetResult<()>;
    /// Assigns schema versions to a branch and triggers node migrations.
    async fn assign_branch_schemas(
        &self,
        project: &str,
        branch_uuid: &str,
        refs: &[SchemaReference],
    ) -> TargetResult<()>;
    async fn assign_branch_microschemas(
        &self,
        project: &str,
        branch_uuid: &str,
        refs: &[SchemaReference],
    ) -> TargetResult<()>;
    async fn branch_migration_status(
        &self,
        project: &str,
        branch_uuid: &str,
    ) -> TargetResult<BranchMigrationStatus>;

    async fn list_roles(&self) -> TargetResult<Vec<RoleResponse>>;
    /// Names of the roles holding read permission on the project.
    async fn project_read_roles(&self, project: &str) -> TargetResult<Vec<String>>;
    async fn grant_roles(&self, target: &PermissionTarget, roles: &[String]) -> TargetResult<()>;

    async fn upsert_node(
        &self,
        scope: &Scope,
        uuid: &str,
        req: &NodeUpsertRequest,
    ) -> TargetResult<NodeResponse>;
    async fn load_node(
        &self,
        scope: &Scope,
        uuid: &str,
        language: Option<&str>,
    ) -> TargetResult<Option<NodeResponse>>;
    async fn list_children(&self, scope: &Scope, uuid: &str) -> TargetResult<Vec<NodeResponse>>;
    async fn move_node(&self, scope: &Scope, uuid: &str, parent_uuid: &str) -> TargetResult<()>;
    async fn publish_language(&self, scope: &Scope, uuid: &str, language: &str)
        -> TargetResult<()>;
    async fn delete_language(&self, scope: &Scope, uuid: &str, language: &str)
        -> TargetResult<()>;
    async fn delete_node(&self, scope: &Scope, uuid: &str) -> TargetResult<()>;
    async fn take_offline(&self, scope: &Scope, uuid: &str) -> TargetResult<()>;
    async fn upload_binary(&self, scope: &Scope, uuid: &str, upload: &BinaryUpload)
        -> TargetResult<()>;
    async fn set_focal_point(
        &self,
        scope: &Scope,
        uuid: &str,
        language: &str,
        field: &str,
        point: (f32, f32),
    ) -> TargetResult<()>;

    /// Authenticated request against a plugin endpoint, addressed relative to
    /// the API base.
    async fn plugin_request(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
    ) -> TargetResult<Value>;
}

/// Find a project by name.
pub async fn find_project(
    target: &dyn TargetService,
    name: &str,
) -> TargetResult<Option<ProjectResponse>> {
    Ok(target
        .list_projects()
        .await?
        .into_iter()
        .find(|p| p.name == name))
}

/// Retry `op` while it fails with a transient error, at most `retries` extra
/// times with a fixed `delay`.
pub async fn retry_transient<T, F, Fut>(
    retries: u32,
    delay: Duration,
    what: &str,
    mut op: F,
) -> TargetResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TargetResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(err) if err.is_transient() && attempt < retries => {
                attempt += 1;
                warn!(%err, attempt, what, "transient target error; retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
