use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use tracing::{debug, instrument, warn};

use super::model::*;
use super::{Conflict, TargetError, TargetResult, TargetService};

const PARENT_NOT_FOUND_KEY: &str = "node_error_parent_not_found";

/// REST client of the target system.
#[derive(Clone)]
pub struct MeshClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for MeshClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    i18n_key: Option<String>,
    #[serde(default)]
    properties: ErrorProperties,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ErrorProperties {
    #[serde(default)]
    conflicting_uuid: Option<String>,
    #[serde(default)]
    conflicting_language: Option<String>,
    #[serde(default)]
    field: Option<String>,
    #[serde(default)]
    parent_uuid: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BranchSchemaInfo {
    name: String,
    version: String,
    #[serde(default)]
    migration_status: Option<MigrationState>,
}

#[derive(Debug, Deserialize)]
struct BranchSchemas {
    #[serde(default)]
    schemas: Vec<BranchSchemaInfo>,
    #[serde(default)]
    microschemas: Vec<BranchSchemaInfo>,
}

#[derive(Debug, Deserialize)]
struct RolePermission {
    role: RoleResponse,
    #[serde(default)]
    perms: Value,
}

/// Translate an error response of the target system.
pub fn map_error(status: StatusCode, body: &str) -> TargetError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = if parsed.message.is_empty() {
        body.to_string()
    } else {
        parsed.message.clone()
    };
    match status {
        StatusCode::NOT_FOUND => TargetError::NotFound(message),
        StatusCode::CONFLICT => TargetError::Conflict(Conflict {
            message,
            conflicting_uuid: parsed.properties.conflicting_uuid,
            conflicting_language: parsed.properties.conflicting_language,
            field: parsed.properties.field,
        }),
        StatusCode::BAD_REQUEST if parsed.i18n_key.as_deref() == Some(PARENT_NOT_FOUND_KEY) => {
            TargetError::MissingParent(parsed.properties.parent_uuid.unwrap_or(message))
        }
        StatusCode::BAD_REQUEST => TargetError::BadRequest(message),
        other => TargetError::Status {
            status: other.as_u16(),
            body: body.to_string(),
        },
    }
}

fn with_branch(rb: RequestBuilder, scope: &Scope) -> RequestBuilder {
    match &scope.branch {
        Some(branch) => rb.query(&[("branch", branch.as_str())]),
        None => rb,
    }
}

impl MeshClient {
    /// `base_url` is the API root, e.g. `https://mesh.example.com/api/v2/`.
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self> {
        let mut base = base_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).with_context(|| format!("invalid target url {}", base_url))?;
        let http = Client::builder()
            .user_agent("mesh-publisher/0.1")
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base_url,
            token: token.into(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> TargetResult<RequestBuilder> {
        let url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| TargetError::BadRequest(format!("invalid path {}: {}", path, e)))?;
        Ok(self
            .http
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token)))
    }

    pub fn build_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> TargetResult<reqwest::Request> {
        let mut rb = self.request(method, path)?;
        if let Some(body) = body {
            rb = rb.json(body);
        }
        Ok(rb.build()?)
    }

    async fn execute(&self, rb: RequestBuilder) -> TargetResult<String> {
        let request = rb.build()?;
        debug!(method = %request.method(), url = %request.url(), "target request");
        let res = self.http.execute(request).await?;
        let status = res.status();
        let body = res.text().await?;
        if status.is_success() {
            return Ok(body);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(%status, "rate limited by target system");
        }
        Err(map_error(status, &body))
    }

    async fn send<T: DeserializeOwned>(&self, rb: RequestBuilder) -> TargetResult<T> {
        let body = self.execute(rb).await?;
        serde_json::from_str(&body).map_err(|e| TargetError::Decode(e.to_string()))
    }

    async fn send_empty(&self, rb: RequestBuilder) -> TargetResult<()> {
        self.execute(rb).await.map(|_| ())
    }

    async fn list<T: DeserializeOwned>(&self, path: &str) -> TargetResult<Vec<T>> {
        let res: ListResponse<T> = self.send(self.request(Method::GET, path)?).await?;
        Ok(res.data)
    }

    async fn role_uuid(&self, name: &str) -> TargetResult<String> {
        self.list_roles()
            .await?
            .into_iter()
            .find(|r| r.name == name)
            .map(|r| r.uuid)
            .ok_or_else(|| TargetError::NotFound(format!("role {}", name)))
    }

    async fn load_branch(&self, project: &str, branch_uuid: &str) -> TargetResult<BranchResponse> {
        self.send(self.request(Method::GET, &format!("{}/branches/{}", project, branch_uuid))?)
            .await
    }

    async fn set_branch_tags(
        &self,
        project: &str,
        branch_uuid: &str,
        tags: &[TagReference],
    ) -> TargetResult<()> {
        let rb = self
            .request(Method::POST, &format!("{}/branches/{}/tags", project, branch_uuid))?
            .json(&json!({ "tags": tags }));
        self.send_empty(rb).await
    }
}

#[async_trait]
impl TargetService for MeshClient {
    #[instrument(skip_all, fields(name = %name))]
    async fn find_schema(&self, name: &str) -> TargetResult<Option<SchemaResponse>> {
        let schemas: Vec<SchemaResponse> = self.list("schemas").await?;
        Ok(schemas.into_iter().find(|s| s.model.name == name))
    }

    #[instrument(skip_all)]
    async fn create_schema(&self, schema: &SchemaModel) -> TargetResult<SchemaResponse> {
        self.send(self.request(Method::POST, "schemas")?.json(schema))
            .await
    }

    #[instrument(skip_all)]
    async fn diff_schema(&self, uuid: &str, schema: &SchemaModel) -> TargetResult<Vec<SchemaChange>> {
        let res: SchemaChanges = self
            .send(self.request(Method::POST, &format!("schemas/{}/diff", uuid))?.json(schema))
            .await?;
        Ok(res.changes)
    }

    #[instrument(skip_all)]
    async fn update_schema(&self, uuid: &str, schema: &SchemaModel) -> TargetResult<SchemaResponse> {
        let path = format!("schemas/{}", uuid);
        self.send_empty(self.request(Method::POST, &path)?.json(schema))
            .await?;
        self.send(self.request(Method::GET, &path)?).await
    }

    #[instrument(skip_all)]
    async fn list_microschemas(&self) -> TargetResult<Vec<MicroschemaResponse>> {
        self.list("microschemas").await
    }

    #[instrument(skip_all)]
    async fn create_microschema(
        &self,
        microschema: &MicroschemaModel,
    ) -> TargetResult<MicroschemaResponse> {
        self.send(self.request(Method::POST, "microschemas")?.json(microschema))
            .await
    }

    #[instrument(skip_all)]
    async fn diff_microschema(
        &self,
        uuid: &str,
        microschema: &MicroschemaModel,
    ) -> TargetResult<Vec<SchemaChange>> {
        let res: SchemaChanges = self
            .send(
                self.request(Method::POST, &format!("microschemas/{}/diff", uuid))?
                    .json(microschema),
            )
            .await?;
        Ok(res.changes)
    }

    #[instrument(skip_all)]
    async fn update_microschema(
        &self,
        uuid: &str,
        microschema: &MicroschemaModel,
    ) -> TargetResult<MicroschemaResponse> {
        let path = format!("microschemas/{}", uuid);
        self.send_empty(self.request(Method::POST, &path)?.json(microschema))
            .await?;
        self.send(self.request(Method::GET, &path)?).await
    }

    #[instrument(skip_all)]
    async fn list_projects(&self) -> TargetResult<Vec<ProjectResponse>> {
        self.list("projects").await
    }

    #[instrument(skip_all, fields(name = %req.name))]
    async fn create_project(&self, req: &ProjectCreateRequest) -> TargetResult<ProjectResponse> {
        let path = match &req.uuid {
            Some(uuid) => format!("projects/{}", uuid),
            None => "projects".to_string(),
        };
        self.send(self.request(Method::POST, &path)?.json(req)).await
    }

    #[instrument(skip_all)]
    async fn delete_project(&self, uuid: &str) -> TargetResult<()> {
        self.send_empty(self.request(Method::DELETE, &format!("projects/{}", uuid))?)
            .await
    }

    async fn project_schemas(&self, project: &str) -> TargetResult<Vec<SchemaReference>> {
        self.list(&format!("{}/schemas", project)).await
    }

    async fn assign_schema(&self, project: &str, schema_uuid: &str) -> TargetResult<()> {
        self.send_empty(self.request(Method::POST, &format!("{}/schemas/{}", project, schema_uuid))?)
            .await
    }

    async fn project_microschemas(&self, project: &str) -> TargetResult<Vec<SchemaReference>> {
        self.list(&format!("{}/microschemas", project)).await
    }

    async fn assign_microschema(&self, project: &str, microschema_uuid: &str) -> TargetResult<()> {
        self.send_empty(self.request(
            Method::POST,
            &format!("{}/microschemas/{}", project, microschema_uuid),
        )?)
        .await
    }

    #[instrument(skip_all)]
    async fn list_branches(&self, project: &str) -> TargetResult<Vec<BranchResponse>> {
        self.list(&format!("{}/branches", project)).await
    }

    #[instrument(skip_all, fields(name = %req.name))]
    async fn create_branch(
        &self,
        project: &str,
        req: &BranchCreateRequest,
    ) -> TargetResult<BranchResponse> {
        self.send(self.request(Method::POST, &format!("{}/branches", project))?.json(req))
            .await
    }

    async fn update_branch(
        &self,
        project: &str,
        branch_uuid: &str,
        req: &BranchUpdateRequest,
    ) -> TargetResult<BranchResponse> {
        self.send(
            self.request(Method::POST, &format!("{}/branches/{}", project, branch_uuid))?
                .json(req),
        )
        .await
    }

    async fn set_branch_latest(&self, project: &str, branch_uuid: &str) -> TargetResult<()> {
        self.send_empty(self.request(
            Method::POST,
            &format!("{}/branches/{}/latest", project, branch_uuid),
        )?)
        .await
    }

    async fn add_branch_tag(
        &self,
        project: &str,
        branch_uuid: &str,
        tag: &TagReference,
    ) -> TargetResult<()> {
        let mut tags = self.load_branch(project, branch_uuid).await?.tags;
        if !tags.contains(tag) {
            tags.push(tag.clone());
        }
        self.set_branch_tags(project, branch_uuid, &tags).await
    }

    async fn remove_branch_tag(
        &self,
        project: &str,
        branch_uuid: &str,
        tag: &TagReference,
    ) -> TargetResult<()> {
        let mut tags = self.load_branch(project, branch_uuid).await?.tags;
        tags.retain(|t| t != tag);
        self.set_branch_tags(project, branch_uuid, &tags).await
    }

    #[instrument(skip_all)]
    async fn assign_branch_schemas(
        &self,
        project: &str,
        branch_uuid: &str,
        refs: &[SchemaReference],
    ) -> TargetResult<()> {
        let rb = self
            .request(Method::POST, &format!("{}/branches/{}/schemas", project, branch_uuid))?
            .json(&json!({ "schemas": refs }));
        self.send_empty(rb).await
    }

    #[instrument(skip_all)]
    async fn assign_branch_microschemas(
        &self,
        project: &str,
        branch_uuid: &str,
        refs: &[SchemaReference],
    ) -> TargetResult<()> {
        let rb = self
            .request(
                Method::POST,
                &format!("{}/branches/{}/microschemas", project, branch_uuid),
            )?
            .json(&json!({ "microschemas": refs }));
        self.send_empty(rb).await
    }

    async fn branch_migration_status(
        &self,
        project: &str,
        branch_uuid: &str,
    ) -> TargetResult<BranchMigrationStatus> {
        let schemas: BranchSchemas = self
            .send(self.request(Method::GET, &format!("{}/branches/{}/schemas", project, branch_uuid))?)
            .await?;
        let micro: BranchSchemas = self
            .send(self.request(
                Method::GET,
                &format!("{}/branches/{}/microschemas", project, branch_uuid),
            )?)
            .await?;
        let convert = |infos: Vec<BranchSchemaInfo>| {
            infos
                .into_iter()
                .map(|i| MigrationInfo {
                    name: i.name,
                    version: i.version,
                    status: i.migration_status.unwrap_or(MigrationState::Completed),
                })
                .collect()
        };
        Ok(BranchMigrationStatus {
            schemas: convert(schemas.schemas),
            microschemas: convert(micro.microschemas),
        })
    }

    async fn list_roles(&self) -> TargetResult<Vec<RoleResponse>> {
        self.list("roles").await
    }

    async fn project_read_roles(&self, project: &str) -> TargetResult<Vec<String>> {
        let perms: Vec<RolePermission> = self
            .list(&format!("projects/{}/rolePermissions", project))
            .await?;
        Ok(perms
            .into_iter()
            .filter(|p| p.perms.get("read").and_then(Value::as_bool).unwrap_or(false))
            .map(|p| p.role.name)
            .collect())
    }

    #[instrument(skip_all, fields(path = %target.path()))]
    async fn grant_roles(&self, target: &PermissionTarget, roles: &[String]) -> TargetResult<()> {
        let body = json!({
            "permissions": { "read": true, "readPublished": true },
            "recursive": false,
        });
        for role in roles {
            let uuid = self.role_uuid(role).await?;
            let rb = self
                .request(
                    Method::POST,
                    &format!("roles/{}/permissions/{}", uuid, target.path()),
                )?
                .json(&body);
            self.send_empty(rb).await?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(uuid = %uuid, language = %req.language))]
    async fn upsert_node(
        &self,
        scope: &Scope,
        uuid: &str,
        req: &NodeUpsertRequest,
    ) -> TargetResult<NodeResponse> {
        let rb = self.request(Method::POST, &format!("{}/nodes/{}", scope.project, uuid))?;
        let node: NodeResponse = self.send(with_branch(rb, scope).json(req)).await?;
        if req.publish && !node.published {
            self.publish_language(scope, uuid, &req.language).await?;
        }
        Ok(node)
    }

    #[instrument(skip_all, fields(uuid = %uuid))]
    async fn load_node(
        &self,
        scope: &Scope,
        uuid: &str,
        language: Option<&str>,
    ) -> TargetResult<Option<NodeResponse>> {
        let mut rb = self.request(Method::GET, &format!("{}/nodes/{}", scope.project, uuid))?;
        if let Some(lang) = language {
            rb = rb.query(&[("lang", lang)]);
        }
        match self.send(with_branch(rb, scope)).await {
            Ok(node) => Ok(Some(node)),
            Err(TargetError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn list_children(&self, scope: &Scope, uuid: &str) -> TargetResult<Vec<NodeResponse>> {
        let rb = self.request(
            Method::GET,
            &format!("{}/nodes/{}/children", scope.project, uuid),
        )?;
        let res: ListResponse<NodeResponse> = self.send(with_branch(rb, scope)).await?;
        Ok(res.data)
    }

    #[instrument(skip_all, fields(uuid = %uuid, parent_uuid = %parent_uuid))]
    async fn move_node(&self, scope: &Scope, uuid: &str, parent_uuid: &str) -> TargetResult<()> {
        let rb = self.request(
            Method::POST,
            &format!("{}/nodes/{}/moveTo/{}", scope.project, uuid, parent_uuid),
        )?;
        self.send_empty(with_branch(rb, scope)).await
    }

    async fn publish_language(&self, scope: &Scope, uuid: &str, language: &str) -> TargetResult<()> {
        let rb = self.request(
            Method::POST,
            &format!("{}/nodes/{}/languages/{}/published", scope.project, uuid, language),
        )?;
        self.send_empty(with_branch(rb, scope)).await
    }

    #[instrument(skip_all, fields(uuid = %uuid, language = %language))]
    async fn delete_language(&self, scope: &Scope, uuid: &str, language: &str) -> TargetResult<()> {
        let rb = self.request(
            Method::DELETE,
            &format!("{}/nodes/{}/languages/{}", scope.project, uuid, language),
        )?;
        self.send_empty(with_branch(rb, scope)).await
    }

    #[instrument(skip_all, fields(uuid = %uuid))]
    async fn delete_node(&self, scope: &Scope, uuid: &str) -> TargetResult<()> {
        let rb = self
            .request(Method::DELETE, &format!("{}/nodes/{}", scope.project, uuid))?
            .query(&[("recursive", "true")]);
        self.send_empty(with_branch(rb, scope)).await
    }

    async fn take_offline(&self, scope: &Scope, uuid: &str) -> TargetResult<()> {
        let rb = self.request(
            Method::DELETE,
            &format!("{}/nodes/{}/published", scope.project, uuid),
        )?;
        self.send_empty(with_branch(rb, scope)).await
    }

    #[instrument(skip_all, fields(uuid = %uuid, field = %upload.field))]
    async fn upload_binary(&self, scope: &Scope, uuid: &str, upload: &BinaryUpload) -> TargetResult<()> {
        let part = reqwest::multipart::Part::bytes(upload.data.clone())
            .file_name(upload.file_name.clone())
            .mime_str(&upload.mime_type)
            .map_err(|e| TargetError::BadRequest(format!("invalid mime type: {}", e)))?;
        let form = reqwest::multipart::Form::new()
            .text("language", upload.language.clone())
            .text("version", upload.version.clone())
            .part("binary", part);
        let rb = self.request(
            Method::POST,
            &format!("{}/nodes/{}/binary/{}", scope.project, uuid, upload.field),
        )?;
        self.send_empty(with_branch(rb, scope).multipart(form)).await
    }

    async fn set_focal_point(
        &self,
        scope: &Scope,
        uuid: &str,
        language: &str,
        field: &str,
        point: (f32, f32),
    ) -> TargetResult<()> {
        let body = json!({
            "language": language,
            "version": "draft",
            "fields": { field: { "focalPoint": { "x": point.0, "y": point.1 } } },
        });
        let rb = self.request(Method::POST, &format!("{}/nodes/{}", scope.project, uuid))?;
        self.send_empty(with_branch(rb, scope).json(&body)).await
    }

    #[instrument(skip_all, fields(method = %method, path = %path))]
    async fn plugin_request(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
    ) -> TargetResult<Value> {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|e| TargetError::BadRequest(format!("invalid method {}: {}", method, e)))?;
        let mut rb = self.request(method, path)?;
        if let Some(body) = body {
            rb = rb.json(body);
        }
        let raw = self.execute(rb).await?;
        if raw.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&raw).map_err(|e| TargetError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> MeshClient {
        MeshClient::new("https://mesh.example.com/api/v2", "secret").unwrap()
    }

    #[test]
    fn builds_authenticated_requests_relative_to_base() {
        let req = client()
            .build_request(Method::POST, "/projects", Some(&json!({ "name": "site" })))
            .unwrap();
        assert_eq!(req.url().as_str(), "https://mesh.example.com/api/v2/projects");
        assert_eq!(req.headers()["Authorization"], "Bearer secret");
        assert_eq!(req.headers()["content-type"], "application/json");
    }

    #[test]
    fn debug_does_not_leak_token() {
        let dbg = format!("{:?}", client());
        assert!(dbg.contains("mesh.example.com"));
        assert!(!dbg.contains("secret"));
    }

    #[test]
    fn maps_conflicts_with_colliding_identity() {
        let body = r#"{"message":"segment taken","properties":{"conflictingUuid":"abc","conflictingLanguage":"de","field":"slug"}}"#;
        match map_error(StatusCode::CONFLICT, body) {
            TargetError::Conflict(c) => {
                assert_eq!(c.message, "segment taken");
                assert_eq!(c.conflicting_uuid.as_deref(), Some("abc"));
                assert_eq!(c.conflicting_language.as_deref(), Some("de"));
                assert_eq!(c.field.as_deref(), Some("slug"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn maps_missing_parent_and_plain_errors() {
        let body = r#"{"message":"parent missing","i18nKey":"node_error_parent_not_found","properties":{"parentUuid":"p1"}}"#;
        assert_eq!(
            map_error(StatusCode::BAD_REQUEST, body),
            TargetError::MissingParent("p1".into())
        );
        assert_eq!(
            map_error(StatusCode::BAD_REQUEST, r#"{"message":"bad field"}"#),
            TargetError::BadRequest("bad field".into())
        );
        assert_eq!(
            map_error(StatusCode::NOT_FOUND, "gone"),
            TargetError::NotFound("gone".into())
        );
        assert!(map_error(StatusCode::BAD_GATEWAY, "").is_transient());
    }
}
