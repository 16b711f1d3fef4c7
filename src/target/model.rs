use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elasticsearch: Option<Value>,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            ..Default::default()
        }
    }

    pub fn list(name: impl Into<String>, list_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: "list".into(),
            list_type: Some(list_type.into()),
            ..Default::default()
        }
    }

    /// Same name, type, list type and restrictions; labels and index hints
    /// are ignored.
    pub fn structurally_equal(&self, other: &FieldSchema) -> bool {
        self.name == other.name
            && self.field_type == other.field_type
            && self.list_type == other.list_type
            && self.allow == other.allow
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SchemaModel {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_field: Option<String>,
    #[serde(default)]
    pub url_fields: Vec<String>,
    #[serde(default)]
    pub container: bool,
    #[serde(default)]
    pub fields: Vec<FieldSchema>,
}

impl SchemaModel {
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaResponse {
    pub uuid: String,
    pub version: String,
    #[serde(flatten)]
    pub model: SchemaModel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MicroschemaModel {
    pub name: String,
    /// Deterministic UUID of the content block definition this was derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldSchema>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MicroschemaResponse {
    pub uuid: String,
    pub version: String,
    #[serde(flatten)]
    pub model: MicroschemaModel,
}

/// Reference to a versioned schema or microschema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct SchemaReference {
    pub name: String,
    pub uuid: String,
    pub version: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeOperation {
    #[serde(rename = "ADDFIELD")]
    AddField,
    #[serde(rename = "REMOVEFIELD")]
    RemoveField,
    #[serde(rename = "UPDATEFIELD")]
    UpdateField,
    #[serde(rename = "CHANGEFIELDTYPE")]
    ChangeFieldType,
    #[serde(rename = "UPDATESCHEMA")]
    UpdateSchema,
    #[serde(rename = "UPDATEMICROSCHEMA")]
    UpdateMicroschema,
}

/// One entry of a structural diff computed by the target system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaChange {
    pub operation: ChangeOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SchemaChanges {
    #[serde(default)]
    pub changes: Vec<SchemaChange>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NameRef {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UuidRef {
    pub uuid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectCreateRequest {
    pub name: String,
    pub schema: NameRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
    /// Create the project at this uuid instead of a random one.
    #[serde(default, skip_serializing)]
    pub uuid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectResponse {
    pub uuid: String,
    pub name: String,
    pub root_node: UuidRef,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub struct TagReference {
    pub name: String,
    pub tag_family: String,
}

impl TagReference {
    pub fn new(family: &str, name: &str) -> Self {
        Self {
            name: name.into(),
            tag_family: family.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BranchResponse {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ssl: Option<bool>,
    #[serde(default)]
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub latest: bool,
    #[serde(default)]
    pub migrated: bool,
    #[serde(default)]
    pub tags: Vec<TagReference>,
}

impl BranchResponse {
    pub fn has_tag(&self, family: &str) -> bool {
        self.tags.iter().any(|t| t.tag_family == family)
    }

    pub fn tag_value(&self, family: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.tag_family == family)
            .map(|t| t.name.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BranchCreateRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub latest: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct BranchUpdateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
}

impl BranchUpdateRequest {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.hostname.is_none() && self.ssl.is_none() && self.path_prefix.is_none()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationState {
    Queued,
    Running,
    Completed,
    Failed,
}

impl MigrationState {
    pub fn is_pending(&self) -> bool {
        matches!(self, MigrationState::Queued | MigrationState::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrationInfo {
    pub name: String,
    pub version: String,
    pub status: MigrationState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BranchMigrationStatus {
    #[serde(default)]
    pub schemas: Vec<MigrationInfo>,
    #[serde(default)]
    pub microschemas: Vec<MigrationInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoleResponse {
    pub uuid: String,
    pub name: String,
}

/// Element a role permission is granted on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionTarget {
    Project { project: String },
    Branch { project: String, branch: String },
    Node { project: String, uuid: String },
}

impl PermissionTarget {
    pub fn path(&self) -> String {
        match self {
            PermissionTarget::Project { project } => format!("projects/{}", project),
            PermissionTarget::Branch { project, branch } => {
                format!("projects/{}/branches/{}", project, branch)
            }
            PermissionTarget::Node { project, uuid } => {
                format!("projects/{}/nodes/{}", project, uuid)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpsertRequest {
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_node: Option<UuidRef>,
    pub schema: NameRef,
    pub fields: Map<String, Value>,
    /// Publish with the upsert.
    #[serde(default)]
    pub publish: bool,
    /// Roles granted read permission together with the upsert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeResponse {
    pub uuid: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub available_languages: Vec<String>,
    #[serde(default)]
    pub parent_node: Option<UuidRef>,
    pub schema: NameRef,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub published: bool,
}

impl NodeResponse {
    pub fn parent_uuid(&self) -> Option<&str> {
        self.parent_node.as_ref().map(|p| p.uuid.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryUpload {
    pub field: String,
    pub language: String,
    pub version: String,
    pub file_name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Project and optional branch an item operation is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Scope {
    pub project: String,
    pub branch: Option<String>,
}

impl Scope {
    pub fn new(project: impl Into<String>, branch: Option<String>) -> Self {
        Self {
            project: project.into(),
            branch,
        }
    }
}
