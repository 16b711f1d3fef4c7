//! In-memory target system.
//!
//! Keeps projects, branches, versioned schemas, migration jobs, roles and
//! nodes with per-language content behind one mutex. Every call is appended
//! to a call log so tests can assert on ordering and on the absence of
//! mutations. Faults can be injected per node uuid and per migration.
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::model::*;
use super::{Conflict, TargetError, TargetResult, TargetService};
use crate::identity::wire;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: &'static str,
    pub target: String,
    pub mutating: bool,
}

#[derive(Debug, Clone)]
struct Versioned<T> {
    uuid: String,
    versions: Vec<T>,
}

impl<T> Versioned<T> {
    fn version(&self) -> String {
        format!("{}.0", self.versions.len())
    }
}

#[derive(Debug, Clone)]
struct Migration {
    info: MigrationInfo,
    remaining_polls: u32,
}

#[derive(Debug, Clone)]
struct StoredBranch {
    resp: BranchResponse,
    schemas: BTreeMap<String, SchemaReference>,
    microschemas: BTreeMap<String, SchemaReference>,
    schema_jobs: Vec<Migration>,
    microschema_jobs: Vec<Migration>,
}

#[derive(Debug, Clone)]
struct StoredProject {
    resp: ProjectResponse,
    schemas: BTreeSet<String>,
    microschemas: BTreeSet<String>,
    branches: Vec<StoredBranch>,
}

#[derive(Debug, Clone, Default)]
struct LanguageContent {
    fields: Map<String, Value>,
    published: bool,
    version: u32,
}

#[derive(Debug, Clone)]
struct StoredNode {
    schema: String,
    parent: Option<String>,
    languages: BTreeMap<String, LanguageContent>,
}

#[derive(Debug, Default)]
struct State {
    schemas: BTreeMap<String, Versioned<SchemaModel>>,
    microschemas: BTreeMap<String, Versioned<MicroschemaModel>>,
    projects: BTreeMap<String, StoredProject>,
    nodes: HashMap<(String, String), BTreeMap<String, StoredNode>>,
    roles: Vec<RoleResponse>,
    grants: BTreeSet<(String, String)>,
    calls: Vec<Call>,
    upsert_faults: HashMap<String, VecDeque<TargetError>>,
    migration_polls: u32,
    failing_migrations: BTreeSet<String>,
    routing_delay: u32,
    unrouted: HashMap<String, u32>,
}

#[derive(Debug, Default)]
pub struct MemoryTarget {
    state: Mutex<State>,
}

fn random_uuid() -> String {
    wire(&Uuid::new_v4())
}

fn changed<T: PartialEq + serde::Serialize>(
    props: &mut Map<String, Value>,
    key: &str,
    old: &T,
    new: &T,
) {
    if old != new {
        props.insert(key.to_string(), json!(new));
    }
}

fn diff_fields(old: &[FieldSchema], new: &[FieldSchema]) -> Vec<SchemaChange> {
    let mut changes = Vec::new();
    for field in new {
        match old.iter().find(|f| f.name == field.name) {
            None => {
                let mut properties = Map::new();
                properties.insert("type".into(), json!(field.field_type));
                if let Some(list_type) = &field.list_type {
                    properties.insert("listType".into(), json!(list_type));
                }
                changes.push(SchemaChange {
                    operation: ChangeOperation::AddField,
                    field: Some(field.name.clone()),
                    properties,
                });
            }
            Some(existing)
                if existing.field_type != field.field_type
                    || existing.list_type != field.list_type =>
            {
                let mut properties = Map::new();
                properties.insert("type".into(), json!(field.field_type));
                changes.push(SchemaChange {
                    operation: ChangeOperation::ChangeFieldType,
                    field: Some(field.name.clone()),
                    properties,
                });
            }
            Some(existing) => {
                let mut properties = Map::new();
                changed(&mut properties, "label", &existing.label, &field.label);
                changed(&mut properties, "allow", &existing.allow, &field.allow);
                changed(&mut properties, "required", &existing.required, &field.required);
                changed(
                    &mut properties,
                    "elasticsearch",
                    &existing.elasticsearch,
                    &field.elasticsearch,
                );
                if !properties.is_empty() {
                    changes.push(SchemaChange {
                        operation: ChangeOperation::UpdateField,
                        field: Some(field.name.clone()),
                        properties,
                    });
                }
            }
        }
    }
    for field in old {
        if !new.iter().any(|f| f.name == field.name) {
            changes.push(SchemaChange {
                operation: ChangeOperation::RemoveField,
                field: Some(field.name.clone()),
                properties: Map::new(),
            });
        }
    }
    changes
}

fn field_order(fields: &[FieldSchema]) -> Vec<&str> {
    fields.iter().map(|f| f.name.as_str()).collect()
}

/// Structural difference between two schema versions.
pub fn diff_schema_models(old: &SchemaModel, new: &SchemaModel) -> Vec<SchemaChange> {
    let mut changes = diff_fields(&old.fields, &new.fields);
    let mut props = Map::new();
    changed(&mut props, "description", &old.description, &new.description);
    changed(&mut props, "displayField", &old.display_field, &new.display_field);
    changed(&mut props, "segmentField", &old.segment_field, &new.segment_field);
    changed(&mut props, "urlFields", &old.url_fields, &new.url_fields);
    changed(&mut props, "container", &old.container, &new.container);
    changed(&mut props, "order", &field_order(&old.fields), &field_order(&new.fields));
    if !props.is_empty() {
        changes.push(SchemaChange {
            operation: ChangeOperation::UpdateSchema,
            field: None,
            properties: props,
        });
    }
    changes
}

pub fn diff_microschema_models(old: &MicroschemaModel, new: &MicroschemaModel) -> Vec<SchemaChange> {
    let mut changes = diff_fields(&old.fields, &new.fields);
    let mut props = Map::new();
    changed(&mut props, "description", &old.description, &new.description);
    changed(&mut props, "order", &field_order(&old.fields), &field_order(&new.fields));
    if !props.is_empty() {
        changes.push(SchemaChange {
            operation: ChangeOperation::UpdateMicroschema,
            field: None,
            properties: props,
        });
    }
    changes
}

fn not_found(what: &str, id: &str) -> TargetError {
    TargetError::NotFound(format!("{} {}", what, id))
}

impl State {
    fn record(&mut self, op: &'static str, target: impl Into<String>, mutating: bool) {
        self.calls.push(Call {
            op,
            target: target.into(),
            mutating,
        });
    }

    fn project(&self, name: &str) -> TargetResult<&StoredProject> {
        self.projects.get(name).ok_or_else(|| not_found("project", name))
    }

    fn project_mut(&mut self, name: &str) -> TargetResult<&mut StoredProject> {
        self.projects
            .get_mut(name)
            .ok_or_else(|| not_found("project", name))
    }

    /// Newly created projects are not routable for the configured number of lookups.
    fn check_routed(&mut self, project: &str) -> TargetResult<()> {
        if let Some(left) = self.unrouted.get_mut(project) {
            if *left > 0 {
                *left -= 1;
                return Err(not_found("project", project));
            }
        }
        Ok(())
    }

    fn branch_mut(&mut self, project: &str, uuid: &str) -> TargetResult<&mut StoredBranch> {
        self.project_mut(project)?
            .branches
            .iter_mut()
            .find(|b| b.resp.uuid == uuid)
            .ok_or_else(|| not_found("branch", uuid))
    }

    fn branch_name(&self, scope: &Scope) -> TargetResult<String> {
        let project = self.project(&scope.project)?;
        match &scope.branch {
            Some(name) => project
                .branches
                .iter()
                .find(|b| &b.resp.name == name)
                .map(|b| b.resp.name.clone())
                .ok_or_else(|| not_found("branch", name)),
            None => project
                .branches
                .iter()
                .find(|b| b.resp.latest)
                .map(|b| b.resp.name.clone())
                .ok_or_else(|| not_found("latest branch of", &scope.project)),
        }
    }

    fn nodes_mut(&mut self, scope: &Scope) -> TargetResult<&mut BTreeMap<String, StoredNode>> {
        let branch = self.branch_name(scope)?;
        Ok(self
            .nodes
            .entry((scope.project.clone(), branch))
            .or_default())
    }

    fn nodes(&self, scope: &Scope) -> TargetResult<Option<&BTreeMap<String, StoredNode>>> {
        let branch = self.branch_name(scope)?;
        Ok(self.nodes.get(&(scope.project.clone(), branch)))
    }

    fn schema_ref(&self, name: &str) -> Option<SchemaReference> {
        self.schemas.get(name).map(|s| SchemaReference {
            name: name.to_string(),
            uuid: s.uuid.clone(),
            version: s.version(),
        })
    }

    fn microschema_ref(&self, name: &str) -> Option<SchemaReference> {
        self.microschemas.get(name).map(|s| SchemaReference {
            name: name.to_string(),
            uuid: s.uuid.clone(),
            version: s.version(),
        })
    }

    fn start_migration(&self, name: &str, version: &str) -> Migration {
        let status = if self.failing_migrations.contains(name) {
            MigrationState::Failed
        } else if self.migration_polls > 0 {
            MigrationState::Running
        } else {
            MigrationState::Completed
        };
        Migration {
            info: MigrationInfo {
                name: name.to_string(),
                version: version.to_string(),
                status,
            },
            remaining_polls: self.migration_polls,
        }
    }
}

fn node_response(uuid: &str, node: &StoredNode, language: Option<&str>) -> NodeResponse {
    let lang = language
        .filter(|l| node.languages.contains_key(*l))
        .map(str::to_string)
        .or_else(|| node.languages.keys().next().cloned());
    let content = lang.as_ref().and_then(|l| node.languages.get(l));
    NodeResponse {
        uuid: uuid.to_string(),
        language: lang.clone(),
        available_languages: node.languages.keys().cloned().collect(),
        parent_node: node.parent.clone().map(|uuid| UuidRef { uuid }),
        schema: NameRef {
            name: node.schema.clone(),
        },
        fields: content.map(|c| c.fields.clone()).unwrap_or_default(),
        version: content.map(|c| format!("{}.0", c.version)).unwrap_or_default(),
        published: content.map_or(false, |c| c.published),
    }
}

fn remove_subtree(nodes: &mut BTreeMap<String, StoredNode>, uuid: &str) {
    let children: Vec<String> = nodes
        .iter()
        .filter(|(_, n)| n.parent.as_deref() == Some(uuid))
        .map(|(u, _)| u.clone())
        .collect();
    for child in children {
        remove_subtree(nodes, &child);
    }
    nodes.remove(uuid);
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds roles known to the target system.
    pub fn with_roles(self, names: &[&str]) -> Self {
        {
            let mut st = self.lock();
            for name in names {
                st.roles.push(RoleResponse {
                    uuid: random_uuid(),
                    name: name.to_string(),
                });
            }
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The next upsert of `uuid` fails with `err`. Faults queue up per uuid.
    pub fn inject_upsert_error(&self, uuid: &str, err: TargetError) {
        self.lock()
            .upsert_faults
            .entry(uuid.to_string())
            .or_default()
            .push_back(err);
    }

    /// Migrations started from now on stay running for `polls` status requests.
    pub fn stall_migrations(&self, polls: u32) {
        self.lock().migration_polls = polls;
    }

    /// Migrations of the named schema started from now on fail.
    pub fn fail_migrations_of(&self, name: &str) {
        self.lock().failing_migrations.insert(name.to_string());
    }

    /// Projects created from now on answer "not found" for the first
    /// `lookups` project-scoped requests.
    pub fn delay_project_routing(&self, lookups: u32) {
        self.lock().routing_delay = lookups;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn mutations(&self) -> Vec<Call> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.mutating)
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn project_names(&self) -> Vec<String> {
        self.lock().projects.keys().cloned().collect()
    }

    pub fn branch(&self, project: &str, name: &str) -> Option<BranchResponse> {
        self.lock()
            .projects
            .get(project)?
            .branches
            .iter()
            .find(|b| b.resp.name == name)
            .map(|b| b.resp.clone())
    }

    pub fn branch_schemas(&self, project: &str, name: &str) -> Vec<SchemaReference> {
        let st = self.lock();
        st.projects
            .get(project)
            .and_then(|p| p.branches.iter().find(|b| b.resp.name == name))
            .map(|b| b.schemas.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn schema(&self, name: &str) -> Option<SchemaResponse> {
        let st = self.lock();
        let stored = st.schemas.get(name)?;
        Some(SchemaResponse {
            uuid: stored.uuid.clone(),
            version: stored.version(),
            model: stored.versions.last()?.clone(),
        })
    }

    pub fn node(&self, scope: &Scope, uuid: &str, language: Option<&str>) -> Option<NodeResponse> {
        let st = self.lock();
        let nodes = st.nodes(scope).ok()??;
        nodes.get(uuid).map(|n| node_response(uuid, n, language))
    }

    pub fn node_count(&self, scope: &Scope) -> usize {
        let st = self.lock();
        st.nodes(scope).ok().flatten().map_or(0, |n| n.len())
    }

    /// Roles granted read permission on the element with the given path.
    pub fn granted(&self, path: &str) -> Vec<String> {
        self.lock()
            .grants
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

#[async_trait]
impl TargetService for MemoryTarget {
    async fn find_schema(&self, name: &str) -> TargetResult<Option<SchemaResponse>> {
        self.lock().record("find_schema", name, false);
        Ok(self.schema(name))
    }

    async fn create_schema(&self, schema: &SchemaModel) -> TargetResult<SchemaResponse> {
        let mut st = self.lock();
        st.record("create_schema", &schema.name, true);
        if st.schemas.contains_key(&schema.name) {
            return Err(TargetError::Conflict(Conflict {
                message: format!("schema {} exists", schema.name),
                ..Default::default()
            }));
        }
        let stored = Versioned {
            uuid: random_uuid(),
            versions: vec![schema.clone()],
        };
        let resp = SchemaResponse {
            uuid: stored.uuid.clone(),
            version: stored.version(),
            model: schema.clone(),
        };
        st.schemas.insert(schema.name.clone(), stored);
        Ok(resp)
    }

    async fn diff_schema(&self, uuid: &str, schema: &SchemaModel) -> TargetResult<Vec<SchemaChange>> {
        let mut st = self.lock();
        st.record("diff_schema", &schema.name, false);
        let stored = st
            .schemas
            .values()
            .find(|s| s.uuid == uuid)
            .ok_or_else(|| not_found("schema", uuid))?;
        let current = stored.versions.last().ok_or_else(|| not_found("schema", uuid))?;
        Ok(diff_schema_models(current, schema))
    }

    async fn update_schema(&self, uuid: &str, schema: &SchemaModel) -> TargetResult<SchemaResponse> {
        let mut st = self.lock();
        st.record("update_schema", &schema.name, true);
        let stored = st
            .schemas
            .values_mut()
            .find(|s| s.uuid == uuid)
            .ok_or_else(|| not_found("schema", uuid))?;
        stored.versions.push(schema.clone());
        Ok(SchemaResponse {
            uuid: stored.uuid.clone(),
            version: stored.version(),
            model: schema.clone(),
        })
    }

    async fn list_microschemas(&self) -> TargetResult<Vec<MicroschemaResponse>> {
        let mut st = self.lock();
        st.record("list_microschemas", "", false);
        Ok(st
            .microschemas
            .values()
            .filter_map(|m| {
                Some(MicroschemaResponse {
                    uuid: m.uuid.clone(),
                    version: m.version(),
                    model: m.versions.last()?.clone(),
                })
            })
            .collect())
    }

    async fn create_microschema(
        &self,
        microschema: &MicroschemaModel,
    ) -> TargetResult<MicroschemaResponse> {
        let mut st = self.lock();
        st.record("create_microschema", &microschema.name, true);
        if st.microschemas.contains_key(&microschema.name) {
            return Err(TargetError::Conflict(Conflict {
                message: format!("microschema {} exists", microschema.name),
                ..Default::default()
            }));
        }
        let stored = Versioned {
            uuid: random_uuid(),
            versions: vec![microschema.clone()],
        };
        let resp = MicroschemaResponse {
            uuid: stored.uuid.clone(),
            version: stored.version(),
            model: microschema.clone(),
        };
        st.microschemas.insert(microschema.name.clone(), stored);
        Ok(resp)
    }

    async fn diff_microschema(
        &self,
        uuid: &str,
        microschema: &MicroschemaModel,
    ) -> TargetResult<Vec<SchemaChange>> {
        let mut st = self.lock();
        st.record("diff_microschema", &microschema.name, false);
        let stored = st
            .microschemas
            .values()
            .find(|s| s.uuid == uuid)
            .ok_or_else(|| not_found("microschema", uuid))?;
        let current = stored
            .versions
            .last()
            .ok_or_else(|| not_found("microschema", uuid))?;
        Ok(diff_microschema_models(current, microschema))
    }

    async fn update_microschema(
        &self,
        uuid: &str,
        microschema: &MicroschemaModel,
    ) -> TargetResult<MicroschemaResponse> {
        let mut st = self.lock();
        st.record("update_microschema", &microschema.name, true);
        let stored = st
            .microschemas
            .values_mut()
            .find(|s| s.uuid == uuid)
            .ok_or_else(|| not_found("microschema", uuid))?;
        stored.versions.push(microschema.clone());
        Ok(MicroschemaResponse {
            uuid: stored.uuid.clone(),
            version: stored.version(),
            model: microschema.clone(),
        })
    }

    async fn list_projects(&self) -> TargetResult<Vec<ProjectResponse>> {
        let mut st = self.lock();
        st.record("list_projects", "", false);
        Ok(st.projects.values().map(|p| p.resp.clone()).collect())
    }

    async fn create_project(&self, req: &ProjectCreateRequest) -> TargetResult<ProjectResponse> {
        let mut st = self.lock();
        st.record("create_project", &req.name, true);
        if st.projects.contains_key(&req.name) {
            return Err(TargetError::Conflict(Conflict {
                message: format!("project {} exists", req.name),
                ..Default::default()
            }));
        }
        let root_schema = st
            .schema_ref(&req.schema.name)
            .ok_or_else(|| TargetError::BadRequest(format!("unknown schema {}", req.schema.name)))?;
        let resp = ProjectResponse {
            uuid: req.uuid.clone().unwrap_or_else(random_uuid),
            name: req.name.clone(),
            root_node: UuidRef {
                uuid: random_uuid(),
            },
        };
        let branch = StoredBranch {
            resp: BranchResponse {
                uuid: random_uuid(),
                name: req.name.clone(),
                hostname: req.hostname.clone(),
                ssl: req.ssl,
                path_prefix: req.path_prefix.clone(),
                latest: true,
                migrated: true,
                tags: Vec::new(),
            },
            schemas: BTreeMap::from([(root_schema.name.clone(), root_schema.clone())]),
            microschemas: BTreeMap::new(),
            schema_jobs: Vec::new(),
            microschema_jobs: Vec::new(),
        };
        let root = StoredNode {
            schema: root_schema.name.clone(),
            parent: None,
            languages: BTreeMap::new(),
        };
        st.nodes.insert(
            (req.name.clone(), req.name.clone()),
            BTreeMap::from([(resp.root_node.uuid.clone(), root)]),
        );
        st.projects.insert(
            req.name.clone(),
            StoredProject {
                resp: resp.clone(),
                schemas: BTreeSet::from([root_schema.uuid]),
                microschemas: BTreeSet::new(),
                branches: vec![branch],
            },
        );
        let delay = st.routing_delay;
        if delay > 0 {
            st.unrouted.insert(req.name.clone(), delay);
        }
        Ok(resp)
    }

    async fn delete_project(&self, uuid: &str) -> TargetResult<()> {
        let mut st = self.lock();
        st.record("delete_project", uuid, true);
        let name = st
            .projects
            .values()
            .find(|p| p.resp.uuid == uuid)
            .map(|p| p.resp.name.clone())
            .ok_or_else(|| not_found("project", uuid))?;
        st.projects.remove(&name);
        st.nodes.retain(|(project, _), _| project != &name);
        Ok(())
    }

    async fn project_schemas(&self, project: &str) -> TargetResult<Vec<SchemaReference>> {
        let mut st = self.lock();
        st.record("project_schemas", project, false);
        st.check_routed(project)?;
        let uuids = st.project(project)?.schemas.clone();
        Ok(st
            .schemas
            .iter()
            .filter(|(_, s)| uuids.contains(&s.uuid))
            .filter_map(|(name, _)| st.schema_ref(name))
            .collect())
    }

    async fn assign_schema(&self, project: &str, schema_uuid: &str) -> TargetResult<()> {
        let mut st = self.lock();
        st.record("assign_schema", format!("{}/{}", project, schema_uuid), true);
        st.project_mut(project)?.schemas.insert(schema_uuid.to_string());
        Ok(())
    }

    async fn project_microschemas(&self, project: &str) -> TargetResult<Vec<SchemaReference>> {
        let mut st = self.lock();
        st.record("project_microschemas", project, false);
        st.check_routed(project)?;
        let uuids = st.project(project)?.microschemas.clone();
        Ok(st
            .microschemas
            .iter()
            .filter(|(_, s)| uuids.contains(&s.uuid))
            .filter_map(|(name, _)| st.microschema_ref(name))
            .collect())
    }

    async fn assign_microschema(&self, project: &str, microschema_uuid: &str) -> TargetResult<()> {
        let mut st = self.lock();
        st.record(
            "assign_microschema",
            format!("{}/{}", project, microschema_uuid),
            true,
        );
        st.project_mut(project)?
            .microschemas
            .insert(microschema_uuid.to_string());
        Ok(())
    }

    async fn list_branches(&self, project: &str) -> TargetResult<Vec<BranchResponse>> {
        let mut st = self.lock();
        st.record("list_branches", project, false);
        st.check_routed(project)?;
        Ok(st
            .project(project)?
            .branches
            .iter()
            .map(|b| b.resp.clone())
            .collect())
    }

    async fn create_branch(
        &self,
        project: &str,
        req: &BranchCreateRequest,
    ) -> TargetResult<BranchResponse> {
        let mut st = self.lock();
        st.record("create_branch", format!("{}/{}", project, req.name), true);
        let base = {
            let p = st.project(project)?;
            if p.branches.iter().any(|b| b.resp.name == req.name) {
                return Err(TargetError::Conflict(Conflict {
                    message: format!("branch {} exists", req.name),
                    ..Default::default()
                }));
            }
            p.branches
                .iter()
                .find(|b| b.resp.latest)
                .cloned()
                .ok_or_else(|| not_found("latest branch of", project))?
        };
        let base_nodes = st
            .nodes
            .get(&(project.to_string(), base.resp.name.clone()))
            .cloned()
            .unwrap_or_default();
        let resp = BranchResponse {
            uuid: random_uuid(),
            name: req.name.clone(),
            hostname: req.hostname.clone(),
            ssl: req.ssl,
            path_prefix: req.path_prefix.clone(),
            latest: req.latest,
            migrated: true,
            tags: Vec::new(),
        };
        let p = st.project_mut(project)?;
        if req.latest {
            p.branches.iter_mut().for_each(|b| b.resp.latest = false);
        }
        p.branches.push(StoredBranch {
            resp: resp.clone(),
            schemas: base.schemas,
            microschemas: base.microschemas,
            schema_jobs: Vec::new(),
            microschema_jobs: Vec::new(),
        });
        st.nodes
            .insert((project.to_string(), req.name.clone()), base_nodes);
        Ok(resp)
    }

    async fn update_branch(
        &self,
        project: &str,
        branch_uuid: &str,
        req: &BranchUpdateRequest,
    ) -> TargetResult<BranchResponse> {
        let mut st = self.lock();
        st.record("update_branch", format!("{}/{}", project, branch_uuid), true);
        let branch = st.branch_mut(project, branch_uuid)?;
        let old_name = branch.resp.name.clone();
        if let Some(name) = &req.name {
            branch.resp.name = name.clone();
        }
        if let Some(hostname) = &req.hostname {
            branch.resp.hostname = Some(hostname.clone());
        }
        if let Some(ssl) = req.ssl {
            branch.resp.ssl = Some(ssl);
        }
        if let Some(prefix) = &req.path_prefix {
            branch.resp.path_prefix = Some(prefix.clone());
        }
        let resp = branch.resp.clone();
        if resp.name != old_name {
            if let Some(nodes) = st.nodes.remove(&(project.to_string(), old_name)) {
                st.nodes.insert((project.to_string(), resp.name.clone()), nodes);
            }
        }
        Ok(resp)
    }

    async fn set_branch_latest(&self, project: &str, branch_uuid: &str) -> TargetResult<()> {
        let mut st = self.lock();
        st.record("set_branch_latest", format!("{}/{}", project, branch_uuid), true);
        let p = st.project_mut(project)?;
        if !p.branches.iter().any(|b| b.resp.uuid == branch_uuid) {
            return Err(not_found("branch", branch_uuid));
        }
        for b in p.branches.iter_mut() {
            b.resp.latest = b.resp.uuid == branch_uuid;
        }
        Ok(())
    }

    async fn add_branch_tag(
        &self,
        project: &str,
        branch_uuid: &str,
        tag: &TagReference,
    ) -> TargetResult<()> {
        let mut st = self.lock();
        st.record(
            "add_branch_tag",
            format!("{}/{}:{}={}", project, branch_uuid, tag.tag_family, tag.name),
            true,
        );
        let branch = st.branch_mut(project, branch_uuid)?;
        if !branch.resp.tags.contains(tag) {
            branch.resp.tags.push(tag.clone());
        }
        Ok(())
    }

    async fn remove_branch_tag(
        &self,
        project: &str,
        branch_uuid: &str,
        tag: &TagReference,
    ) -> TargetResult<()> {
        let mut st = self.lock();
        st.record(
            "remove_branch_tag",
            format!("{}/{}:{}={}", project, branch_uuid, tag.tag_family, tag.name),
            true,
        );
        st.branch_mut(project, branch_uuid)?
            .resp
            .tags
            .retain(|t| t != tag);
        Ok(())
    }

    async fn assign_branch_schemas(
        &self,
        project: &str,
        branch_uuid: &str,
        refs: &[SchemaReference],
    ) -> TargetResult<()> {
        let mut st = self.lock();
        st.record("assign_branch_schemas", format!("{}/{}", project, branch_uuid), true);
        let jobs: Vec<(SchemaReference, Migration)> = refs
            .iter()
            .map(|r| (r.clone(), st.start_migration(&r.name, &r.version)))
            .collect();
        let branch = st.branch_mut(project, branch_uuid)?;
        for (r, job) in jobs {
            let previous = branch.schemas.insert(r.name.clone(), r.clone());
            if previous.map_or(false, |p| p.version != r.version) {
                branch.schema_jobs.retain(|j| j.info.name != r.name);
                branch.schema_jobs.push(job);
            }
        }
        Ok(())
    }

    async fn assign_branch_microschemas(
        &self,
        project: &str,
        branch_uuid: &str,
        refs: &[SchemaReference],
    ) -> TargetResult<()> {
        let mut st = self.lock();
        st.record(
            "assign_branch_microschemas",
            format!("{}/{}", project, branch_uuid),
            true,
        );
        let jobs: Vec<(SchemaReference, Migration)> = refs
            .iter()
            .map(|r| (r.clone(), st.start_migration(&r.name, &r.version)))
            .collect();
        let branch = st.branch_mut(project, branch_uuid)?;
        for (r, job) in jobs {
            let previous = branch.microschemas.insert(r.name.clone(), r.clone());
            if previous.map_or(false, |p| p.version != r.version) {
                branch.microschema_jobs.retain(|j| j.info.name != r.name);
                branch.microschema_jobs.push(job);
            }
        }
        Ok(())
    }

    async fn branch_migration_status(
        &self,
        project: &str,
        branch_uuid: &str,
    ) -> TargetResult<BranchMigrationStatus> {
        let mut st = self.lock();
        st.record(
            "branch_migration_status",
            format!("{}/{}", project, branch_uuid),
            false,
        );
        let branch = st.branch_mut(project, branch_uuid)?;
        let poll = |jobs: &mut Vec<Migration>| -> Vec<MigrationInfo> {
            jobs.iter_mut()
                .map(|j| {
                    if j.info.status == MigrationState::Running {
                        if j.remaining_polls == 0 {
                            j.info.status = MigrationState::Completed;
                        } else {
                            j.remaining_polls -= 1;
                        }
                    }
                    j.info.clone()
                })
                .collect()
        };
        let mut status = BranchMigrationStatus {
            schemas: poll(&mut branch.schema_jobs),
            microschemas: poll(&mut branch.microschema_jobs),
        };
        // assigned versions without a job are reported as migrated
        for r in branch.schemas.values() {
            if !status.schemas.iter().any(|i| i.name == r.name) {
                status.schemas.push(MigrationInfo {
                    name: r.name.clone(),
                    version: r.version.clone(),
                    status: MigrationState::Completed,
                });
            }
        }
        for r in branch.microschemas.values() {
            if !status.microschemas.iter().any(|i| i.name == r.name) {
                status.microschemas.push(MigrationInfo {
                    name: r.name.clone(),
                    version: r.version.clone(),
                    status: MigrationState::Completed,
                });
            }
        }
        Ok(status)
    }

    async fn list_roles(&self) -> TargetResult<Vec<RoleResponse>> {
        let mut st = self.lock();
        st.record("list_roles", "", false);
        Ok(st.roles.clone())
    }

    async fn project_read_roles(&self, project: &str) -> TargetResult<Vec<String>> {
        let mut st = self.lock();
        st.record("project_read_roles", project, false);
        let path = PermissionTarget::Project {
            project: project.to_string(),
        }
        .path();
        Ok(st
            .grants
            .iter()
            .filter(|(p, _)| *p == path)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn grant_roles(&self, target: &PermissionTarget, roles: &[String]) -> TargetResult<()> {
        let mut st = self.lock();
        let path = target.path();
        st.record("grant_roles", format!("{}:{}", path, roles.join(",")), true);
        for role in roles {
            if !st.roles.iter().any(|r| &r.name == role) {
                return Err(not_found("role", role));
            }
        }
        for role in roles {
            st.grants.insert((path.clone(), role.clone()));
        }
        Ok(())
    }

    async fn upsert_node(
        &self,
        scope: &Scope,
        uuid: &str,
        req: &NodeUpsertRequest,
    ) -> TargetResult<NodeResponse> {
        let mut st = self.lock();
        st.record("upsert_node", format!("{}/{}", uuid, req.language), true);
        st.check_routed(&scope.project)?;
        if let Some(err) = st.upsert_faults.get_mut(uuid).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        let segment_field = st
            .schemas
            .get(&req.schema.name)
            .and_then(|s| s.versions.last())
            .ok_or_else(|| TargetError::BadRequest(format!("unknown schema {}", req.schema.name)))?
            .segment_field
            .clone();
        let nodes = st.nodes_mut(scope)?;
        let parent = match (&req.parent_node, nodes.get(uuid)) {
            (Some(p), _) => {
                if !nodes.contains_key(&p.uuid) {
                    return Err(TargetError::MissingParent(p.uuid.clone()));
                }
                Some(p.uuid.clone())
            }
            (None, Some(existing)) => existing.parent.clone(),
            (None, None) => {
                return Err(TargetError::BadRequest(format!(
                    "node {} needs a parent",
                    uuid
                )))
            }
        };
        let effective_parent = nodes
            .get(uuid)
            .map(|n| n.parent.clone())
            .unwrap_or_else(|| parent.clone());

        if let Some(segment) = segment_field.as_ref() {
            let value = req.fields.get(segment).filter(|v| !v.is_null());
            if let Some(value) = value {
                let clash = nodes.iter().find(|(other_uuid, other)| {
                    other_uuid.as_str() != uuid
                        && other.parent == effective_parent
                        && other
                            .languages
                            .get(&req.language)
                            .and_then(|c| c.fields.get(segment))
                            == Some(value)
                });
                if let Some((other_uuid, _)) = clash {
                    return Err(TargetError::Conflict(Conflict {
                        message: format!("segment {} is taken", value),
                        conflicting_uuid: Some(other_uuid.clone()),
                        conflicting_language: Some(req.language.clone()),
                        field: Some(segment.clone()),
                    }));
                }
            }
        }

        let node = nodes.entry(uuid.to_string()).or_insert_with(|| StoredNode {
            schema: req.schema.name.clone(),
            parent: parent.clone(),
            languages: BTreeMap::new(),
        });
        node.schema = req.schema.name.clone();
        let content = node.languages.entry(req.language.clone()).or_default();
        for (k, v) in &req.fields {
            content.fields.insert(k.clone(), v.clone());
        }
        content.version += 1;
        if req.publish {
            content.published = true;
        }
        let resp = node_response(uuid, node, Some(&req.language));
        if let Some(roles) = &req.grant {
            let path = PermissionTarget::Node {
                project: scope.project.clone(),
                uuid: uuid.to_string(),
            }
            .path();
            for role in roles {
                st.grants.insert((path.clone(), role.clone()));
            }
        }
        Ok(resp)
    }

    async fn load_node(
        &self,
        scope: &Scope,
        uuid: &str,
        language: Option<&str>,
    ) -> TargetResult<Option<NodeResponse>> {
        let mut st = self.lock();
        st.record("load_node", uuid, false);
        Ok(st
            .nodes(scope)?
            .and_then(|nodes| nodes.get(uuid))
            .map(|n| node_response(uuid, n, language)))
    }

    async fn list_children(&self, scope: &Scope, uuid: &str) -> TargetResult<Vec<NodeResponse>> {
        let mut st = self.lock();
        st.record("list_children", uuid, false);
        let Some(nodes) = st.nodes(scope)? else {
            return Ok(Vec::new());
        };
        if !nodes.contains_key(uuid) {
            return Err(not_found("node", uuid));
        }
        Ok(nodes
            .iter()
            .filter(|(_, n)| n.parent.as_deref() == Some(uuid))
            .map(|(u, n)| node_response(u, n, None))
            .collect())
    }

    async fn move_node(&self, scope: &Scope, uuid: &str, parent_uuid: &str) -> TargetResult<()> {
        let mut st = self.lock();
        st.record("move_node", format!("{}->{}", uuid, parent_uuid), true);
        let nodes = st.nodes_mut(scope)?;
        if !nodes.contains_key(parent_uuid) {
            return Err(TargetError::MissingParent(parent_uuid.to_string()));
        }
        let node = nodes.get_mut(uuid).ok_or_else(|| not_found("node", uuid))?;
        node.parent = Some(parent_uuid.to_string());
        Ok(())
    }

    async fn publish_language(&self, scope: &Scope, uuid: &str, language: &str) -> TargetResult<()> {
        let mut st = self.lock();
        st.record("publish_language", format!("{}/{}", uuid, language), true);
        let content = st
            .nodes_mut(scope)?
            .get_mut(uuid)
            .and_then(|n| n.languages.get_mut(language))
            .ok_or_else(|| not_found("node language", &format!("{}/{}", uuid, language)))?;
        content.published = true;
        Ok(())
    }

    async fn delete_language(&self, scope: &Scope, uuid: &str, language: &str) -> TargetResult<()> {
        let mut st = self.lock();
        st.record("delete_language", format!("{}/{}", uuid, language), true);
        let nodes = st.nodes_mut(scope)?;
        let node = nodes.get_mut(uuid).ok_or_else(|| not_found("node", uuid))?;
        if node.languages.remove(language).is_none() {
            return Err(not_found("node language", &format!("{}/{}", uuid, language)));
        }
        if node.languages.is_empty() && node.parent.is_some() {
            remove_subtree(nodes, uuid);
        }
        Ok(())
    }

    async fn delete_node(&self, scope: &Scope, uuid: &str) -> TargetResult<()> {
        let mut st = self.lock();
        st.record("delete_node", uuid, true);
        let nodes = st.nodes_mut(scope)?;
        if !nodes.contains_key(uuid) {
            return Err(not_found("node", uuid));
        }
        remove_subtree(nodes, uuid);
        Ok(())
    }

    async fn take_offline(&self, scope: &Scope, uuid: &str) -> TargetResult<()> {
        let mut st = self.lock();
        st.record("take_offline", uuid, true);
        let node = st
            .nodes_mut(scope)?
            .get_mut(uuid)
            .ok_or_else(|| not_found("node", uuid))?;
        node.languages.values_mut().for_each(|c| c.published = false);
        Ok(())
    }

    async fn upload_binary(&self, scope: &Scope, uuid: &str, upload: &BinaryUpload) -> TargetResult<()> {
        let mut st = self.lock();
        st.record("upload_binary", format!("{}/{}", uuid, upload.field), true);
        let content = st
            .nodes_mut(scope)?
            .get_mut(uuid)
            .and_then(|n| n.languages.get_mut(&upload.language))
            .ok_or_else(|| not_found("node", uuid))?;
        content.fields.insert(
            upload.field.clone(),
            json!({
                "fileName": upload.file_name,
                "mimeType": upload.mime_type,
                "fileSize": upload.data.len(),
            }),
        );
        Ok(())
    }

    async fn set_focal_point(
        &self,
        scope: &Scope,
        uuid: &str,
        language: &str,
        field: &str,
        point: (f32, f32),
    ) -> TargetResult<()> {
        let mut st = self.lock();
        st.record("set_focal_point", format!("{}/{}", uuid, field), true);
        let content = st
            .nodes_mut(scope)?
            .get_mut(uuid)
            .and_then(|n| n.languages.get_mut(language))
            .ok_or_else(|| not_found("node", uuid))?;
        let binary = content
            .fields
            .get_mut(field)
            .and_then(Value::as_object_mut)
            .ok_or_else(|| TargetError::BadRequest(format!("no binary in field {}", field)))?;
        binary.insert("focalPoint".into(), json!({ "x": point.0, "y": point.1 }));
        Ok(())
    }

    async fn plugin_request(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
    ) -> TargetResult<Value> {
        let mut st = self.lock();
        st.record("plugin_request", format!("{} {}", method, path), method != "GET");
        Ok(json!({ "method": method, "path": path, "body": body }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder_schema() -> SchemaModel {
        SchemaModel {
            name: "cms_folder".into(),
            display_field: Some("name".into()),
            segment_field: Some("slug".into()),
            container: true,
            fields: vec![FieldSchema::new("name", "string"), FieldSchema::new("slug", "string")],
            ..Default::default()
        }
    }

    async fn project(target: &MemoryTarget) -> (Scope, String) {
        target.create_schema(&folder_schema()).await.unwrap();
        let p = target
            .create_project(&ProjectCreateRequest {
                name: "site".into(),
                schema: NameRef {
                    name: "cms_folder".into(),
                },
                hostname: None,
                ssl: None,
                path_prefix: None,
                uuid: None,
            })
            .await
            .unwrap();
        (Scope::new("site", None), p.root_node.uuid)
    }

    fn upsert(parent: &str, slug: &str) -> NodeUpsertRequest {
        let mut fields = Map::new();
        fields.insert("name".into(), json!(slug));
        fields.insert("slug".into(), json!(slug));
        NodeUpsertRequest {
            language: "en".into(),
            parent_node: Some(UuidRef {
                uuid: parent.into(),
            }),
            schema: NameRef {
                name: "cms_folder".into(),
            },
            fields,
            publish: true,
            grant: None,
        }
    }

    #[test]
    fn diff_reports_label_only_changes_as_field_updates() {
        let old = folder_schema();
        let mut new = folder_schema();
        new.fields[0].label = Some("Name".into());
        new.fields.push(FieldSchema::new("teaser", "html"));
        let changes = diff_schema_models(&old, &new);
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].operation, ChangeOperation::UpdateField);
        assert_eq!(changes[1].operation, ChangeOperation::AddField);
        assert_eq!(changes[2].operation, ChangeOperation::UpdateSchema);
        assert!(changes[2].properties.contains_key("order"));
        assert!(diff_schema_models(&old, &old).is_empty());
    }

    #[tokio::test]
    async fn upsert_requires_existing_parent_and_detects_segment_clash() {
        let target = MemoryTarget::new();
        let (scope, root) = project(&target).await;

        let err = target
            .upsert_node(&scope, "child", &upsert("nope", "a"))
            .await
            .unwrap_err();
        assert_eq!(err, TargetError::MissingParent("nope".into()));

        target.upsert_node(&scope, "a", &upsert(&root, "x")).await.unwrap();
        match target.upsert_node(&scope, "b", &upsert(&root, "x")).await {
            Err(TargetError::Conflict(c)) => {
                assert_eq!(c.conflicting_uuid.as_deref(), Some("a"));
                assert_eq!(c.conflicting_language.as_deref(), Some("en"));
            }
            other => panic!("unexpected {:?}", other),
        }
        // updating the same node with its own segment is fine
        let node = target.upsert_node(&scope, "a", &upsert(&root, "x")).await.unwrap();
        assert_eq!(node.version, "2.0");
        assert!(node.published);
    }

    #[tokio::test]
    async fn deleting_last_language_removes_subtree() {
        let target = MemoryTarget::new();
        let (scope, root) = project(&target).await;
        target.upsert_node(&scope, "a", &upsert(&root, "a")).await.unwrap();
        target.upsert_node(&scope, "b", &upsert("a", "b")).await.unwrap();
        assert_eq!(target.node_count(&scope), 3);
        target.delete_language(&scope, "a", "en").await.unwrap();
        assert_eq!(target.node_count(&scope), 1);
    }

    #[tokio::test]
    async fn migrations_run_for_configured_polls() {
        let target = MemoryTarget::new();
        let (_, _) = project(&target).await;
        let branch = target.branch("site", "site").unwrap();
        let mut schema = folder_schema();
        schema.fields.push(FieldSchema::new("teaser", "html"));
        let uuid = target.schema("cms_folder").unwrap().uuid;
        let updated = target.update_schema(&uuid, &schema).await.unwrap();
        assert_eq!(updated.version, "2.0");

        target.stall_migrations(1);
        target
            .assign_branch_schemas(
                "site",
                &branch.uuid,
                &[SchemaReference {
                    name: "cms_folder".into(),
                    uuid,
                    version: updated.version,
                }],
            )
            .await
            .unwrap();
        let first = target.branch_migration_status("site", &branch.uuid).await.unwrap();
        assert_eq!(first.schemas[0].status, MigrationState::Running);
        let second = target.branch_migration_status("site", &branch.uuid).await.unwrap();
        assert_eq!(second.schemas[0].status, MigrationState::Completed);
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_once() {
        let target = MemoryTarget::new();
        let (scope, root) = project(&target).await;
        target.inject_upsert_error("a", TargetError::MissingParent(root.clone()));
        assert!(target.upsert_node(&scope, "a", &upsert(&root, "a")).await.is_err());
        assert!(target.upsert_node(&scope, "a", &upsert(&root, "a")).await.is_ok());
        let upserts = target
            .calls()
            .into_iter()
            .filter(|c| c.op == "upsert_node")
            .count();
        assert_eq!(upserts, 2);
    }
}
