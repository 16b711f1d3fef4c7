//! Per-run state of one target repository.
//!
//! A context is built at the start of a publish run, filled by the structural
//! reconciler (projects, branches, root items, schema versions) and dropped at
//! the end of the run.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use crate::config::{App, RepositoryConfig};
use crate::error::PublishError;
use crate::identity::{parse_wire, IdentityMapper};
use crate::model::{ObjectType, Site};
use crate::target::model::{ProjectResponse, SchemaReference, Scope};

pub const VERSION_TAG_FAMILY: &str = "implementationVersion";
pub const CHANNEL_TAG_FAMILY: &str = "channel";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchInfo {
    pub uuid: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectInfo {
    pub name: String,
    pub uuid: String,
    pub root_uuid: String,
    /// Site owning the project in project-per-site mode.
    pub owner_site: Option<i64>,
    pub default_branch: Option<BranchInfo>,
    /// Channel branches keyed by channel site id.
    pub channel_branches: BTreeMap<i64, BranchInfo>,
    /// Roles that already hold read permission on the project.
    pub granted_roles: BTreeSet<String>,
}

/// A project the repository configuration requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredProject {
    pub name: String,
    pub owner: Option<Site>,
    /// Channels whose content goes into branches of this project.
    pub channels: Vec<Site>,
}

#[derive(Debug, Default)]
struct Resolved {
    projects: BTreeMap<String, ProjectInfo>,
    alternative_projects: Vec<ProjectResponse>,
    schemas: BTreeMap<ObjectType, SchemaReference>,
    microschemas: Vec<SchemaReference>,
}

#[derive(Debug)]
pub struct RepositoryContext {
    pub config: RepositoryConfig,
    pub app: App,
    pub sites: Vec<Site>,
    resolved: RwLock<Resolved>,
}

impl RepositoryContext {
    pub fn new(config: RepositoryConfig, app: App, sites: Vec<Site>) -> Self {
        Self {
            config,
            app,
            sites,
            resolved: RwLock::new(Resolved::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn read(&self) -> RwLockReadGuard<'_, Resolved> {
        self.resolved.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Resolved> {
        self.resolved.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn site(&self, id: i64) -> Option<&Site> {
        self.sites.iter().find(|s| s.id == id)
    }

    /// The site whose project holds content of `site_id` (the master for channels).
    pub fn owning_site(&self, site_id: i64) -> Option<&Site> {
        let site = self.site(site_id)?;
        match site.master {
            Some(master) => self.owning_site(master),
            None => Some(site),
        }
    }

    pub fn project_name_for_site(&self, site_id: i64) -> Option<String> {
        if self.config.project_per_site {
            self.owning_site(site_id).map(|s| s.name.clone())
        } else {
            self.config.project_name.clone()
        }
    }

    pub fn required_projects(&self) -> Vec<RequiredProject> {
        let channels_of = |master: Option<i64>| -> Vec<Site> {
            self.sites
                .iter()
                .filter(|s| s.is_channel())
                .filter(|s| master.map_or(true, |m| self.owning_site(s.id).map(|o| o.id) == Some(m)))
                .cloned()
                .collect()
        };
        if self.config.project_per_site {
            self.sites
                .iter()
                .filter(|s| !s.is_channel())
                .map(|s| RequiredProject {
                    name: s.name.clone(),
                    owner: Some(s.clone()),
                    channels: channels_of(Some(s.id)),
                })
                .collect()
        } else {
            match &self.config.project_name {
                Some(name) => vec![RequiredProject {
                    name: name.clone(),
                    owner: None,
                    channels: channels_of(None),
                }],
                None => Vec::new(),
            }
        }
    }

    /// Names of projects that would hold the content under the other
    /// project-per-site setting.
    pub fn alternative_project_names(&self) -> Vec<String> {
        if self.config.project_per_site {
            self.config.project_name.iter().cloned().collect()
        } else {
            self.sites
                .iter()
                .filter(|s| !s.is_channel())
                .map(|s| s.name.clone())
                .collect()
        }
    }

    pub fn default_branch_name(&self, project: &str) -> String {
        match &self.config.implementation_version {
            Some(v) => format!("{}_{}", project, v),
            None => project.to_string(),
        }
    }

    pub fn channel_branch_name(&self, channel: &Site) -> String {
        match &self.config.implementation_version {
            Some(v) => format!("{}_{}", channel.name, v),
            None => channel.name.clone(),
        }
    }

    pub fn set_project(&self, info: ProjectInfo) {
        self.write().projects.insert(info.name.clone(), info);
    }

    pub fn project(&self, name: &str) -> Option<ProjectInfo> {
        self.read().projects.get(name).cloned()
    }

    pub fn projects(&self) -> Vec<ProjectInfo> {
        self.read().projects.values().cloned().collect()
    }

    pub fn update_project(&self, name: &str, f: impl FnOnce(&mut ProjectInfo)) {
        if let Some(p) = self.write().projects.get_mut(name) {
            f(p);
        }
    }

    pub fn set_alternative_projects(&self, projects: Vec<ProjectResponse>) {
        self.write().alternative_projects = projects;
    }

    pub fn alternative_projects(&self) -> Vec<ProjectResponse> {
        self.read().alternative_projects.clone()
    }

    pub fn set_schema(&self, kind: ObjectType, reference: SchemaReference) {
        self.write().schemas.insert(kind, reference);
    }

    pub fn schema_refs(&self) -> Vec<SchemaReference> {
        self.read().schemas.values().cloned().collect()
    }

    pub fn set_microschemas(&self, refs: Vec<SchemaReference>) {
        self.write().microschemas = refs;
    }

    pub fn microschema_refs(&self) -> Vec<SchemaReference> {
        self.read().microschemas.clone()
    }

    /// Project and branch that content of `site_id` is written to.
    pub fn scope_for_site(&self, site_id: i64) -> Result<Scope, PublishError> {
        let project_name = self.project_name_for_site(site_id).ok_or_else(|| {
            PublishError::Configuration(format!("site {} is not bound to {}", site_id, self.name()))
        })?;
        let project = self.project(&project_name).ok_or_else(|| {
            PublishError::Configuration(format!("project {} was not reconciled", project_name))
        })?;
        let site = self.site(site_id);
        let branch = match site {
            Some(s) if s.is_channel() => Some(
                project
                    .channel_branches
                    .get(&s.id)
                    .map(|b| b.name.clone())
                    .ok_or_else(|| {
                        PublishError::Configuration(format!(
                            "no channel branch for site {} in project {}",
                            s.id, project_name
                        ))
                    })?,
            ),
            _ => project.default_branch.as_ref().map(|b| b.name.clone()),
        };
        Ok(Scope::new(project.name, branch))
    }

    /// Uuid of the item content of `site_id` is placed below when it has no
    /// parent of its own.
    pub fn root_uuid_for_site(&self, site_id: i64) -> Option<String> {
        let name = self.project_name_for_site(site_id)?;
        self.project(&name).map(|p| p.root_uuid)
    }

    pub fn mapper(&self) -> IdentityMapper {
        let root_items: BTreeMap<i64, Uuid> = self
            .read()
            .projects
            .values()
            .filter_map(|p| Some((p.owner_site?, parse_wire(&p.root_uuid)?)))
            .collect();
        IdentityMapper::new(self.config.project_per_site, root_items)
    }
}
