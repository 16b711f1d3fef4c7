use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use super::Reconciler;
use crate::config::AlternativeProjects;
use crate::context::{ProjectInfo, RequiredProject};
use crate::error::PublishError;
use crate::identity::{uuid_from_global_id, wire};
use crate::model::ObjectType;
use crate::target::model::{NameRef, ProjectCreateRequest, ProjectResponse};
use crate::target::retry_transient;

impl Reconciler<'_> {
    /// Ensures every required project exists and has the reconciled schemas
    /// assigned. Returns the projects that exist afterwards.
    pub(super) async fn reconcile_projects(&mut self) -> Result<Vec<RequiredProject>, PublishError> {
        let existing = self.target.list_projects().await?;
        let mut resolved = Vec::new();
        for required in self.ctx.required_projects() {
            let project = match existing.iter().find(|p| p.name == required.name) {
                Some(p) => p.clone(),
                None if self.mode.may_create() => self.create_project(&required).await?,
                None => {
                    self.report
                        .fail(format!("project {} does not exist", required.name));
                    continue;
                }
            };
            self.assign_project_schemas(&project.name).await?;

            let app = &self.ctx.app;
            let target = self.target;
            let name = project.name.clone();
            let granted = retry_transient(
                app.transient_retries,
                app.transient_retry_delay(),
                "project roles",
                || target.project_read_roles(&name),
            )
            .await?;
            self.ctx.set_project(ProjectInfo {
                name: project.name.clone(),
                uuid: project.uuid.clone(),
                root_uuid: project.root_node.uuid.clone(),
                owner_site: required.owner.as_ref().map(|s| s.id),
                default_branch: None,
                channel_branches: BTreeMap::new(),
                granted_roles: granted.into_iter().collect::<BTreeSet<_>>(),
            });
            resolved.push(required);
        }
        Ok(resolved)
    }

    /// In project-per-site mode the project is created at the uuid derived
    /// from the owning site's global id.
    async fn create_project(&mut self, required: &RequiredProject) -> Result<ProjectResponse, PublishError> {
        let owner = required.owner.as_ref();
        let uuid = match owner {
            Some(site) => Some(wire(&uuid_from_global_id(&site.global_id)?)),
            None => None,
        };
        let req = ProjectCreateRequest {
            name: required.name.clone(),
            schema: NameRef {
                name: self.ctx.config.schema_name(ObjectType::Folder),
            },
            hostname: owner.map(|s| s.hostname.clone()),
            ssl: owner.map(|s| s.ssl),
            path_prefix: owner
                .map(|s| s.path_prefix.clone())
                .filter(|p| !p.is_empty()),
            uuid,
        };
        let created = self.target.create_project(&req).await?;
        self.report.repaired(format!("created project {}", created.name));
        Ok(created)
    }

    async fn assign_project_schemas(&mut self, project: &str) -> Result<(), PublishError> {
        let app = &self.ctx.app;
        let target = self.target;
        let assigned = retry_transient(
            app.transient_retries,
            app.transient_retry_delay(),
            "project schemas",
            || target.project_schemas(project),
        )
        .await?;
        for schema in self.ctx.schema_refs() {
            if assigned.iter().any(|a| a.uuid == schema.uuid) {
                continue;
            }
            if self.mode.may_create() {
                self.target.assign_schema(project, &schema.uuid).await?;
                self.report
                    .repaired(format!("assigned schema {} to project {}", schema.name, project));
            } else {
                self.report.fail(format!(
                    "schema {} is not assigned to project {}",
                    schema.name, project
                ));
            }
        }

        let microschemas = self.ctx.microschema_refs();
        if microschemas.is_empty() {
            return Ok(());
        }
        let assigned = target.project_microschemas(project).await?;
        for microschema in microschemas {
            if assigned.iter().any(|a| a.uuid == microschema.uuid) {
                continue;
            }
            if self.mode.may_create() {
                self.target
                    .assign_microschema(project, &microschema.uuid)
                    .await?;
                self.report.repaired(format!(
                    "assigned microschema {} to project {}",
                    microschema.name, project
                ));
            } else {
                self.report.fail(format!(
                    "microschema {} is not assigned to project {}",
                    microschema.name, project
                ));
            }
        }
        Ok(())
    }

    /// Projects that would hold the content under the other project-per-site
    /// setting are ignored, deleted, or remembered for scrubbing.
    pub(super) async fn reconcile_alternative_projects(&mut self) -> Result<(), PublishError> {
        let names = self.ctx.alternative_project_names();
        if names.is_empty() {
            return Ok(());
        }
        let required: BTreeSet<String> = self
            .ctx
            .required_projects()
            .into_iter()
            .map(|p| p.name)
            .collect();
        let found: Vec<ProjectResponse> = self
            .target
            .list_projects()
            .await?
            .into_iter()
            .filter(|p| names.contains(&p.name) && !required.contains(&p.name))
            .collect();
        if found.is_empty() {
            return Ok(());
        }
        match self.ctx.config.alternative_projects {
            AlternativeProjects::Ignore => {
                for p in &found {
                    debug!(project = %p.name, "ignoring alternative project");
                    self.report.note(format!("ignoring alternative project {}", p.name));
                }
            }
            AlternativeProjects::Delete => {
                for p in &found {
                    if self.mode.check_only {
                        self.report
                            .note(format!("alternative project {} would be deleted", p.name));
                        continue;
                    }
                    self.target.delete_project(&p.uuid).await?;
                    self.report
                        .repaired(format!("deleted alternative project {}", p.name));
                }
            }
            AlternativeProjects::Scrub => {
                for p in &found {
                    self.report
                        .note(format!("alternative project {} will be scrubbed", p.name));
                }
                self.ctx.set_alternative_projects(found);
            }
        }
        Ok(())
    }
}
