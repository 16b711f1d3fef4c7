use std::collections::BTreeMap;
use tracing::debug;

use super::Reconciler;
use crate::context::{BranchInfo, RequiredProject, CHANNEL_TAG_FAMILY, VERSION_TAG_FAMILY};
use crate::error::PublishError;
use crate::model::Site;
use crate::target::model::{
    BranchCreateRequest, BranchResponse, BranchUpdateRequest, MigrationInfo, SchemaReference,
    TagReference,
};
use crate::target::retry_transient;

/// Attributes a branch must carry.
struct ExpectedBranch<'s> {
    name: String,
    site: Option<&'s Site>,
    tags: Vec<TagReference>,
    latest: bool,
}

fn attribute_update(branch: &BranchResponse, expected: &ExpectedBranch<'_>) -> BranchUpdateRequest {
    let mut update = BranchUpdateRequest::default();
    if branch.name != expected.name {
        update.name = Some(expected.name.clone());
    }
    if let Some(site) = expected.site {
        if branch.hostname.as_deref() != Some(site.hostname.as_str()) {
            update.hostname = Some(site.hostname.clone());
        }
        if branch.ssl != Some(site.ssl) {
            update.ssl = Some(site.ssl);
        }
        if branch.path_prefix.as_deref().unwrap_or("") != site.path_prefix {
            update.path_prefix = Some(site.path_prefix.clone());
        }
    }
    update
}

fn outdated(expected: Vec<SchemaReference>, assigned: &[MigrationInfo]) -> Vec<SchemaReference> {
    expected
        .into_iter()
        .filter(|r| {
            !assigned
                .iter()
                .any(|i| i.name == r.name && i.version == r.version)
        })
        .collect()
}

impl Reconciler<'_> {
    fn version_tag(&self) -> Option<TagReference> {
        self.ctx
            .config
            .implementation_version
            .as_deref()
            .map(|v| TagReference::new(VERSION_TAG_FAMILY, v))
    }

    /// Whether `branch` carries the implementation version this run publishes.
    fn matches_version(&self, branch: &BranchResponse) -> bool {
        match &self.ctx.config.implementation_version {
            Some(v) => branch.tag_value(VERSION_TAG_FAMILY) == Some(v.as_str()),
            None => !branch.has_tag(VERSION_TAG_FAMILY),
        }
    }

    pub(super) async fn reconcile_branches(&mut self, projects: &[RequiredProject]) -> Result<(), PublishError> {
        for required in projects {
            let app = &self.ctx.app;
            let target = self.target;
            let name = required.name.as_str();
            let branches = retry_transient(
                app.transient_retries,
                app.transient_retry_delay(),
                "branches",
                || target.list_branches(name),
            )
            .await?;

            let default = self.default_branch(required, &branches).await?;
            let mut channel_branches = BTreeMap::new();
            for channel in &required.channels {
                if let Some(b) = self.channel_branch(required, channel, &branches).await? {
                    channel_branches.insert(channel.id, b);
                }
            }
            for branch in default.iter().chain(channel_branches.values()) {
                self.assign_branch_versions(name, branch).await?;
            }
            self.ctx.update_project(name, |p| {
                p.default_branch = default;
                p.channel_branches = channel_branches;
            });
        }
        Ok(())
    }

    async fn default_branch(
        &mut self,
        required: &RequiredProject,
        branches: &[BranchResponse],
    ) -> Result<Option<BranchInfo>, PublishError> {
        let wanted = self.ctx.default_branch_name(&required.name);
        let found = branches
            .iter()
            .filter(|b| !b.has_tag(CHANNEL_TAG_FAMILY))
            .find(|b| {
                self.matches_version(b)
                    && (self.ctx.config.implementation_version.is_some() || b.name == required.name)
            })
            .or_else(|| {
                branches
                    .iter()
                    .find(|b| b.name == wanted && !b.has_tag(CHANNEL_TAG_FAMILY))
            })
            .cloned();
        let expected = ExpectedBranch {
            name: wanted.clone(),
            site: required.owner.as_ref(),
            tags: self.version_tag().into_iter().collect(),
            latest: true,
        };
        self.ensure_branch(&required.name, found, expected).await
    }

    async fn channel_branch(
        &mut self,
        required: &RequiredProject,
        channel: &Site,
        branches: &[BranchResponse],
    ) -> Result<Option<BranchInfo>, PublishError> {
        let wanted = self.ctx.channel_branch_name(channel);
        let found = branches
            .iter()
            .find(|b| {
                b.tag_value(CHANNEL_TAG_FAMILY) == Some(channel.global_id.as_str())
                    && self.matches_version(b)
            })
            .or_else(|| {
                branches
                    .iter()
                    .find(|b| b.name == wanted && !b.has_tag(CHANNEL_TAG_FAMILY))
            })
            .cloned();
        let mut tags = vec![TagReference::new(CHANNEL_TAG_FAMILY, &channel.global_id)];
        tags.extend(self.version_tag());
        let expected = ExpectedBranch {
            name: wanted,
            site: Some(channel),
            tags,
            latest: false,
        };
        self.ensure_branch(&required.name, found, expected).await
    }

    /// Creates the branch when missing and brings name, host settings, tags
    /// and the latest flag in line. A branch created in this pass is always
    /// completed; an existing one only under repair.
    async fn ensure_branch(
        &mut self,
        project: &str,
        found: Option<BranchResponse>,
        expected: ExpectedBranch<'_>,
    ) -> Result<Option<BranchInfo>, PublishError> {
        let (branch, fresh) = match found {
            Some(b) => (b, false),
            None if self.mode.may_create() => {
                let site = expected.site;
                let req = BranchCreateRequest {
                    name: expected.name.clone(),
                    hostname: site.map(|s| s.hostname.clone()),
                    ssl: site.map(|s| s.ssl),
                    path_prefix: site
                        .map(|s| s.path_prefix.clone())
                        .filter(|p| !p.is_empty()),
                    latest: expected.latest,
                };
                let created = self.target.create_branch(project, &req).await?;
                self.report
                    .repaired(format!("created branch {} in project {}", created.name, project));
                (created, true)
            }
            None => {
                self.report.fail(format!(
                    "project {} has no branch {}",
                    project, expected.name
                ));
                return Ok(None);
            }
        };

        let update = attribute_update(&branch, &expected);
        let missing: Vec<&TagReference> = expected
            .tags
            .iter()
            .filter(|t| !branch.tags.contains(t))
            .collect();
        let stale: Vec<&TagReference> = branch
            .tags
            .iter()
            .filter(|t| {
                expected
                    .tags
                    .iter()
                    .any(|e| e.tag_family == t.tag_family && e.name != t.name)
            })
            .collect();
        let needs_latest = expected.latest && !branch.latest;

        let info = BranchInfo {
            uuid: branch.uuid.clone(),
            name: update.name.clone().unwrap_or_else(|| branch.name.clone()),
        };
        if update.is_empty() && missing.is_empty() && stale.is_empty() && !needs_latest {
            debug!(project, branch = %branch.name, "branch up to date");
            return Ok(Some(info));
        }

        let allowed = if fresh {
            self.mode.may_create()
        } else {
            self.mode.may_update()
        };
        if !allowed {
            let mut problems = Vec::new();
            if !update.is_empty() {
                problems.push(format!("{:?}", update));
            }
            for t in &missing {
                problems.push(format!("missing tag {}={}", t.tag_family, t.name));
            }
            for t in &stale {
                problems.push(format!("stale tag {}={}", t.tag_family, t.name));
            }
            if needs_latest {
                problems.push("not latest".to_string());
            }
            self.report.fail(format!(
                "branch {} of project {} differs: {}",
                branch.name,
                project,
                problems.join(", ")
            ));
            return Ok(Some(BranchInfo {
                uuid: branch.uuid,
                name: branch.name,
            }));
        }

        if !update.is_empty() {
            self.target
                .update_branch(project, &branch.uuid, &update)
                .await?;
        }
        if needs_latest {
            self.target.set_branch_latest(project, &branch.uuid).await?;
        }
        for tag in stale {
            self.target
                .remove_branch_tag(project, &branch.uuid, tag)
                .await?;
        }
        for tag in missing {
            self.target.add_branch_tag(project, &branch.uuid, tag).await?;
        }
        if !fresh {
            self.report
                .repaired(format!("updated branch {} of project {}", info.name, project));
        }
        Ok(Some(info))
    }

    /// Assigns the reconciled schema versions to the branch. The target
    /// starts node migrations for every changed version.
    async fn assign_branch_versions(&mut self, project: &str, branch: &BranchInfo) -> Result<(), PublishError> {
        let status = self
            .target
            .branch_migration_status(project, &branch.uuid)
            .await?;
        let schemas = outdated(self.ctx.schema_refs(), &status.schemas);
        let microschemas = outdated(self.ctx.microschema_refs(), &status.microschemas);
        if schemas.is_empty() && microschemas.is_empty() {
            return Ok(());
        }
        let names: Vec<String> = schemas
            .iter()
            .chain(microschemas.iter())
            .map(|r| format!("{} {}", r.name, r.version))
            .collect();
        if !self.mode.may_create() {
            self.report.fail(format!(
                "branch {} of project {} lacks {}",
                branch.name,
                project,
                names.join(", ")
            ));
            return Ok(());
        }
        if !schemas.is_empty() {
            self.target
                .assign_branch_schemas(project, &branch.uuid, &schemas)
                .await?;
        }
        if !microschemas.is_empty() {
            self.target
                .assign_branch_microschemas(project, &branch.uuid, &microschemas)
                .await?;
        }
        self.report.repaired(format!(
            "assigned {} to branch {} of project {}",
            names.join(", "),
            branch.name,
            project
        ));
        Ok(())
    }
}
