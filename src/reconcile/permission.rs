use std::collections::BTreeSet;

use super::Reconciler;
use crate::error::PublishError;
use crate::mapping::effective_entries;
use crate::model::ObjectType;

fn normalized(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = values
        .iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

impl Reconciler<'_> {
    /// The permission property must be mapped, backed by a selectable value
    /// set, and every value must name an existing role. With write-back the
    /// value set is replaced by the role names of the target system.
    pub(super) async fn check_permission_property(&mut self) -> Result<(), PublishError> {
        let Some(property) = self.ctx.config.permission_property.clone() else {
            return Ok(());
        };
        let mapped = ObjectType::ALL.into_iter().any(|kind| {
            effective_entries(&self.ctx.config, kind)
                .iter()
                .any(|e| e.field == property)
        });
        if !mapped {
            self.report.fail(format!(
                "permission property {} is not mapped to any field",
                property
            ));
            return Ok(());
        }
        let Some(values) = self.source.permission_values(&property).await? else {
            self.report.fail(format!(
                "permission property {} has no selectable value set",
                property
            ));
            return Ok(());
        };

        let roles: BTreeSet<String> = self
            .target
            .list_roles()
            .await?
            .into_iter()
            .map(|r| r.name)
            .collect();
        let current = normalized(&values);

        if self.ctx.config.write_back_roles {
            let wanted: Vec<String> = roles.iter().cloned().collect();
            if wanted == values {
                return Ok(());
            }
            if self.mode.check_only {
                self.report.note(format!(
                    "value set of {} would be replaced by the target roles",
                    property
                ));
            } else {
                self.source
                    .store_permission_values(&property, &wanted)
                    .await?;
                self.report.repaired(format!(
                    "stored {} roles in the value set of {}",
                    wanted.len(),
                    property
                ));
            }
            return Ok(());
        }

        let unknown: Vec<&str> = current
            .iter()
            .filter(|v| !roles.contains(*v))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            self.report.fail(format!(
                "permission property {} references unknown roles: {}",
                property,
                unknown.join(", ")
            ));
        }
        Ok(())
    }
}
