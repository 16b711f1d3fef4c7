use serde_json::Value;
use std::collections::BTreeSet;
use tracing::debug;

use super::Reconciler;
use crate::error::PublishError;
use crate::mapping::{expected_microschema, expected_schema};
use crate::model::ObjectType;
use crate::target::model::{ChangeOperation, SchemaChange, SchemaReference};

fn same_members(proposed: &Value, existing: &[String]) -> bool {
    let Some(items) = proposed.as_array() else {
        return false;
    };
    let proposed: BTreeSet<&str> = items.iter().filter_map(Value::as_str).collect();
    let existing: BTreeSet<&str> = existing.iter().map(String::as_str).collect();
    proposed == existing
}

/// Whether a diff entry only touches cosmetic properties: labels,
/// descriptions, field order, or the order of an unchanged set of URL fields.
pub fn is_noise(change: &SchemaChange, existing_url_fields: &[String]) -> bool {
    match change.operation {
        ChangeOperation::UpdateField => change
            .properties
            .keys()
            .all(|k| k == "label" || k == "description"),
        ChangeOperation::UpdateSchema | ChangeOperation::UpdateMicroschema => {
            change.properties.iter().all(|(k, v)| match k.as_str() {
                "label" | "description" | "order" => true,
                "urlFields" => same_members(v, existing_url_fields),
                _ => false,
            })
        }
        _ => false,
    }
}

fn describe(changes: &[SchemaChange]) -> String {
    changes
        .iter()
        .map(|c| match &c.field {
            Some(f) => format!("{:?}({})", c.operation, f),
            None => format!("{:?}", c.operation),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

impl Reconciler<'_> {
    pub(super) async fn reconcile_schemas(&mut self) -> Result<(), PublishError> {
        for kind in ObjectType::ALL {
            let expected = match expected_schema(&self.ctx.config, kind) {
                Ok(s) => s,
                Err(err) => {
                    self.report.fail(format!("mapping of {}: {}", kind, err));
                    continue;
                }
            };
            let name = expected.name.clone();
            let Some(existing) = self.target.find_schema(&name).await? else {
                if self.mode.may_create() {
                    let created = self.target.create_schema(&expected).await?;
                    self.report.repaired(format!("created schema {}", name));
                    self.ctx.set_schema(
                        kind,
                        SchemaReference {
                            name,
                            uuid: created.uuid,
                            version: created.version,
                        },
                    );
                } else {
                    self.report.fail(format!("schema {} does not exist", name));
                }
                continue;
            };

            let residual: Vec<SchemaChange> = self
                .target
                .diff_schema(&existing.uuid, &expected)
                .await?
                .into_iter()
                .filter(|c| !is_noise(c, &existing.model.url_fields))
                .collect();
            let mut reference = SchemaReference {
                name: name.clone(),
                uuid: existing.uuid.clone(),
                version: existing.version.clone(),
            };
            if residual.is_empty() {
                debug!(schema = %name, version = %existing.version, "schema up to date");
            } else if self.mode.may_update() {
                let updated = self.target.update_schema(&existing.uuid, &expected).await?;
                self.report.repaired(format!(
                    "updated schema {} to {}: {}",
                    name,
                    updated.version,
                    describe(&residual)
                ));
                reference.version = updated.version;
            } else {
                self.report
                    .fail(format!("schema {} differs: {}", name, describe(&residual)));
            }
            self.ctx.set_schema(kind, reference);
        }
        Ok(())
    }

    /// Microschemas are matched by their description, which holds the
    /// deterministic uuid of the content block definition.
    pub(super) async fn reconcile_microschemas(&mut self) -> Result<(), PublishError> {
        if self.ctx.config.microschemas.is_empty() {
            return Ok(());
        }
        let existing_all = self.target.list_microschemas().await?;
        let mut refs = Vec::new();
        for def in &self.ctx.config.microschemas {
            let expected = match expected_microschema(&self.ctx.config, def) {
                Ok(m) => m,
                Err(err) => {
                    self.report
                        .fail(format!("content block {}: {}", def.keyword, err));
                    continue;
                }
            };
            let existing = existing_all
                .iter()
                .find(|m| m.model.description == expected.description);
            let Some(existing) = existing else {
                if existing_all.iter().any(|m| m.model.name == expected.name) {
                    self.report.fail(format!(
                        "microschema {} exists for another content block",
                        expected.name
                    ));
                } else if self.mode.may_create() {
                    let created = self.target.create_microschema(&expected).await?;
                    self.report
                        .repaired(format!("created microschema {}", expected.name));
                    refs.push(SchemaReference {
                        name: expected.name.clone(),
                        uuid: created.uuid,
                        version: created.version,
                    });
                } else {
                    self.report
                        .fail(format!("microschema {} does not exist", expected.name));
                }
                continue;
            };

            let residual: Vec<SchemaChange> = self
                .target
                .diff_microschema(&existing.uuid, &expected)
                .await?
                .into_iter()
                .filter(|c| !is_noise(c, &[]))
                .collect();
            let mut reference = SchemaReference {
                name: existing.model.name.clone(),
                uuid: existing.uuid.clone(),
                version: existing.version.clone(),
            };
            if residual.is_empty() {
                debug!(microschema = %reference.name, "microschema up to date");
            } else if self.mode.may_update() {
                let updated = self
                    .target
                    .update_microschema(&existing.uuid, &expected)
                    .await?;
                self.report.repaired(format!(
                    "updated microschema {} to {}: {}",
                    reference.name,
                    updated.version,
                    describe(&residual)
                ));
                reference.version = updated.version;
            } else {
                self.report.fail(format!(
                    "microschema {} differs: {}",
                    reference.name,
                    describe(&residual)
                ));
            }
            refs.push(reference);
        }
        self.ctx.set_microschemas(refs);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::{context, site};
    use crate::reconcile::tests::source;
    use crate::reconcile::{reconcile, ReconcileMode};
    use crate::target::{MemoryTarget, TargetService};
    use serde_json::{json, Map};

    fn change(op: ChangeOperation, props: Value) -> SchemaChange {
        let properties: Map<String, Value> = props.as_object().cloned().unwrap_or_default();
        SchemaChange {
            operation: op,
            field: None,
            properties,
        }
    }

    #[test]
    fn cosmetic_changes_are_noise() {
        let urls = vec!["url".to_string(), "alias".to_string()];
        assert!(is_noise(
            &change(ChangeOperation::UpdateField, json!({ "label": "Title" })),
            &urls
        ));
        assert!(is_noise(
            &change(
                ChangeOperation::UpdateSchema,
                json!({ "description": "x", "order": ["b", "a"], "urlFields": ["alias", "url"] })
            ),
            &urls
        ));
        assert!(!is_noise(
            &change(ChangeOperation::UpdateSchema, json!({ "urlFields": ["url"] })),
            &urls
        ));
        assert!(!is_noise(
            &change(ChangeOperation::UpdateField, json!({ "required": true })),
            &urls
        ));
        assert!(!is_noise(&change(ChangeOperation::AddField, json!({})), &urls));
    }

    #[tokio::test]
    async fn relabelled_schema_needs_no_update() {
        let ctx = context(vec![site(1, "a", None)]);
        let target = MemoryTarget::new().with_roles(&["editor", "anonymous"]);
        let mut schema = expected_schema(&ctx.config, ObjectType::Page).unwrap();
        schema.description = Some("pages".into());
        schema.fields.reverse();
        if let Some(f) = schema.fields.first_mut() {
            f.label = Some("Something else".into());
        }
        target.create_schema(&schema).await.unwrap();

        let report = reconcile(&ctx, &target, &source(), ReconcileMode::repair())
            .await
            .unwrap();
        assert!(report.success, "{:?}", report.diagnostics);
        assert!(!target.calls().iter().any(|c| c.op == "update_schema"));
        assert_eq!(target.schema("cms_content").unwrap().version, "1.0");
    }

    #[tokio::test]
    async fn structural_change_is_reported_or_repaired() {
        let ctx = context(vec![site(1, "a", None)]);
        let target = MemoryTarget::new().with_roles(&["editor", "anonymous"]);
        let mut schema = expected_schema(&ctx.config, ObjectType::Folder).unwrap();
        schema.fields.retain(|f| f.name != "roles");
        let created = target.create_schema(&schema).await.unwrap();

        let check = reconcile(&ctx, &target, &source(), ReconcileMode::check_only())
            .await
            .unwrap();
        assert!(!check.success);
        assert!(check
            .diagnostics
            .iter()
            .any(|d| d.contains("cms_folder differs") && d.contains("AddField(roles)")));

        let ctx = context(vec![site(1, "a", None)]);
        let repair = reconcile(&ctx, &target, &source(), ReconcileMode::repair())
            .await
            .unwrap();
        assert!(repair.success, "{:?}", repair.diagnostics);
        let folder = target.find_schema("cms_folder").await.unwrap().unwrap();
        assert_eq!(folder.uuid, created.uuid);
        assert_eq!(folder.version, "2.0");
    }
}
