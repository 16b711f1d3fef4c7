//! Attribute mapping: structural (schema fields) and value level (field data).
//!
//! Every mapping entry yields exactly one target field, except for these
//! kinds which expand to several fields sharing the entry's name as prefix:
//!
//! | kind                      | target fields                                   |
//! |---------------------------|-------------------------------------------------|
//! | `link`                    | `<n>_internal` (node), `<n>_external` (string)  |
//! | `page_tag`                | `<n>_page` (node), `<n>_tag` (string)           |
//! | `template_tag`            | `<n>_template` (number), `<n>_tag` (string)     |
//! | multivalue + ordered flag | `<n>` (list), `<n>_ordered` (boolean)           |
//! | `overview`                | nine fields, see [`OVERVIEW_SUFFIXES`]          |
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::RepositoryConfig;
use crate::identity::{uuid_from_global_id, wire, IdentityError};
use crate::model::{Identity, LinkValue, ObjectType, OverviewValue, RenderedFields, RenderedValue};
use crate::target::model::{FieldSchema, MicroschemaModel, SchemaModel};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Html,
    Number,
    Date,
    Boolean,
    Node,
    Binary,
    Micronode,
    Link,
    PageTag,
    TemplateTag,
    Overview,
}

/// One attribute mapping entry of a repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MappingEntry {
    pub object_type: ObjectType,
    /// Target field name (prefix for expanding kinds).
    pub field: String,
    /// Source attribute expression handed to the field renderer.
    #[serde(default)]
    pub source: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub multivalue: bool,
    #[serde(default)]
    pub ordered_flag: bool,
    #[serde(default)]
    pub label: Option<String>,
    /// Search index hints passed through to the schema.
    #[serde(default)]
    pub index: Option<Value>,
    #[serde(default)]
    pub url_field: bool,
    #[serde(default)]
    pub display_field: bool,
    #[serde(default)]
    pub segment_field: bool,
    /// Restricts node references to the schema of this kind.
    #[serde(default)]
    pub target_type: Option<ObjectType>,
    /// Restricts micronodes to these content block keywords.
    #[serde(default)]
    pub micronode_filter: Vec<String>,
}

/// Part of a reusable content block definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartDef {
    pub keyword: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub multivalue: bool,
}

/// Reusable content block definition, synchronized as a microschema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MicroschemaDef {
    pub keyword: String,
    pub global_id: String,
    #[serde(default)]
    pub parts: Vec<PartDef>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("{0} has no display field")]
    NoDisplayField(ObjectType),
    #[error("{0} has more than one display field")]
    MultipleDisplayFields(ObjectType),
    #[error("display field '{1}' of {0} is not a string field")]
    DisplayFieldNotString(ObjectType, String),
    #[error("{0} has no URL mechanism (neither URL fields nor a segment field)")]
    NoUrlMechanism(ObjectType),
    #[error("{0} defines both URL fields and a segment field")]
    AmbiguousUrlMechanism(ObjectType),
    #[error("{0} has more than one segment field")]
    MultipleSegmentFields(ObjectType),
    #[error("content block '{0}' cannot nest '{1}'")]
    UnsupportedPart(String, String),
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

pub const OVERVIEW_SUFFIXES: [&str; 9] = [
    "listType",
    "selectType",
    "orderDirection",
    "orderBy",
    "items",
    "nodeIds",
    "source",
    "recursive",
    "maxItems",
];

fn overview_field(name: &str, suffix: &str) -> String {
    format!("{}_{}", name, suffix)
}

/// Entries of `kind` with later duplicates removed. An exact duplicate is
/// dropped silently; a conflicting one is logged and ignored.
pub fn effective_entries<'a>(
    repo: &'a RepositoryConfig,
    kind: ObjectType,
) -> Vec<&'a MappingEntry> {
    let mut seen: BTreeMap<String, Vec<FieldSchema>> = BTreeMap::new();
    let mut out = Vec::new();
    for entry in repo.mappings.iter().filter(|m| m.object_type == kind) {
        let fields = schema_fields(repo, entry);
        match seen.get(&entry.field) {
            Some(existing)
                if existing.len() == fields.len()
                    && existing
                        .iter()
                        .zip(fields.iter())
                        .all(|(a, b)| a.structurally_equal(b)) =>
            {
                debug!(kind = %kind, field = %entry.field, "ignoring exact duplicate mapping entry");
            }
            Some(_) => {
                warn!(kind = %kind, field = %entry.field, "ignoring conflicting duplicate mapping entry");
            }
            None => {
                seen.insert(entry.field.clone(), fields);
                out.push(entry);
            }
        }
    }
    out
}

fn base_field(kind: FieldKind, name: &str, repo: &RepositoryConfig, entry: Option<&MappingEntry>) -> FieldSchema {
    let scalar = match kind {
        FieldKind::Text => "string",
        FieldKind::Html => "html",
        FieldKind::Number => "number",
        FieldKind::Date => "date",
        FieldKind::Boolean => "boolean",
        FieldKind::Node => "node",
        FieldKind::Binary => "binary",
        FieldKind::Micronode => "micronode",
        // expanding kinds never reach this point
        FieldKind::Link | FieldKind::PageTag | FieldKind::TemplateTag | FieldKind::Overview => {
            "string"
        }
    };
    let multivalue = entry.is_some_and(|e| e.multivalue) && kind != FieldKind::Binary;
    let mut field = if multivalue {
        FieldSchema::list(name, scalar)
    } else {
        FieldSchema::new(name, scalar)
    };
    if let Some(entry) = entry {
        match kind {
            FieldKind::Node => {
                if let Some(t) = entry.target_type {
                    field.allow = Some(vec![repo.schema_name(t)]);
                }
            }
            FieldKind::Micronode => {
                let allowed: Vec<String> = if entry.micronode_filter.is_empty() {
                    repo.microschemas
                        .iter()
                        .map(|m| repo.microschema_name(&m.keyword))
                        .collect()
                } else {
                    entry
                        .micronode_filter
                        .iter()
                        .map(|k| repo.microschema_name(k))
                        .collect()
                };
                field.allow = Some(allowed);
            }
            _ => {}
        }
    }
    field
}

/// Target fields produced by one mapping entry.
pub fn schema_fields(repo: &RepositoryConfig, entry: &MappingEntry) -> Vec<FieldSchema> {
    let name = entry.field.as_str();
    let mut fields = match entry.kind {
        FieldKind::Link => vec![
            FieldSchema::new(format!("{}_internal", name), "node"),
            FieldSchema::new(format!("{}_external", name), "string"),
        ],
        FieldKind::PageTag => vec![
            FieldSchema::new(format!("{}_page", name), "node"),
            FieldSchema::new(format!("{}_tag", name), "string"),
        ],
        FieldKind::TemplateTag => vec![
            FieldSchema::new(format!("{}_template", name), "number"),
            FieldSchema::new(format!("{}_tag", name), "string"),
        ],
        FieldKind::Overview => vec![
            FieldSchema::new(overview_field(name, "listType"), "string"),
            FieldSchema::new(overview_field(name, "selectType"), "string"),
            FieldSchema::new(overview_field(name, "orderDirection"), "string"),
            FieldSchema::new(overview_field(name, "orderBy"), "string"),
            FieldSchema::list(overview_field(name, "items"), "node"),
            FieldSchema::list(overview_field(name, "nodeIds"), "number"),
            FieldSchema::new(overview_field(name, "source"), "string"),
            FieldSchema::new(overview_field(name, "recursive"), "boolean"),
            FieldSchema::new(overview_field(name, "maxItems"), "number"),
        ],
        kind => {
            let mut fields = vec![base_field(kind, name, repo, Some(entry))];
            if entry.multivalue && entry.ordered_flag {
                fields.push(FieldSchema::new(format!("{}_ordered", name), "boolean"));
            }
            fields
        }
    };
    if let Some(first) = fields.first_mut() {
        first.label = entry.label.clone();
        first.elasticsearch = entry.index.clone();
    }
    fields
}

/// Compute the schema a content kind must have in the target system.
pub fn expected_schema(
    repo: &RepositoryConfig,
    kind: ObjectType,
) -> Result<SchemaModel, MappingError> {
    let entries = effective_entries(repo, kind);

    let mut fields: Vec<FieldSchema> = Vec::new();
    for entry in &entries {
        for field in schema_fields(repo, entry) {
            match fields.iter().find(|f| f.name == field.name) {
                Some(existing) if existing.structurally_equal(&field) => {}
                Some(_) => {
                    warn!(kind = %kind, field = %field.name, "ignoring conflicting expanded field");
                }
                None => fields.push(field),
            }
        }
    }

    let display: Vec<&&MappingEntry> = entries.iter().filter(|e| e.display_field).collect();
    let display_field = match display.as_slice() {
        [] => return Err(MappingError::NoDisplayField(kind)),
        [one] => one.field.clone(),
        _ => return Err(MappingError::MultipleDisplayFields(kind)),
    };
    let display_ok = fields
        .iter()
        .any(|f| f.name == display_field && f.field_type == "string");
    if !display_ok {
        return Err(MappingError::DisplayFieldNotString(kind, display_field));
    }

    let url_fields: Vec<String> = entries
        .iter()
        .filter(|e| e.url_field)
        .map(|e| e.field.clone())
        .collect();
    let segments: Vec<&&MappingEntry> = entries.iter().filter(|e| e.segment_field).collect();
    if segments.len() > 1 {
        return Err(MappingError::MultipleSegmentFields(kind));
    }
    let segment_field = segments.first().map(|e| e.field.clone());
    match (url_fields.is_empty(), segment_field.is_none()) {
        (true, true) => return Err(MappingError::NoUrlMechanism(kind)),
        (false, false) => return Err(MappingError::AmbiguousUrlMechanism(kind)),
        _ => {}
    }

    Ok(SchemaModel {
        name: repo.schema_name(kind),
        description: None,
        display_field: Some(display_field),
        segment_field,
        url_fields,
        container: kind.is_container(),
        fields,
    })
}

/// Compute the microschema for a reusable content block definition.
pub fn expected_microschema(
    repo: &RepositoryConfig,
    def: &MicroschemaDef,
) -> Result<MicroschemaModel, MappingError> {
    let mut fields = Vec::with_capacity(def.parts.len());
    for part in &def.parts {
        match part.kind {
            FieldKind::Text
            | FieldKind::Html
            | FieldKind::Number
            | FieldKind::Date
            | FieldKind::Boolean
            | FieldKind::Node
            | FieldKind::Binary => {
                let mut field = base_field(part.kind, &part.keyword, repo, None);
                if part.multivalue {
                    field = FieldSchema::list(part.keyword.clone(), field.field_type);
                }
                fields.push(field);
            }
            _ => {
                return Err(MappingError::UnsupportedPart(
                    def.keyword.clone(),
                    part.keyword.clone(),
                ))
            }
        }
    }
    Ok(MicroschemaModel {
        name: repo.microschema_name(&def.keyword),
        description: Some(wire(&uuid_from_global_id(&def.global_id)?)),
        fields,
    })
}

/// State of a referenced item at render time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// Exists (or is assumed to exist) in the target system.
    Present(String),
    /// Will be written later in this run.
    Pending(String),
    /// Known not to exist.
    Absent,
}

/// Resolves referenced identities to target uuids during rendering.
pub trait ReferenceResolver {
    fn resolve(&self, identity: &Identity) -> Reference;
}

fn collect_references<'v>(value: &'v RenderedValue, out: &mut Vec<&'v Identity>) {
    match value {
        RenderedValue::Node(identity) | RenderedValue::Link(LinkValue::Internal(identity)) => {
            out.push(identity)
        }
        RenderedValue::PageTag {
            page: Some(identity),
            ..
        } => out.push(identity),
        RenderedValue::List(items) | RenderedValue::OrderedList { items, .. } => {
            for item in items {
                collect_references(item, out);
            }
        }
        RenderedValue::Micronode(micronode) => {
            for v in micronode.fields.values() {
                collect_references(v, out);
            }
        }
        RenderedValue::Overview(overview) => out.extend(overview.items.iter()),
        _ => {}
    }
}

/// Every item referenced by the rendered values.
pub fn referenced_identities(rendered: &RenderedFields) -> Vec<&Identity> {
    let mut out = Vec::new();
    for value in rendered.values() {
        collect_references(value, &mut out);
    }
    out
}

/// Field data of one write, split into what can be written now and what
/// must wait until referenced items exist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldValues {
    pub fields: Map<String, Value>,
    pub postponed: Map<String, Value>,
    /// Identities whose pending existence caused postponement.
    pub dependencies: Vec<Identity>,
}

struct Converter<'a> {
    resolver: &'a dyn ReferenceResolver,
    repo: &'a RepositoryConfig,
    pending: bool,
    dependencies: Vec<Identity>,
}

impl<'a> Converter<'a> {
    fn node(&mut self, identity: &Identity) -> Value {
        match self.resolver.resolve(identity) {
            Reference::Present(uuid) => json!({ "uuid": uuid }),
            Reference::Pending(uuid) => {
                self.pending = true;
                self.dependencies.push(identity.clone());
                json!({ "uuid": uuid })
            }
            Reference::Absent => Value::Null,
        }
    }

    fn scalar(&mut self, value: &RenderedValue) -> Value {
        match value {
            RenderedValue::Null => Value::Null,
            RenderedValue::Text(s) => Value::String(s.clone()),
            RenderedValue::Number(n) => json!(n),
            RenderedValue::Boolean(b) => Value::Bool(*b),
            RenderedValue::Date(d) => Value::String(d.to_rfc3339_opts(SecondsFormat::Secs, true)),
            RenderedValue::Node(identity) => self.node(identity),
            RenderedValue::List(items) | RenderedValue::OrderedList { items, .. } => {
                let values: Vec<Value> = items
                    .iter()
                    .map(|i| self.scalar(i))
                    .filter(|v| !v.is_null())
                    .collect();
                Value::Array(values)
            }
            RenderedValue::Micronode(micronode) => {
                let mut fields = Map::new();
                for (k, v) in &micronode.fields {
                    let converted = self.scalar(v);
                    fields.insert(k.clone(), converted);
                }
                json!({
                    "microschema": { "name": self.repo.microschema_name(&micronode.construct) },
                    "fields": Value::Object(fields),
                })
            }
            RenderedValue::Link(_)
            | RenderedValue::PageTag { .. }
            | RenderedValue::TemplateTag { .. }
            | RenderedValue::Overview(_) => {
                warn!("composite value used for a plain field; writing null");
                Value::Null
            }
        }
    }

    fn overview(&mut self, name: &str, overview: &OverviewValue, out: &mut Vec<(String, Value)>) {
        let opt = |s: &Option<String>| s.clone().map(Value::String).unwrap_or(Value::Null);
        let mut items = Vec::new();
        let mut node_ids = Vec::new();
        for (idx, identity) in overview.items.iter().enumerate() {
            let v = self.node(identity);
            if v.is_null() {
                continue;
            }
            items.push(v);
            node_ids.push(
                overview
                    .item_sites
                    .get(idx)
                    .map(|id| json!(id))
                    .unwrap_or(Value::Null),
            );
        }
        out.push((overview_field(name, "listType"), opt(&overview.list_type)));
        out.push((overview_field(name, "selectType"), opt(&overview.select_type)));
        out.push((overview_field(name, "orderDirection"), opt(&overview.order_direction)));
        out.push((overview_field(name, "orderBy"), opt(&overview.order_by)));
        out.push((overview_field(name, "items"), Value::Array(items)));
        out.push((overview_field(name, "nodeIds"), Value::Array(node_ids)));
        out.push((overview_field(name, "source"), opt(&overview.source)));
        out.push((overview_field(name, "recursive"), Value::Bool(overview.recursive)));
        out.push((
            overview_field(name, "maxItems"),
            overview.max_items.map(|n| json!(n)).unwrap_or(Value::Null),
        ));
    }

    fn entry(&mut self, entry: &MappingEntry, value: &RenderedValue) -> Vec<(String, Value)> {
        let name = entry.field.as_str();
        let mut out = Vec::new();
        match entry.kind {
            FieldKind::Link => {
                let (internal, external) = match value {
                    RenderedValue::Link(LinkValue::Internal(identity)) => {
                        (self.node(identity), Value::Null)
                    }
                    RenderedValue::Link(LinkValue::External(url)) => {
                        (Value::Null, Value::String(url.clone()))
                    }
                    _ => (Value::Null, Value::Null),
                };
                out.push((format!("{}_internal", name), internal));
                out.push((format!("{}_external", name), external));
            }
            FieldKind::PageTag => {
                let (page, tag) = match value {
                    RenderedValue::PageTag { page, tag } => (
                        page.as_ref().map(|p| self.node(p)).unwrap_or(Value::Null),
                        tag.clone().map(Value::String).unwrap_or(Value::Null),
                    ),
                    _ => (Value::Null, Value::Null),
                };
                out.push((format!("{}_page", name), page));
                out.push((format!("{}_tag", name), tag));
            }
            FieldKind::TemplateTag => {
                let (template, tag) = match value {
                    RenderedValue::TemplateTag { template, tag } => (
                        template.map(|t| json!(t)).unwrap_or(Value::Null),
                        tag.clone().map(Value::String).unwrap_or(Value::Null),
                    ),
                    _ => (Value::Null, Value::Null),
                };
                out.push((format!("{}_template", name), template));
                out.push((format!("{}_tag", name), tag));
            }
            FieldKind::Overview => match value {
                RenderedValue::Overview(overview) => self.overview(name, overview, &mut out),
                _ => {
                    for suffix in OVERVIEW_SUFFIXES {
                        out.push((overview_field(name, suffix), Value::Null));
                    }
                }
            },
            _ => {
                let converted = self.scalar(value);
                let converted = if entry.multivalue && !converted.is_array() && !converted.is_null() {
                    Value::Array(vec![converted])
                } else {
                    converted
                };
                out.push((name.to_string(), converted));
                if entry.multivalue && entry.ordered_flag {
                    let ordered = matches!(value, RenderedValue::OrderedList { ordered: true, .. });
                    out.push((format!("{}_ordered", name), Value::Bool(ordered)));
                }
            }
        }
        out
    }
}

/// Convert rendered values of `kind` into target field data.
///
/// Missing values are written as explicit nulls. Binary fields are skipped;
/// they are transferred by a post-save upload. When `only` is set, entries
/// not listed there are left out entirely.
pub fn field_values(
    repo: &RepositoryConfig,
    kind: ObjectType,
    rendered: &RenderedFields,
    only: Option<&[String]>,
    resolver: &dyn ReferenceResolver,
) -> FieldValues {
    let mut values = FieldValues::default();
    for entry in effective_entries(repo, kind) {
        if entry.kind == FieldKind::Binary {
            continue;
        }
        if only.is_some_and(|names| !names.iter().any(|n| n == &entry.field)) {
            continue;
        }
        let value = rendered.get(&entry.field).unwrap_or(&RenderedValue::Null);
        let mut conv = Converter {
            resolver,
            repo,
            pending: false,
            dependencies: Vec::new(),
        };
        let converted = conv.entry(entry, value);
        if conv.pending {
            debug!(field = %entry.field, "postponing field with pending references");
            values.dependencies.extend(conv.dependencies);
            values.postponed.extend(converted);
        } else {
            values.fields.extend(converted);
        }
    }
    values
}

/// Role names from the permission property's rendered value.
pub fn roles_from(rendered: &RenderedFields, property: &str) -> Option<Vec<String>> {
    let mut roles: Vec<String> = match rendered.get(property)? {
        RenderedValue::Text(s) => s
            .split(',')
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect(),
        RenderedValue::List(items) | RenderedValue::OrderedList { items, .. } => items
            .iter()
            .filter_map(|i| match i {
                RenderedValue::Text(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                _ => None,
            })
            .collect(),
        RenderedValue::Null => Vec::new(),
        _ => return None,
    };
    roles.sort();
    roles.dedup();
    Some(roles)
}

/// The binary field of a content kind, if mapped.
pub fn binary_field(repo: &RepositoryConfig, kind: ObjectType) -> Option<String> {
    effective_entries(repo, kind)
        .into_iter()
        .find(|e| e.kind == FieldKind::Binary)
        .map(|e| e.field.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{self, Config};
    use crate::model::{MicronodeValue, ObjectKey};

    fn repo() -> RepositoryConfig {
        let cfg: Config = serde_yaml::from_str(config::example()).unwrap();
        cfg.repositories[0].clone()
    }

    fn entry(kind: FieldKind, field: &str) -> MappingEntry {
        MappingEntry {
            object_type: ObjectType::Page,
            field: field.into(),
            source: String::new(),
            kind,
            multivalue: false,
            ordered_flag: false,
            label: None,
            index: None,
            url_field: false,
            display_field: false,
            segment_field: false,
            target_type: None,
            micronode_filter: Vec::new(),
        }
    }

    fn ident(id: i64) -> Identity {
        Identity {
            key: ObjectKey::new(ObjectType::Page, id),
            global_id: format!("A547.{}", id),
            content_set: Some(format!("A547.{}", id)),
            root_of_site: None,
        }
    }

    struct Fixed(BTreeMap<i64, Reference>);

    impl ReferenceResolver for Fixed {
        fn resolve(&self, identity: &Identity) -> Reference {
            self.0
                .get(&identity.key.id)
                .cloned()
                .unwrap_or(Reference::Present(format!("uuid-{}", identity.key.id)))
        }
    }

    #[test]
    fn link_expands_to_internal_and_external() {
        let names: Vec<String> = schema_fields(&repo(), &entry(FieldKind::Link, "link"))
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["link_internal", "link_external"]);
    }

    #[test]
    fn overview_expands_to_nine_fields() {
        let fields = schema_fields(&repo(), &entry(FieldKind::Overview, "ov"));
        assert_eq!(fields.len(), 9);
        assert_eq!(fields[4].name, "ov_items");
        assert_eq!(fields[4].list_type.as_deref(), Some("node"));
        assert_eq!(fields[5].name, "ov_nodeIds");
    }

    #[test]
    fn ordered_list_adds_flag_field() {
        let mut e = entry(FieldKind::Text, "keywords");
        e.multivalue = true;
        e.ordered_flag = true;
        let fields = schema_fields(&repo(), &e);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].field_type, "list");
        assert_eq!(fields[1].name, "keywords_ordered");
    }

    #[test]
    fn expected_schema_of_example_is_valid() {
        let repo = repo();
        let schema = expected_schema(&repo, ObjectType::Page).unwrap();
        assert_eq!(schema.name, "cms_content");
        assert_eq!(schema.display_field.as_deref(), Some("name"));
        assert_eq!(schema.segment_field.as_deref(), Some("filename"));
        assert!(schema.url_fields.is_empty());
        assert!(schema.field("link_internal").is_some());
        assert!(schema.field("related_maxItems").is_some());

        let folder = expected_schema(&repo, ObjectType::Folder).unwrap();
        assert!(folder.container);

        let form = expected_schema(&repo, ObjectType::Form).unwrap();
        assert_eq!(form.url_fields, vec!["url".to_string()]);
        assert!(form.segment_field.is_none());
    }

    #[test]
    fn missing_display_field_is_an_error() {
        let mut repo = repo();
        repo.mappings
            .retain(|m| !(m.object_type == ObjectType::File && m.display_field));
        assert_eq!(
            expected_schema(&repo, ObjectType::File),
            Err(MappingError::NoDisplayField(ObjectType::File))
        );
    }

    #[test]
    fn url_mechanism_must_be_unique() {
        let mut repo = repo();
        for m in repo.mappings.iter_mut() {
            if m.object_type == ObjectType::Form && m.field == "name" {
                m.segment_field = true;
            }
        }
        assert_eq!(
            expected_schema(&repo, ObjectType::Form),
            Err(MappingError::AmbiguousUrlMechanism(ObjectType::Form))
        );

        let mut repo2 = self::repo();
        repo2
            .mappings
            .retain(|m| !(m.object_type == ObjectType::Form && m.url_field));
        assert_eq!(
            expected_schema(&repo2, ObjectType::Form),
            Err(MappingError::NoUrlMechanism(ObjectType::Form))
        );
    }

    #[test]
    fn duplicate_entries_are_ignored() {
        let mut repo = repo();
        let dup = repo
            .mappings
            .iter()
            .find(|m| m.object_type == ObjectType::Page && m.field == "content")
            .cloned()
            .unwrap();
        repo.mappings.push(dup.clone());
        let mut conflicting = dup;
        conflicting.kind = FieldKind::Number;
        repo.mappings.push(conflicting);

        let entries = effective_entries(&repo, ObjectType::Page);
        let content: Vec<_> = entries.iter().filter(|e| e.field == "content").collect();
        assert_eq!(content.len(), 1);
        assert_eq!(content[0].kind, FieldKind::Html);
    }

    #[test]
    fn microschema_description_is_deterministic_uuid() {
        let repo = repo();
        let m = expected_microschema(&repo, &repo.microschemas[0]).unwrap();
        assert_eq!(m.name, "cms_teaser");
        assert_eq!(
            m.description.as_deref(),
            Some("a5470000000000000000000000005001")
        );
        assert_eq!(m.fields.len(), 2);
    }

    #[test]
    fn missing_values_are_explicit_nulls() {
        let repo = repo();
        let values = field_values(
            &repo,
            ObjectType::Form,
            &RenderedFields::new(),
            None,
            &Fixed(BTreeMap::new()),
        );
        assert_eq!(values.fields.get("name"), Some(&Value::Null));
        assert_eq!(values.fields.get("url"), Some(&Value::Null));
    }

    #[test]
    fn pending_references_are_postponed() {
        let repo = repo();
        let mut rendered = RenderedFields::new();
        rendered.insert("name".into(), RenderedValue::Text("Home".into()));
        rendered.insert(
            "link".into(),
            RenderedValue::Link(LinkValue::Internal(ident(5))),
        );
        let resolver = Fixed(BTreeMap::from([(5, Reference::Pending("uuid-5".into()))]));
        let values = field_values(&repo, ObjectType::Page, &rendered, None, &resolver);

        assert_eq!(values.fields["name"], json!("Home"));
        assert!(!values.fields.contains_key("link_internal"));
        assert_eq!(values.postponed["link_internal"], json!({ "uuid": "uuid-5" }));
        assert_eq!(values.postponed["link_external"], Value::Null);
        assert_eq!(values.dependencies.len(), 1);
    }

    #[test]
    fn absent_references_become_null_and_overview_lists_stay_parallel() {
        let repo = repo();
        let mut rendered = RenderedFields::new();
        rendered.insert(
            "related".into(),
            RenderedValue::Overview(OverviewValue {
                list_type: Some("PAGE".into()),
                items: vec![ident(1), ident(2), ident(3)],
                item_sites: vec![10, 20, 30],
                max_items: Some(5),
                ..Default::default()
            }),
        );
        let resolver = Fixed(BTreeMap::from([(2, Reference::Absent)]));
        let values = field_values(&repo, ObjectType::Page, &rendered, None, &resolver);
        assert_eq!(
            values.fields["related_items"],
            json!([{ "uuid": "uuid-1" }, { "uuid": "uuid-3" }])
        );
        assert_eq!(values.fields["related_nodeIds"], json!([10, 30]));
        assert_eq!(values.fields["related_maxItems"], json!(5));
        assert_eq!(values.fields["related_selectType"], Value::Null);
    }

    #[test]
    fn references_are_collected_from_nested_values() {
        let mut rendered = RenderedFields::new();
        rendered.insert("link".into(), RenderedValue::Link(LinkValue::Internal(ident(1))));
        rendered.insert("url".into(), RenderedValue::Link(LinkValue::External("x".into())));
        rendered.insert(
            "teaser".into(),
            RenderedValue::Micronode(MicronodeValue {
                construct: "teaser".into(),
                fields: BTreeMap::from([(
                    "image".to_string(),
                    RenderedValue::List(vec![RenderedValue::Node(ident(2))]),
                )]),
            }),
        );
        rendered.insert(
            "related".into(),
            RenderedValue::Overview(OverviewValue {
                items: vec![ident(3)],
                ..Default::default()
            }),
        );
        let mut ids: Vec<i64> = referenced_identities(&rendered)
            .into_iter()
            .map(|i| i.key.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn micronode_values_name_their_microschema() {
        let repo = repo();
        let mut rendered = RenderedFields::new();
        rendered.insert(
            "teaser".into(),
            RenderedValue::Micronode(MicronodeValue {
                construct: "teaser".into(),
                fields: BTreeMap::from([(
                    "headline".to_string(),
                    RenderedValue::Text("Hello".into()),
                )]),
            }),
        );
        let values = field_values(
            &repo,
            ObjectType::Page,
            &rendered,
            Some(&["teaser".to_string()]),
            &Fixed(BTreeMap::new()),
        );
        assert_eq!(values.fields.len(), 1);
        assert_eq!(values.fields["teaser"]["microschema"]["name"], "cms_teaser");
        assert_eq!(values.fields["teaser"]["fields"]["headline"], "Hello");
    }

    #[test]
    fn roles_parse_from_text_and_lists() {
        let mut rendered = RenderedFields::new();
        rendered.insert("roles".into(), RenderedValue::Text("editor, anonymous,editor".into()));
        assert_eq!(
            roles_from(&rendered, "roles"),
            Some(vec!["anonymous".to_string(), "editor".to_string()])
        );
        rendered.insert(
            "roles".into(),
            RenderedValue::List(vec![RenderedValue::Text("admin".into())]),
        );
        assert_eq!(roles_from(&rendered, "roles"), Some(vec!["admin".to_string()]));
        assert_eq!(roles_from(&rendered, "missing"), None);
    }

    #[test]
    fn binary_fields_are_not_written_as_values() {
        let repo = repo();
        assert_eq!(binary_field(&repo, ObjectType::File).as_deref(), Some("binarycontent"));
        let values = field_values(
            &repo,
            ObjectType::File,
            &RenderedFields::new(),
            None,
            &Fixed(BTreeMap::new()),
        );
        assert!(!values.fields.contains_key("binarycontent"));
    }
}
