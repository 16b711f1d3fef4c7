//! Deterministic mapping from source global ids to target UUIDs.
//!
//! Two global id notations exist on the source side:
//! - legacy: `<4 hex system prefix>.<decimal local id>`, e.g. `A547.69478`
//! - modern: an optionally prefixed UUID, e.g. `cms:v2-a5470000-0000-0000-0000-000000069478`
//!
//! Both are normalized to 32 lowercase hex characters. A legacy id is the
//! system prefix followed by the local id left-padded with zeros, so that the
//! modern notation of the same object yields the same UUID.
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{Identity, ObjectType};

const UUID_HEX_LEN: usize = 32;
const LEGACY_PREFIX_LEN: usize = 4;

static LEGACY_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<system>[0-9A-Fa-f]{4})\.(?P<local>[0-9]{1,28})$").expect("valid legacy id regex")
});

static MODERN_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?:[A-Za-z][A-Za-z0-9_]*:)?(?:[vV][0-9]+[-.])?(?P<hex>[0-9A-Fa-f]{8}-?[0-9A-Fa-f]{4}-?[0-9A-Fa-f]{4}-?[0-9A-Fa-f]{4}-?[0-9A-Fa-f]{12})$",
    )
    .expect("valid modern id regex")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("malformed global id '{0}'")]
    Malformed(String),
    #[error("no root item known for site {0}")]
    UnknownRootItem(i64),
    #[error("page {0} has no content set id")]
    MissingContentSet(i64),
}

/// Normalize a global id to the target UUID it stands for.
pub fn uuid_from_global_id(global_id: &str) -> Result<Uuid, IdentityError> {
    let trimmed = global_id.trim();
    let hex = if let Some(caps) = LEGACY_ID.captures(trimmed) {
        let system = &caps["system"];
        let local = &caps["local"];
        format!(
            "{}{:0>width$}",
            system.to_ascii_lowercase(),
            local,
            width = UUID_HEX_LEN - LEGACY_PREFIX_LEN
        )
    } else if let Some(caps) = MODERN_ID.captures(trimmed) {
        caps["hex"].replace('-', "").to_ascii_lowercase()
    } else {
        return Err(IdentityError::Malformed(global_id.to_string()));
    };
    Uuid::parse_str(&hex).map_err(|_| IdentityError::Malformed(global_id.to_string()))
}

/// Format a UUID the way the target system addresses items.
pub fn wire(uuid: &Uuid) -> String {
    uuid.simple().to_string()
}

/// Parse a UUID as returned by the target system (dashed or simple).
pub fn parse_wire(s: &str) -> Option<Uuid> {
    Uuid::parse_str(s).ok()
}

/// Maps source identities to target UUIDs for one repository.
///
/// A mapper is a snapshot: it is built from the repository context after the
/// structural reconciliation has resolved the project root items, and never
/// performs I/O.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityMapper {
    project_per_site: bool,
    root_items: BTreeMap<i64, Uuid>,
}

impl IdentityMapper {
    pub fn new(project_per_site: bool, root_items: BTreeMap<i64, Uuid>) -> Self {
        Self {
            project_per_site,
            root_items,
        }
    }

    pub fn target_uuid(&self, identity: &Identity) -> Result<Uuid, IdentityError> {
        match identity.key.object_type {
            ObjectType::Page => {
                let set = identity
                    .content_set
                    .as_deref()
                    .ok_or(IdentityError::MissingContentSet(identity.key.id))?;
                uuid_from_global_id(set)
            }
            ObjectType::Folder if self.project_per_site => match identity.root_of_site {
                Some(site) => self
                    .root_items
                    .get(&site)
                    .copied()
                    .ok_or(IdentityError::UnknownRootItem(site)),
                None => uuid_from_global_id(&identity.global_id),
            },
            _ => uuid_from_global_id(&identity.global_id),
        }
    }

    pub fn target_wire(&self, identity: &Identity) -> Result<String, IdentityError> {
        self.target_uuid(identity).map(|u| wire(&u))
    }

    /// Whether the folder is represented by a project root item.
    pub fn is_root_item(&self, identity: &Identity) -> bool {
        self.project_per_site
            && identity.key.object_type == ObjectType::Folder
            && identity.root_of_site.is_some()
    }
}
