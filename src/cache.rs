//! Run-scoped knowledge about which objects exist in the target system.
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use crate::identity::IdentityMapper;
use crate::mapping::{Reference, ReferenceResolver};
use crate::model::{Identity, ObjectKey, ObjectType};
use crate::target::model::Scope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// Not touched in this run; assumed to exist from earlier runs.
    Unknown,
    /// Will be written later in this run.
    Scheduled,
    Written,
    /// Known not to exist.
    Missing,
}

/// Existence cache with one bucket per object type, each behind its own lock.
#[derive(Debug, Default)]
pub struct ExistenceCache {
    buckets: [RwLock<HashMap<i64, Presence>>; 4],
}

fn bucket_index(object_type: ObjectType) -> usize {
    match object_type {
        ObjectType::Folder => 0,
        ObjectType::Page => 1,
        ObjectType::File => 2,
        ObjectType::Form => 3,
    }
}

impl ExistenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, key: ObjectKey, presence: Presence) {
        let mut bucket = self.buckets[bucket_index(key.object_type)]
            .write()
            .unwrap_or_else(|p| p.into_inner());
        bucket.insert(key.id, presence);
    }

    pub fn presence(&self, key: ObjectKey) -> Presence {
        self.buckets[bucket_index(key.object_type)]
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&key.id)
            .copied()
            .unwrap_or(Presence::Unknown)
    }

    /// Marks `key` as scheduled unless it was already written in this run.
    pub fn schedule(&self, key: ObjectKey) {
        let mut bucket = self.buckets[bucket_index(key.object_type)]
            .write()
            .unwrap_or_else(|p| p.into_inner());
        let entry = bucket.entry(key.id).or_insert(Presence::Scheduled);
        if *entry != Presence::Written {
            *entry = Presence::Scheduled;
        }
    }

    pub fn written(&self, key: ObjectKey) {
        self.set(key, Presence::Written);
    }

    pub fn missing(&self, key: ObjectKey) {
        self.set(key, Presence::Missing);
    }

    pub fn count(&self, presence: Presence) -> usize {
        self.buckets
            .iter()
            .map(|b| {
                b.read()
                    .unwrap_or_else(|p| p.into_inner())
                    .values()
                    .filter(|p| **p == presence)
                    .count()
            })
            .sum()
    }
}

/// Resolves references of rendered values against the existence cache.
pub struct CacheResolver<'a> {
    pub mapper: &'a IdentityMapper,
    pub cache: &'a ExistenceCache,
}

impl ReferenceResolver for CacheResolver<'_> {
    fn resolve(&self, identity: &Identity) -> Reference {
        let Ok(uuid) = self.mapper.target_wire(identity) else {
            return Reference::Absent;
        };
        match self.cache.presence(identity.key) {
            Presence::Missing => Reference::Absent,
            Presence::Scheduled => Reference::Pending(uuid),
            Presence::Written | Presence::Unknown => Reference::Present(uuid),
        }
    }
}

/// Which source object claimed a `(branch, uuid, language)` slot in this run.
#[derive(Debug, Default)]
pub struct IdentityClaims {
    claims: Mutex<HashMap<(Scope, String, String), ObjectKey>>,
}

impl IdentityClaims {
    /// Claims the slot for `key`. Returns the other claimant when the slot
    /// is already held by a different object.
    pub fn claim(
        &self,
        scope: &Scope,
        uuid: &str,
        language: &str,
        key: ObjectKey,
    ) -> Result<(), ObjectKey> {
        let mut claims = self.claims.lock().unwrap_or_else(|p| p.into_inner());
        let slot = (scope.clone(), uuid.to_string(), language.to_string());
        match claims.get(&slot) {
            Some(other) if *other != key => Err(*other),
            Some(_) => Ok(()),
            None => {
                claims.insert(slot, key);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn page(id: i64) -> Identity {
        Identity {
            key: ObjectKey::new(ObjectType::Page, id),
            global_id: format!("A547.{}", id),
            content_set: Some(format!("A547.{}", id + 1000)),
            root_of_site: None,
        }
    }

    #[test]
    fn written_is_not_downgraded_by_schedule() {
        let cache = ExistenceCache::new();
        let key = ObjectKey::new(ObjectType::Folder, 1);
        assert_eq!(cache.presence(key), Presence::Unknown);
        cache.schedule(key);
        assert_eq!(cache.presence(key), Presence::Scheduled);
        cache.written(key);
        cache.schedule(key);
        assert_eq!(cache.presence(key), Presence::Written);
        assert_eq!(cache.presence(ObjectKey::new(ObjectType::Page, 1)), Presence::Unknown);
        assert_eq!(cache.count(Presence::Written), 1);
    }

    #[test]
    fn resolver_reports_pending_and_absent_references() {
        let cache = ExistenceCache::new();
        let mapper = IdentityMapper::new(true, BTreeMap::new());
        let resolver = CacheResolver {
            mapper: &mapper,
            cache: &cache,
        };
        assert!(matches!(resolver.resolve(&page(1)), Reference::Present(_)));
        cache.schedule(page(1).key);
        assert_eq!(
            resolver.resolve(&page(1)),
            Reference::Pending("a5470000000000000000000000001001".into())
        );
        cache.missing(page(1).key);
        assert_eq!(resolver.resolve(&page(1)), Reference::Absent);
    }

    #[test]
    fn claims_refuse_a_second_object() {
        let claims = IdentityClaims::default();
        let scope = Scope::new("site", None);
        let a = ObjectKey::new(ObjectType::Page, 1);
        let b = ObjectKey::new(ObjectType::Page, 2);
        assert!(claims.claim(&scope, "u", "en", a).is_ok());
        assert!(claims.claim(&scope, "u", "en", a).is_ok());
        assert_eq!(claims.claim(&scope, "u", "en", b), Err(a));
        assert!(claims.claim(&scope, "u", "de", b).is_ok());
    }
}
