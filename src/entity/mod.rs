//! Entity resolution: canonicalize party names into stable identities.
//!
//! Resolution strategy avoids full-table scans:
//! 1. exact name match (indexed)
//! 2. case-insensitive match
//! 3. LIKE narrowing on the longest token (>= 4 chars), capped at 100 rows
//!    (200 without a usable token)
//! 4. normalized sequence-ratio scoring over the narrowed candidates only
//!
//! Matching with a different spelling appends the input to the entity's
//! `aliases` metadata. Writes are serialized per canonical name via a hashed
//! lock partition so racing upserts cannot create duplicate entities.

use crate::errors::EngineResult;
use crate::fuzzy;
use crate::models::{Entity, EntityType};
use crate::store::ForensicStore;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_THRESHOLD: f64 = 0.85;
const NARROW_LIMIT: usize = 100;
const FALLBACK_LIMIT: usize = 200;
const LOCK_PARTITIONS: usize = 16;

pub struct EntityResolver {
    store: ForensicStore,
    name_locks: Vec<Arc<Mutex<()>>>,
}

impl EntityResolver {
    pub fn new(store: ForensicStore) -> Self {
        let name_locks = (0..LOCK_PARTITIONS).map(|_| Arc::new(Mutex::new(()))).collect();
        Self { store, name_locks }
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut hasher = DefaultHasher::new();
        name.to_lowercase().hash(&mut hasher);
        let idx = (hasher.finish() as usize) % LOCK_PARTITIONS;
        self.name_locks[idx].clone()
    }

    /// Longest whitespace token of at least 4 chars, used to narrow the LIKE
    /// candidate query.
    fn narrowing_token(name: &str) -> Option<&str> {
        name.split_whitespace()
            .filter(|t| t.chars().count() >= 4)
            .max_by_key(|t| t.chars().count())
    }

    /// Find a matching entity using fuzzy logic, or None below threshold.
    pub fn resolve(&self, name: &str, threshold: f64) -> EngineResult<Option<Entity>> {
        let name = name.trim();
        if name.is_empty() {
            return Ok(None);
        }
        if let Some(exact) = self.store.find_entity_exact(name)? {
            return Ok(Some(exact));
        }
        if let Some(ci) = self.store.find_entity_case_insensitive(name)? {
            return Ok(Some(ci));
        }

        let candidates = match Self::narrowing_token(name) {
            Some(token) => self.store.find_entities_like(token, NARROW_LIMIT)?,
            None => self.store.list_entities(FALLBACK_LIMIT)?,
        };

        let mut best: Option<(f64, Entity)> = None;
        for candidate in candidates {
            let score = fuzzy::name_similarity(name, &candidate.name);
            if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                best = Some((score, candidate));
            }
        }
        match best {
            Some((score, entity)) if score >= threshold => Ok(Some(entity)),
            _ => Ok(None),
        }
    }

    /// Smart upsert: resolve first; on a hit with a different spelling append
    /// the alias; on a miss create the entity. Idempotent per name.
    pub fn upsert(&self, name: &str, account_number: Option<&str>) -> EngineResult<Entity> {
        let lock = self.lock_for(name);
        let _guard = lock.lock();

        if let Some(mut matched) = self.resolve(name, DEFAULT_THRESHOLD)? {
            if matched.name != name && matched.push_alias(name) {
                debug!(entity = %matched.name, alias = name, "Alias appended");
                self.store.update_entity(&matched)?;
            }
            return Ok(matched);
        }

        let mut entity = Entity::new(name, Self::infer_type(name));
        entity.metadata.insert("aliases".to_string(), Value::Array(Vec::new()));
        if let Some(account) = account_number {
            entity
                .metadata
                .insert("account_number".to_string(), Value::String(account.to_string()));
        }
        self.store.insert_entity(&entity)?;
        Ok(entity)
    }

    /// Cheap type hint from legal-form markers in the name.
    fn infer_type(name: &str) -> EntityType {
        let upper = name.to_uppercase();
        let tokens: Vec<&str> = upper.split_whitespace().collect();
        let markers = ["PT", "PT.", "CV", "CV.", "UD", "TBK", "LTD", "INC", "CORP"];
        if tokens.iter().any(|t| markers.contains(t)) {
            EntityType::Company
        } else {
            EntityType::Person
        }
    }

    /// Raise an entity's risk floor. Used by ingestion when a personal-leakage
    /// signature names a receiver.
    pub fn raise_risk_floor(&self, entity_id: &str, floor: f64) -> EngineResult<()> {
        let mut entity = self.store.get_entity(entity_id)?;
        if entity.risk_score < floor {
            entity.risk_score = floor;
            self.store.update_entity(&entity)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> (EntityResolver, ForensicStore) {
        let store = ForensicStore::open_in_memory().unwrap();
        (EntityResolver::new(store.clone()), store)
    }

    #[test]
    fn upsert_twice_returns_same_entity() {
        let (resolver, _store) = resolver();
        let first = resolver.upsert("PT Semen Indonesia", None).unwrap();
        let second = resolver.upsert("PT Semen Indonesia", None).unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn near_spelling_accumulates_alias() {
        let (resolver, store) = resolver();
        let original = resolver.upsert("PT Semen Indonesia", None).unwrap();
        let matched = resolver.upsert("PT Semen Indonesial", None).unwrap();
        assert_eq!(original.id, matched.id);
        let stored = store.get_entity(&original.id).unwrap();
        assert!(stored.aliases().contains(&"PT Semen Indonesial".to_string()));
    }

    #[test]
    fn dissimilar_names_create_distinct_entities() {
        let (resolver, _store) = resolver();
        let a = resolver.upsert("PT Semen Indonesia", None).unwrap();
        let b = resolver.upsert("CV Batu Alam Jaya", None).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn case_insensitive_match_resolves() {
        let (resolver, _store) = resolver();
        let a = resolver.upsert("Bapa Banda", None).unwrap();
        let b = resolver.resolve("bapa banda", DEFAULT_THRESHOLD).unwrap().unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn company_markers_infer_company_type() {
        let (resolver, _store) = resolver();
        let company = resolver.upsert("PT Konstruksi Utama", None).unwrap();
        assert_eq!(company.entity_type, EntityType::Company);
        let person = resolver.upsert("Sandi", None).unwrap();
        assert_eq!(person.entity_type, EntityType::Person);
    }

    #[test]
    fn account_number_lands_in_metadata() {
        let (resolver, _store) = resolver();
        let entity = resolver.upsert("Bank Account 921", Some("921")).unwrap();
        assert_eq!(
            entity.metadata.get("account_number").and_then(|v| v.as_str()),
            Some("921")
        );
    }
}
