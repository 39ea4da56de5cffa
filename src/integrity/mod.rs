//! Cryptographic registry for sealed artifacts.
//!
//! `seal` computes SHA-256 over the artifact bytes, persists a registry row
//! and writes an audit-chain entry whose previous hash is the project's last
//! registry signature. Anchoring to an external ledger is optional and
//! best-effort: a missing anchor id means "registry-only".

use crate::errors::EngineResult;
use crate::models::{new_id, RegistryEntry, SealedEntityType};
use crate::store::audit::{AuditLogger, ChangeRecord};
use crate::store::ForensicStore;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::info;

/// External anchoring hook. Implementations must be idempotent per hash.
pub trait RegistryAnchor: Send + Sync {
    fn anchor(&self, hash: &str) -> Option<String>;
}

pub struct SealRequest<'a> {
    pub project_id: &'a str,
    pub entity_type: SealedEntityType,
    pub entity_id: &'a str,
    pub sealed_by_id: &'a str,
}

pub struct IntegrityRegistry {
    store: ForensicStore,
    anchor: Option<Arc<dyn RegistryAnchor>>,
}

impl IntegrityRegistry {
    pub fn new(store: ForensicStore, anchor: Option<Arc<dyn RegistryAnchor>>) -> Self {
        Self { store, anchor }
    }

    pub fn hash_bytes(artifact: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(artifact);
        hex::encode(hasher.finalize())
    }

    /// Seal an artifact into the registry. The chain entry's previous hash is
    /// the project's last registry signature.
    pub fn seal(&self, artifact: &[u8], request: SealRequest<'_>) -> EngineResult<RegistryEntry> {
        let file_hash = Self::hash_bytes(artifact);
        self.seal_hash(&file_hash, request)
    }

    /// Seal an artifact whose SHA-256 was computed upstream (e.g. an
    /// ingestion's file hash).
    pub fn seal_hash(&self, file_hash: &str, request: SealRequest<'_>) -> EngineResult<RegistryEntry> {
        let previous = self.store.last_registry_entry(request.project_id)?;
        let anchor_id = self.anchor.as_ref().and_then(|a| a.anchor(file_hash));
        let entry = RegistryEntry {
            id: new_id(),
            project_id: request.project_id.to_string(),
            entity_type: request.entity_type,
            entity_id: request.entity_id.to_string(),
            file_hash: file_hash.to_string(),
            anchor_id: anchor_id.clone(),
            sealed_at: Utc::now(),
            sealed_by_id: request.sealed_by_id.to_string(),
        };
        self.store.insert_registry_entry(&entry)?;
        AuditLogger::log_change(
            &self.store,
            ChangeRecord::new("IntegrityRegistry", &entry.id, "SEAL_ARTIFACT")
                .field(
                    "file_hash",
                    previous.as_ref().map(|p| p.file_hash.as_str()),
                    Some(file_hash),
                )
                .by_user(request.sealed_by_id)
                .reason(&format!(
                    "{} {} sealed{}",
                    request.entity_type.as_str(),
                    request.entity_id,
                    anchor_id.map(|a| format!(" (anchor {a})")).unwrap_or_default()
                )),
        )?;
        info!(
            project = request.project_id,
            entity = request.entity_id,
            hash = file_hash,
            "🔏 Artifact sealed"
        );
        Ok(entry)
    }

    /// Look up a sealed artifact by content hash.
    pub fn verify(&self, hash: &str) -> EngineResult<Option<RegistryEntry>> {
        self.store.find_registry_entry_by_hash(hash)
    }

    /// Verify that supplied bytes still match a sealed artifact.
    pub fn verify_bytes(&self, artifact: &[u8]) -> EngineResult<Option<RegistryEntry>> {
        self.verify(&Self::hash_bytes(artifact))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Project;
    use crate::store::audit::AuditLogger;

    fn setup() -> (IntegrityRegistry, ForensicStore, Project) {
        let store = ForensicStore::open_in_memory().unwrap();
        let project = Project::new("Audit", "CTR-900", 1.0, "PT X");
        store.insert_project(&project).unwrap();
        (IntegrityRegistry::new(store.clone(), None), store, project)
    }

    #[test]
    fn seal_then_verify_round_trips() {
        let (registry, _, project) = setup();
        let entry = registry
            .seal(
                b"dossier body v1",
                SealRequest {
                    project_id: &project.id,
                    entity_type: SealedEntityType::Dossier,
                    entity_id: "case-1",
                    sealed_by_id: "investigator-1",
                },
            )
            .unwrap();
        assert_eq!(entry.file_hash.len(), 64);
        assert!(entry.anchor_id.is_none());

        let found = registry.verify(&entry.file_hash).unwrap().unwrap();
        assert_eq!(found.entity_id, "case-1");
        assert!(registry.verify_bytes(b"dossier body v1").unwrap().is_some());
        assert!(registry.verify_bytes(b"tampered body").unwrap().is_none());
    }

    #[test]
    fn sealing_is_deterministic_per_content() {
        assert_eq!(
            IntegrityRegistry::hash_bytes(b"same bytes"),
            IntegrityRegistry::hash_bytes(b"same bytes")
        );
        assert_ne!(
            IntegrityRegistry::hash_bytes(b"same bytes"),
            IntegrityRegistry::hash_bytes(b"other bytes")
        );
    }

    #[test]
    fn chain_links_previous_registry_hash() {
        let (registry, store, project) = setup();
        let first = registry
            .seal(
                b"exhibit A",
                SealRequest {
                    project_id: &project.id,
                    entity_type: SealedEntityType::Exhibit,
                    entity_id: "exe-1",
                    sealed_by_id: "u1",
                },
            )
            .unwrap();
        let second = registry
            .seal(
                b"exhibit B",
                SealRequest {
                    project_id: &project.id,
                    entity_type: SealedEntityType::Exhibit,
                    entity_id: "exe-2",
                    sealed_by_id: "u1",
                },
            )
            .unwrap();

        let entries = AuditLogger::entries_for(&store, &second.id).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].old_value.as_deref(), Some(first.file_hash.as_str()));
        AuditLogger::verify_chain(&store, &second.id).unwrap();
    }

    struct StaticAnchor;
    impl RegistryAnchor for StaticAnchor {
        fn anchor(&self, hash: &str) -> Option<String> {
            Some(format!("0x{}", &hash[..8]))
        }
    }

    #[test]
    fn anchor_id_recorded_when_anchor_present() {
        let store = ForensicStore::open_in_memory().unwrap();
        let project = Project::new("Audit", "CTR-901", 1.0, "PT X");
        store.insert_project(&project).unwrap();
        let registry = IntegrityRegistry::new(store, Some(Arc::new(StaticAnchor)));
        let entry = registry
            .seal(
                b"anchored artifact",
                SealRequest {
                    project_id: &project.id,
                    entity_type: SealedEntityType::TransactionSet,
                    entity_id: "ing-1",
                    sealed_by_id: "u1",
                },
            )
            .unwrap();
        assert!(entry.anchor_id.as_deref().unwrap().starts_with("0x"));
    }
}
