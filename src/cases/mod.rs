//! Investigation cases and admitted evidence.
//!
//! Exhibits are hash-signed at creation; admitting an entity-typed exhibit
//! propagates risk onto the global entity. Sealing a case freezes its
//! exhibits (enforced at the store layer) and registers the final report
//! hash in the integrity registry.

pub mod dossier;

use crate::errors::{EngineError, EngineResult};
use crate::events::{EventBus, EventKind};
use crate::integrity::{IntegrityRegistry, SealRequest};
use crate::models::*;
use crate::store::audit::{AuditLogger, ChangeRecord};
use crate::store::ForensicStore;
use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::info;

const DEFAULT_RISK_INCREMENT: f64 = 0.2;

pub struct CaseService {
    store: ForensicStore,
    bus: Arc<EventBus>,
    registry: Arc<IntegrityRegistry>,
    compiler: dossier::DossierCompiler,
}

impl CaseService {
    pub fn new(store: ForensicStore, bus: Arc<EventBus>, registry: Arc<IntegrityRegistry>) -> Self {
        let compiler = dossier::DossierCompiler::new(store.clone());
        Self { store, bus, registry, compiler }
    }

    /// Compile the case's evidence package without sealing it.
    pub fn compile_dossier(&self, case_id: &str) -> EngineResult<dossier::Dossier> {
        let case = self.store.get_case(case_id)?;
        let project_id = case
            .project_id
            .clone()
            .ok_or_else(|| EngineError::Validation("case has no project".to_string()))?;
        self.compiler.compile(&project_id, Some(case_id))
    }

    /// Compile the dossier and seal the case with its canonical bytes.
    pub fn seal_with_dossier(&self, case_id: &str, sealed_by: &str) -> EngineResult<Case> {
        let package = self.compile_dossier(case_id)?;
        self.seal_case(case_id, &package.canonical_bytes(), sealed_by)
    }

    pub fn create_case(&self, project_id: &str, title: &str, description: &str) -> EngineResult<Case> {
        // Project must exist (404 otherwise)
        self.store.get_project(project_id)?;
        let case = Case::new(project_id, title, description);
        self.store.insert_case(&case)?;
        self.bus.publish_with(
            EventKind::CaseCreated,
            json!({"case_id": case.id, "case_title": case.title}),
            None,
            Some(project_id.to_string()),
        );
        Ok(case)
    }

    /// Add an exhibit; the hash signature is taken over the evidence
    /// coordinates at admission time.
    pub fn add_exhibit(
        &self,
        case_id: &str,
        evidence_type: &str,
        evidence_id: &str,
        label: &str,
    ) -> EngineResult<CaseExhibit> {
        let case = self.store.get_case(case_id)?;
        let mut exhibit = CaseExhibit::new(&case.id, evidence_type, evidence_id, label);
        let mut hasher = Sha256::new();
        hasher.update(
            format!("{}|{}|{}|{}", case.id, evidence_type, evidence_id, exhibit.created_at.to_rfc3339())
                .as_bytes(),
        );
        exhibit.hash_signature = hex::encode(hasher.finalize());
        self.store.insert_exhibit(&exhibit)?;

        self.bus.publish_with(
            EventKind::EvidenceAdded,
            json!({
                "case_id": case.id,
                "exhibit_id": exhibit.id,
                "evidence_type": evidence_type,
                "evidence_id": evidence_id,
                "hash_signature": exhibit.hash_signature,
            }),
            None,
            case.project_id.clone(),
        );
        Ok(exhibit)
    }

    /// Adjudicate an exhibit. Admitting an entity exhibit escalates the
    /// entity's risk score.
    pub fn set_verdict(
        &self,
        exhibit_id: &str,
        verdict: ExhibitVerdict,
        adjudicator: Option<&str>,
    ) -> EngineResult<CaseExhibit> {
        let mut exhibit = self.store.get_exhibit(exhibit_id)?;
        let old_verdict = exhibit.verdict;
        exhibit.verdict = verdict;
        exhibit.adjudicated_at = Some(Utc::now());
        exhibit.adjudicated_by_id = adjudicator.map(String::from);
        self.store.update_exhibit(&exhibit)?;

        let newly_admitted =
            verdict == ExhibitVerdict::Admitted && old_verdict != ExhibitVerdict::Admitted;
        if newly_admitted && exhibit.evidence_type == "entity" {
            if let Ok(mut entity) = self.store.get_entity(&exhibit.evidence_id) {
                let increment = exhibit
                    .metadata
                    .get("risk_increment")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(DEFAULT_RISK_INCREMENT);
                let old_risk = entity.risk_score;
                entity.risk_score = (entity.risk_score + increment).min(1.0);
                self.store.update_entity(&entity)?;
                self.bus.publish(
                    EventKind::RiskUpdated,
                    json!({
                        "entity_id": entity.id,
                        "old_risk": old_risk,
                        "new_risk": entity.risk_score,
                        "source": "exhibit_admission",
                    }),
                );
            }
        }
        if newly_admitted {
            self.bus.publish(
                EventKind::EvidenceVerified,
                json!({
                    "exhibit_id": exhibit.id,
                    "case_id": exhibit.case_id,
                    "verdict": verdict.as_str(),
                    "risk_propagated": exhibit.evidence_type == "entity",
                }),
            );
        }
        Ok(exhibit)
    }

    /// Seal a case: freeze exhibits, hash the final report, register it.
    pub fn seal_case(
        &self,
        case_id: &str,
        report: &[u8],
        sealed_by: &str,
    ) -> EngineResult<Case> {
        let mut case = self.store.get_case(case_id)?;
        if case.status == CaseStatus::Sealed {
            return Err(EngineError::Conflict(format!("case {case_id} already sealed")));
        }
        let project_id = case
            .project_id
            .clone()
            .ok_or_else(|| EngineError::Validation("case has no project".to_string()))?;

        let entry = self.registry.seal(
            report,
            SealRequest {
                project_id: &project_id,
                entity_type: SealedEntityType::Dossier,
                entity_id: &case.id,
                sealed_by_id: sealed_by,
            },
        )?;

        case.status = CaseStatus::Sealed;
        case.final_report_hash = Some(entry.file_hash.clone());
        case.sealed_at = Some(Utc::now());
        case.sealed_by_id = Some(sealed_by.to_string());
        case.updated_at = Utc::now();
        self.store.update_case(&case)?;

        AuditLogger::log_change(
            &self.store,
            ChangeRecord::new("Case", &case.id, "SEAL_CASE")
                .field("status", Some("investigating"), Some("sealed"))
                .by_user(sealed_by)
                .reason(&format!("Final report hash {}", entry.file_hash)),
        )?;

        self.bus.publish_with(
            EventKind::CaseClosed,
            json!({
                "case_id": case.id,
                "case_title": case.title,
                "sealed_at": case.sealed_at.map(|t| t.to_rfc3339()),
                "report_hash": case.final_report_hash,
            }),
            None,
            Some(project_id),
        );
        info!(case = %case.id, "🔒 Case sealed");
        Ok(case)
    }

    pub fn list_exhibits(&self, case_id: &str) -> EngineResult<Vec<CaseExhibit>> {
        self.store.get_case(case_id)?;
        self.store.list_exhibits(case_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityType;

    fn setup() -> (CaseService, ForensicStore, Arc<EventBus>, Project) {
        let store = ForensicStore::open_in_memory().unwrap();
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(IntegrityRegistry::new(store.clone(), None));
        let service = CaseService::new(store.clone(), bus.clone(), registry);
        let project = Project::new("Audit", "CTR-950", 1.0, "PT X");
        store.insert_project(&project).unwrap();
        (service, store, bus, project)
    }

    #[test]
    fn exhibits_are_hash_signed_at_admission() {
        let (service, _, _, project) = setup();
        let case = service.create_case(&project.id, "Leakage", "probe").unwrap();
        let exhibit = service.add_exhibit(&case.id, "transaction", "tx-1", "Invoice").unwrap();
        assert_eq!(exhibit.hash_signature.len(), 64);
        assert_eq!(exhibit.verdict, ExhibitVerdict::Pending);
    }

    #[test]
    fn admitting_entity_exhibit_propagates_risk() {
        let (service, store, bus, project) = setup();
        let mut entity = Entity::new("CV Nakal", EntityType::Company);
        entity.risk_score = 0.5;
        store.insert_entity(&entity).unwrap();

        let case = service.create_case(&project.id, "Funneling", "probe").unwrap();
        let exhibit = service.add_exhibit(&case.id, "entity", &entity.id, "Shell").unwrap();
        service.set_verdict(&exhibit.id, ExhibitVerdict::Admitted, Some("inv-1")).unwrap();

        let updated = store.get_entity(&entity.id).unwrap();
        assert!((updated.risk_score - 0.7).abs() < 1e-9);
        assert_eq!(bus.recent(Some(EventKind::RiskUpdated), None, 5).len(), 1);

        // Second admission of the same exhibit is a no-op for risk
        service.set_verdict(&exhibit.id, ExhibitVerdict::Admitted, Some("inv-1")).unwrap();
        let unchanged = store.get_entity(&entity.id).unwrap();
        assert!((unchanged.risk_score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn risk_clamps_at_one() {
        let (service, store, _, project) = setup();
        let mut entity = Entity::new("CV Max", EntityType::Company);
        entity.risk_score = 0.95;
        store.insert_entity(&entity).unwrap();
        let case = service.create_case(&project.id, "C", "d").unwrap();
        let exhibit = service.add_exhibit(&case.id, "entity", &entity.id, "E").unwrap();
        service.set_verdict(&exhibit.id, ExhibitVerdict::Admitted, None).unwrap();
        assert_eq!(store.get_entity(&entity.id).unwrap().risk_score, 1.0);
    }

    #[test]
    fn sealed_case_freezes_exhibits_and_registers_hash() {
        let (service, store, bus, project) = setup();
        let case = service.create_case(&project.id, "Final", "probe").unwrap();
        service.add_exhibit(&case.id, "transaction", "tx-1", "A").unwrap();

        let sealed = service.seal_case(&case.id, b"final report", "inv-1").unwrap();
        assert_eq!(sealed.status, CaseStatus::Sealed);
        assert!(sealed.final_report_hash.is_some());

        // Exhibit mutation after sealing is a permanent violation
        let err = service.add_exhibit(&case.id, "transaction", "tx-2", "B").unwrap_err();
        assert!(matches!(err, EngineError::Permanent(_)));

        // Double sealing is a conflict
        let err = service.seal_case(&case.id, b"other", "inv-1").unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        assert_eq!(bus.recent(Some(EventKind::CaseClosed), None, 5).len(), 1);
        let registry_entry = store
            .find_registry_entry_by_hash(sealed.final_report_hash.as_deref().unwrap())
            .unwrap();
        assert!(registry_entry.is_some());
    }

    #[test]
    fn seal_with_dossier_registers_package_hash() {
        let (service, store, _, project) = setup();
        let case = service.create_case(&project.id, "Dossier", "probe").unwrap();
        service.add_exhibit(&case.id, "transaction", "tx-1", "A").unwrap();

        let sealed = service.seal_with_dossier(&case.id, "inv-1").unwrap();
        assert_eq!(sealed.status, CaseStatus::Sealed);
        let hash = sealed.final_report_hash.as_deref().unwrap();
        assert!(store.find_registry_entry_by_hash(hash).unwrap().is_some());
    }

    #[test]
    fn missing_project_is_not_found() {
        let (service, _, _, _) = setup();
        let err = service.create_case("nope", "t", "d").unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }
}
