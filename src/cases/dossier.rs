//! Dossier compilation: a canonical, structured evidence package for one
//! project (optionally scoped to a case), ready for sealing.
//!
//! Rendering to PDF is a downstream concern; this module produces the
//! deterministic JSON document the renderer and the integrity registry both
//! consume. Section order is fixed and maps are ordered so identical store
//! state yields identical bytes.

use crate::errors::EngineResult;
use crate::models::*;
use crate::store::audit::AuditLogger;
use crate::store::ForensicStore;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

/// Cap on raw ledger rows embedded in the package; the full set stays in the
/// store and is referenced by ingestion hash.
const LEDGER_ROW_CAP: usize = 500;

const METHODOLOGY: &[&str] = &[
    "Ledger and statement rows were normalized into a canonical transaction model with entity resolution and alias tracking.",
    "Every row was evaluated against the forensic rule battery: inflation variance, evidence gaps, personal leakage, fabricated entries, fuzzy duplicates, transfer velocity, cash channel risk, structuring, geographic mismatch and cross-project recidivism.",
    "Ledger rows were reconciled against bank statements using direct, aggregate, proportional and vector matching with multi-factor confidence scoring.",
    "Flow graphs were searched for circular transfers; ownership chains were resolved to ultimate beneficial owners.",
    "All state transitions are recorded in a hash-chained audit log; this package's hash is registered in the integrity registry at sealing time.",
];

#[derive(Debug, Clone)]
pub struct Dossier {
    pub project_id: String,
    pub case_id: Option<String>,
    pub generated_at: DateTime<Utc>,
    pub document: Value,
}

impl Dossier {
    /// Canonical byte form for hashing and sealing.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.document).unwrap_or_default()
    }
}

pub struct DossierCompiler {
    store: ForensicStore,
}

impl DossierCompiler {
    pub fn new(store: ForensicStore) -> Self {
        Self { store }
    }

    /// Compile the evidence package for a project; a case id narrows the
    /// exhibit section and stamps the case header.
    pub fn compile(&self, project_id: &str, case_id: Option<&str>) -> EngineResult<Dossier> {
        let project = self.store.get_project(project_id)?;
        let transactions = self.store.list_transactions(project_id)?;
        let generated_at = Utc::now();

        let flagged: Vec<&Transaction> = transactions
            .iter()
            .filter(|t| {
                matches!(t.status, TransactionStatus::Flagged | TransactionStatus::Locked)
            })
            .collect();
        let total_amount: f64 = transactions.iter().map(|t| t.actual_amount).sum();
        let flagged_amount: f64 = flagged.iter().map(|t| t.actual_amount).sum();
        let total_leakage: f64 = transactions.iter().map(|t| t.delta_inflation).sum();
        let entities = self.store.list_entities(10_000)?;

        let executive_summary = json!({
            "total_transactions": transactions.len(),
            "flagged_transactions": flagged.len(),
            "total_amount": total_amount,
            "flagged_amount": flagged_amount,
            "inflation_leakage": total_leakage,
            "entities_identified": entities.len(),
            "narrative": format!(
                "This forensic investigation analyzed {} transactions involving {} distinct entities, \
                 representing a total financial volume of {} {:.2}. The analysis identified {} suspicious \
                 transactions totaling {} {:.2}, which warrant further investigation for potential \
                 financial misconduct.",
                transactions.len(),
                entities.len(),
                DEFAULT_CURRENCY,
                total_amount,
                flagged.len(),
                DEFAULT_CURRENCY,
                flagged_amount,
            ),
        });

        let findings: Vec<Value> = flagged
            .iter()
            .map(|t| {
                json!({
                    "transaction_id": t.id,
                    "receiver": t.receiver,
                    "amount": t.actual_amount,
                    "delta_inflation": t.delta_inflation,
                    "status": t.status.as_str(),
                    "aml_stage": t.aml_stage.map(|s| s.as_str()),
                    "risk_score": t.risk_score,
                    "mens_rea": t.mens_rea_description,
                })
            })
            .collect();

        let ledger: Vec<Value> = transactions
            .iter()
            .take(LEDGER_ROW_CAP)
            .map(|t| {
                json!({
                    "id": t.id,
                    "date": t.effective_date().to_rfc3339(),
                    "sender": t.sender,
                    "receiver": t.receiver,
                    "proposed": t.proposed_amount,
                    "actual": t.actual_amount,
                    "category": t.category.as_str(),
                    "status": t.status.as_str(),
                })
            })
            .collect();

        let mut risk_ranked = entities;
        risk_ranked.sort_by(|a, b| {
            b.risk_score.partial_cmp(&a.risk_score).unwrap_or(std::cmp::Ordering::Equal)
        });
        let entity_registry: Vec<Value> = risk_ranked
            .iter()
            .map(|e| {
                json!({
                    "id": e.id,
                    "name": e.name,
                    "type": e.entity_type.as_str(),
                    "risk_score": e.risk_score,
                    "aliases": e.aliases(),
                    "watchlisted": e.is_watchlisted,
                })
            })
            .collect();

        let exhibits: Vec<Value> = match case_id {
            Some(case_id) => self
                .store
                .list_exhibits(case_id)?
                .iter()
                .map(|e| {
                    json!({
                        "id": e.id,
                        "evidence_type": e.evidence_type,
                        "evidence_id": e.evidence_id,
                        "label": e.label,
                        "verdict": e.verdict.as_str(),
                        "hash_signature": e.hash_signature,
                    })
                })
                .collect(),
            None => Vec::new(),
        };

        // Audit trail for the flagged rows: every chain entry, verifiable by
        // recomputation.
        let mut audit_trail: Vec<Value> = Vec::new();
        for t in &flagged {
            for entry in AuditLogger::entries_for(&self.store, &t.id)? {
                audit_trail.push(json!({
                    "entity_id": entry.entity_id,
                    "action": entry.action,
                    "field": entry.field_name,
                    "old": entry.old_value,
                    "new": entry.new_value,
                    "reason": entry.change_reason,
                    "hash_signature": entry.hash_signature,
                    "previous_hash": entry.previous_hash,
                    "timestamp": entry.timestamp.to_rfc3339(),
                }));
            }
        }

        let document = json!({
            "dossier_version": 1,
            "project": {
                "id": project.id,
                "name": project.name,
                "code": project.code,
                "contractor": project.contractor_name,
                "contract_value": project.contract_value,
            },
            "case_id": case_id,
            "generated_at": generated_at.to_rfc3339(),
            "sections": {
                "executive_summary": executive_summary,
                "forensic_findings": findings,
                "transaction_ledger": ledger,
                "ledger_truncated": transactions.len() > LEDGER_ROW_CAP,
                "entity_registry": entity_registry,
                "exhibits": exhibits,
                "audit_trail": audit_trail,
                "methodology": METHODOLOGY,
            },
        });

        Ok(Dossier {
            project_id: project_id.to_string(),
            case_id: case_id.map(String::from),
            generated_at,
            document,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (DossierCompiler, ForensicStore, Project) {
        let store = ForensicStore::open_in_memory().unwrap();
        let project = Project::new("Jembatan", "CTR-D1", 1_000_000_000.0, "PT Kontraktor");
        store.insert_project(&project).unwrap();
        (DossierCompiler::new(store.clone()), store, project)
    }

    #[test]
    fn summary_metrics_reflect_store_state() {
        let (compiler, store, project) = setup();
        let mut flagged = Transaction::new(&project.id, 7_550_000.0, 5_250_000.0, "A", "B");
        flagged.status = TransactionStatus::Flagged;
        flagged.delta_inflation = 2_300_000.0;
        store.insert_transaction(&flagged).unwrap();
        let clean = Transaction::new(&project.id, 0.0, 1_000_000.0, "A", "C");
        store.insert_transaction(&clean).unwrap();

        let dossier = compiler.compile(&project.id, None).unwrap();
        let summary = &dossier.document["sections"]["executive_summary"];
        assert_eq!(summary["total_transactions"], 2);
        assert_eq!(summary["flagged_transactions"], 1);
        assert_eq!(summary["inflation_leakage"], 2_300_000.0);
        assert_eq!(dossier.document["sections"]["forensic_findings"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn case_scope_embeds_exhibits() {
        let (compiler, store, project) = setup();
        let case = Case::new(&project.id, "Leakage", "probe");
        store.insert_case(&case).unwrap();
        let mut exhibit = CaseExhibit::new(&case.id, "transaction", "tx-1", "Invoice");
        exhibit.hash_signature = "deadbeef".into();
        store.insert_exhibit(&exhibit).unwrap();

        let dossier = compiler.compile(&project.id, Some(&case.id)).unwrap();
        let exhibits = dossier.document["sections"]["exhibits"].as_array().unwrap();
        assert_eq!(exhibits.len(), 1);
        assert_eq!(exhibits[0]["hash_signature"], "deadbeef");
    }

    #[test]
    fn canonical_bytes_hash_is_stable_for_same_document() {
        let (compiler, _, project) = setup();
        let dossier = compiler.compile(&project.id, None).unwrap();
        let a = crate::integrity::IntegrityRegistry::hash_bytes(&dossier.canonical_bytes());
        let b = crate::integrity::IntegrityRegistry::hash_bytes(&dossier.canonical_bytes());
        assert_eq!(a, b);
    }

    #[test]
    fn missing_project_is_not_found() {
        let (compiler, _, _) = setup();
        assert!(compiler.compile("nope", None).is_err());
    }
}
