//! Per-row forensic rule battery.
//!
//! `evaluate` runs ten ordered rules over a transaction, mutating its flags,
//! status, AML stage and risk score, and returning the fired trigger texts.
//! Rule handlers never bail out: a failed lookup degrades that rule (logged,
//! skipped) and evaluation continues.
//!
//! AML-stage precedence is PLACEMENT < LAYERING < INTEGRATION; a later rule
//! only raises the stage.

pub mod fraud;

use crate::errors::EngineResult;
use crate::events::{EventBus, EventKind};
use crate::fuzzy;
use crate::geo;
use crate::models::{
    AmlStage, Project, Transaction, TransactionCategory, TransactionStatus,
};
use crate::store::ForensicStore;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

const PERSONAL_LEAKAGE_KEYWORDS: &[&str] =
    &["KELUARGA", "PRIBADI", "LORLUN", "SAUDARA", "REK SENDIRI"];
const EVIDENCE_GAP_KEYWORDS: &[&str] = &["BUTUH BUKTI", "TIDAK ADA KWITANSI", "CEK PENGGUNAAN"];

const DUPLICATE_WINDOW_HOURS: i64 = 48;
const DUPLICATE_SIMILARITY_MIN: f64 = 85.0;
const DUPLICATE_AMOUNT_TOLERANCE: f64 = 0.05;
const VELOCITY_WINDOW_HOURS: i64 = 24;
const VELOCITY_MIN_PEERS: usize = 3;
const CASH_CHANNEL_THRESHOLD: f64 = 100_000_000.0;
const STRUCTURING_LO: f64 = 90_000_000.0;
const STRUCTURING_HI: f64 = 100_000_000.0;
const GEO_THRESHOLD_KM: f64 = 50.0;
const RECIDIVISM_MIN_RISK: f64 = 0.5;
const FLAG_RISK_THRESHOLD: f64 = 0.5;

/// Result of a trigger evaluation.
#[derive(Debug, Clone)]
pub struct TriggerOutcome {
    pub triggers: Vec<String>,
    pub risk_score: f64,
    pub status: TransactionStatus,
    pub aml_stage: Option<AmlStage>,
}

pub struct TriggerEngine {
    store: ForensicStore,
    bus: Arc<EventBus>,
}

impl TriggerEngine {
    pub fn new(store: ForensicStore, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    /// Run the full battery against one row. Mutates the row in place and
    /// returns the outcome; persisting is the caller's job.
    pub fn evaluate(&self, tx: &mut Transaction) -> TriggerOutcome {
        let mut triggers: Vec<String> = Vec::new();

        // Parallel fraud heuristic: scored against the row as ingested,
        // before any rule rewrites category or flags.
        let assessment = fraud::assess(tx);
        tx.risk_score = assessment.risk_score;

        // The inflation delta is an invariant of every evaluated row, fired
        // rule or not.
        tx.delta_inflation = (tx.proposed_amount - tx.actual_amount).max(0.0);

        // 1. Inflation (Penggelembungan)
        if tx.proposed_amount > tx.actual_amount {
            triggers.push(format!("Penggelembungan: {:.0} IDR variance", tx.delta_inflation));
            tx.status = TransactionStatus::Flagged;
            tx.aml_stage = AmlStage::escalate(tx.aml_stage, AmlStage::Placement);
        }

        // 2. Evidence gap: entry is locked until proof is provided
        let comment_upper = tx.audit_comment.clone().unwrap_or_default().to_uppercase();
        if EVIDENCE_GAP_KEYWORDS.iter().any(|kw| comment_upper.contains(kw)) {
            tx.needs_proof = true;
            tx.status = TransactionStatus::Locked;
            triggers.push("Evidence Gap: Entry is locked until proof is provided.".to_string());
            tx.aml_stage = AmlStage::escalate(tx.aml_stage, AmlStage::Placement);
        }

        // 3. Personal leakage quarantine (XP)
        let desc_upper = tx.description.clone().unwrap_or_default().to_uppercase();
        let personal_hit = tx.category == TransactionCategory::XP
            || PERSONAL_LEAKAGE_KEYWORDS.iter().any(|kw| desc_upper.contains(kw))
            || PERSONAL_LEAKAGE_KEYWORDS.iter().any(|kw| comment_upper.contains(kw));
        if personal_hit {
            tx.potential_misappropriation = true;
            tx.category = TransactionCategory::XP;
            triggers.push("Personal Leakage: Quarantined from Project P&L.".to_string());
            tx.aml_stage = AmlStage::escalate(tx.aml_stage, AmlStage::Placement);
        }

        // 4. Fabricated entries ("Ngarang")
        if comment_upper.contains("NGARANG") {
            tx.status = TransactionStatus::Flagged;
            triggers.push("Forensic Red Flag: Entry marked as 'Ngarang' (Invented).".to_string());
            tx.aml_stage = AmlStage::escalate(tx.aml_stage, AmlStage::Layering);
        }

        // 5. Fuzzy duplicate detection
        if let Err(err) = self.rule_fuzzy_duplicate(tx, &mut triggers) {
            warn!(rule = "fuzzy_duplicate", %err, "Trigger rule degraded");
        }

        // 6. Velocity
        if let Err(err) = self.rule_velocity(tx, &mut triggers) {
            warn!(rule = "velocity", %err, "Trigger rule degraded");
        }

        // 7. Channel risk: large cash movements
        if (desc_upper.contains("CASH") || desc_upper.contains("TUNAI"))
            && tx.actual_amount > CASH_CHANNEL_THRESHOLD
        {
            tx.status = TransactionStatus::Flagged;
            tx.aml_stage = AmlStage::escalate(tx.aml_stage, AmlStage::Placement);
            triggers.push(format!(
                "Channel Risk: Large CASH transaction ({:.0} IDR).",
                tx.actual_amount
            ));
        }

        // 8. Structuring: amounts hugging the reporting threshold. Annotation
        // only, no forced status. Half-open window [90M, 100M).
        if tx.actual_amount >= STRUCTURING_LO && tx.actual_amount < STRUCTURING_HI {
            triggers.push(
                "Structuring Risk: Amount is suspiciously close to 100M reporting threshold."
                    .to_string(),
            );
        }

        // 9. Geographic proximity
        if let Err(err) = self.rule_geographic(tx, &mut triggers) {
            warn!(rule = "geographic", %err, "Trigger rule degraded");
        }

        // 10. Global recidivism
        if let Err(err) = self.rule_recidivism(tx, &mut triggers) {
            warn!(rule = "recidivism", %err, "Trigger rule degraded");
        }

        for note in &assessment.mens_rea {
            tx.append_mens_rea(note);
        }
        if assessment.risk_score >= FLAG_RISK_THRESHOLD && !assessment.alerts.is_empty() {
            self.bus.publish_with(
                EventKind::CorrelationFound,
                json!({
                    "correlation_type": "FraudDetection",
                    "transaction_id": tx.id,
                    "risk_score": assessment.risk_score,
                    "alerts": assessment.alerts,
                    "aml_stage": tx.aml_stage.map(|s| s.as_str()),
                }),
                None,
                tx.project_id.clone(),
            );
        }

        // Final status: flagged iff risk crosses the threshold or a rule
        // already flagged/locked the row. Locked is never downgraded.
        if tx.risk_score >= FLAG_RISK_THRESHOLD && tx.status == TransactionStatus::Pending {
            tx.status = TransactionStatus::Flagged;
        }

        for trigger in &triggers {
            tx.append_mens_rea(trigger);
        }

        TriggerOutcome {
            triggers,
            risk_score: tx.risk_score,
            status: tx.status,
            aml_stage: tx.aml_stage,
        }
    }

    fn rule_fuzzy_duplicate(&self, tx: &mut Transaction, triggers: &mut Vec<String>) -> EngineResult<()> {
        let desc = match &tx.description {
            Some(d) if !d.is_empty() => d.clone(),
            _ => return Ok(()),
        };
        let nearby =
            self.store.transactions_in_window(tx.timestamp, DUPLICATE_WINDOW_HOURS, &tx.id)?;
        for other in nearby {
            let other_desc = match &other.description {
                Some(d) if !d.is_empty() => d,
                _ => continue,
            };
            let similarity =
                fuzzy::token_set_ratio(&desc.to_lowercase(), &other_desc.to_lowercase());
            if similarity >= DUPLICATE_SIMILARITY_MIN {
                let amount_diff = (tx.actual_amount - other.actual_amount).abs();
                if amount_diff < tx.actual_amount * DUPLICATE_AMOUNT_TOLERANCE {
                    tx.status = TransactionStatus::Flagged;
                    tx.is_circular = true;
                    tx.aml_stage = AmlStage::escalate(tx.aml_stage, AmlStage::Layering);
                    triggers.push(format!(
                        "Potential Duplicate: {:.0}% match with '{}' ({:.0})",
                        similarity, other_desc, other.actual_amount
                    ));
                    break;
                }
            }
        }
        Ok(())
    }

    fn rule_velocity(&self, tx: &mut Transaction, triggers: &mut Vec<String>) -> EngineResult<()> {
        let receiver_upper = tx.receiver.to_uppercase();
        if tx.receiver.is_empty() || ["UNKNOWN", "CASH", "NA"].contains(&receiver_upper.as_str()) {
            return Ok(());
        }
        let cluster = self.store.transactions_to_receiver_in_window(
            &tx.receiver,
            tx.timestamp,
            VELOCITY_WINDOW_HOURS,
            &tx.id,
        )?;
        if cluster.len() >= VELOCITY_MIN_PEERS {
            tx.status = TransactionStatus::Flagged;
            tx.aml_stage = AmlStage::escalate(tx.aml_stage, AmlStage::Layering);
            triggers.push(format!(
                "Velocity Risk: {} transfers to '{}' in 48h period.",
                cluster.len() + 1,
                tx.receiver
            ));
        }
        Ok(())
    }

    fn rule_geographic(&self, tx: &mut Transaction, triggers: &mut Vec<String>) -> EngineResult<()> {
        let (tx_lat, tx_lon) = match (tx.latitude, tx.longitude) {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => return Ok(()),
        };
        let project_id = match &tx.project_id {
            Some(id) => id.clone(),
            None => return Ok(()),
        };
        let project: Project = match self.store.get_project(&project_id) {
            Ok(p) => p,
            Err(_) => return Ok(()),
        };
        let (site_lat, site_lon) = match (project.latitude, project.longitude) {
            (Some(lat), Some(lon)) => (lat, lon),
            _ => return Ok(()),
        };
        let distance = geo::haversine_km(tx_lat, tx_lon, site_lat, site_lon);
        if distance >= GEO_THRESHOLD_KM {
            tx.status = TransactionStatus::Flagged;
            tx.aml_stage = AmlStage::escalate(tx.aml_stage, AmlStage::Integration);
            triggers.push(format!(
                "Geographic Mismatch: Transaction at {:.1}km from Project Site '{}' (Limit: {:.0}km)",
                distance,
                project.site_location.as_deref().unwrap_or(&project.name),
                GEO_THRESHOLD_KM
            ));
        }
        Ok(())
    }

    fn rule_recidivism(&self, tx: &mut Transaction, triggers: &mut Vec<String>) -> EngineResult<()> {
        if tx.receiver.is_empty() {
            return Ok(());
        }
        let project_id = tx.project_id.clone().unwrap_or_default();
        let others =
            self.store.recidivist_projects(&tx.receiver, &project_id, RECIDIVISM_MIN_RISK)?;
        if !others.is_empty() {
            tx.status = TransactionStatus::Flagged;
            tx.aml_stage = AmlStage::escalate(tx.aml_stage, AmlStage::Integration);
            let shown: Vec<&str> = others.iter().take(2).map(|s| s.as_str()).collect();
            triggers.push(format!(
                "Global Risk: Recidivist Entity. Previous high-risk flags in projects: {}",
                shown.join(", ")
            ));
        }
        Ok(())
    }
}
