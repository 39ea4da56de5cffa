//! Parallel fraud heuristic producing the per-row risk score.
//!
//! Keyword batteries are tuned for the Indonesian construction-audit corpus
//! this engine grew up on; they are additive signals, each with a fixed
//! weight, clamped to 1.0.

use crate::models::{Transaction, TransactionCategory};

pub const PERSONAL_KEYWORDS: &[&str] = &[
    "Tokopedia",
    "Shopee",
    "OVO",
    "Gopay",
    "Spotify",
    "Zara",
    "Poshboy",
    "Guardian",
    "Beer",
    "Bir",
    "Makan",
    "Resto",
    "Kopitiam",
    "PLN",
    "BPJS",
    "Telkomsel",
];

pub const FAMILY_ALIASES: &[&str] = &["Faldi", "Sandi", "Ema", "Mama", "Clivord"];

const REDACTION_MARKERS: &[&str] = &["tipex", "ti-pex", "redacted"];

const BASE_RISK: f64 = 0.05;
const REDACTION_WEIGHT: f64 = 0.4;
const PERSONAL_WEIGHT: f64 = 0.3;
const FAMILY_WEIGHT: f64 = 0.5;
const MISCLASSIFICATION_WEIGHT: f64 = 0.2;

#[derive(Debug, Clone, Default)]
pub struct FraudAssessment {
    pub risk_score: f64,
    pub alerts: Vec<String>,
    pub is_redacted: bool,
    pub potential_misappropriation: bool,
    pub mens_rea: Vec<String>,
}

/// Score one transaction. Mutates the redaction/misappropriation flags on the
/// row; status decisions are the trigger engine's job.
pub fn assess(tx: &mut Transaction) -> FraudAssessment {
    let mut out = FraudAssessment { risk_score: BASE_RISK, ..Default::default() };
    let desc = tx.description.clone().unwrap_or_default();
    let desc_lower = desc.to_lowercase();
    let receiver_lower = tx.receiver.to_lowercase();

    // 1. Concealment via redaction
    if REDACTION_MARKERS.iter().any(|m| desc_lower.contains(m)) {
        tx.is_redacted = true;
        out.is_redacted = true;
        out.risk_score += REDACTION_WEIGHT;
        out.alerts.push("Concealment via Redaction (Tipex)".to_string());
        out.mens_rea.push("Intentional concealment of beneficial owner".to_string());
    }

    // 2. Personal consumption in the description
    let mut is_personal = false;
    if PERSONAL_KEYWORDS.iter().any(|kw| desc_lower.contains(&kw.to_lowercase())) {
        is_personal = true;
        out.risk_score += PERSONAL_WEIGHT;
        out.alerts.push("Personal consumption detected in description".to_string());
        out.mens_rea.push("Use of project funds for personal lifestyle".to_string());
    }

    // 3. Family funneling
    if FAMILY_ALIASES.iter().any(|alias| receiver_lower.contains(&alias.to_lowercase())) {
        is_personal = true;
        out.risk_score += FAMILY_WEIGHT;
        out.alerts.push(format!("Unjustified beneficiary: Family member ({})", tx.receiver));
        out.mens_rea.push("Systematic funneling of funds to family aliases".to_string());
    }

    // 4. Classification fraud: personal spend disguised as business operation
    if matches!(tx.category, TransactionCategory::F | TransactionCategory::P) && is_personal {
        out.risk_score += MISCLASSIFICATION_WEIGHT;
        out.alerts
            .push("High Intent: Personal expense disguised as business operation".to_string());
        out.mens_rea.push("Deliberate misclassification of personal expenses".to_string());
    }

    tx.potential_misappropriation = tx.potential_misappropriation || is_personal;
    out.potential_misappropriation = is_personal;
    out.risk_score = out.risk_score.min(1.0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(desc: &str, receiver: &str) -> Transaction {
        Transaction::new("p1", 0.0, 1_000_000.0, "Kontraktor", receiver).with_description(desc)
    }

    #[test]
    fn clean_row_keeps_base_risk() {
        let mut t = tx("Pembelian semen 50 sak", "PT Semen Indonesia");
        let a = assess(&mut t);
        assert!((a.risk_score - 0.05).abs() < 1e-9);
        assert!(a.alerts.is_empty());
    }

    #[test]
    fn redaction_adds_weight_and_flag() {
        let mut t = tx("Pembayaran TIPEX vendor", "PT X");
        let a = assess(&mut t);
        assert!(t.is_redacted);
        assert!((a.risk_score - 0.45).abs() < 1e-9);
    }

    #[test]
    fn family_alias_plus_personal_keyword_stacks() {
        let mut t = tx("Belanja Tokopedia", "Rek Sandi");
        let a = assess(&mut t);
        // base + personal + family + misclassification (category P)
        assert!((a.risk_score - (0.05 + 0.3 + 0.5 + 0.2)).abs() < 1e-9);
        assert!(t.potential_misappropriation);
    }

    #[test]
    fn risk_clamps_at_one() {
        let mut t = tx("tipex Tokopedia Shopee Makan", "Mama Ema");
        let a = assess(&mut t);
        assert!((a.risk_score - 1.0).abs() < 1e-9);
    }
}
