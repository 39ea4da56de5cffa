//! Matching utilities for forensic transaction reconciliation: reference
//! extraction, vendor similarity, clearing channels and the multi-factor
//! confidence score.

use crate::fuzzy;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    /// Common invoice patterns in Indonesian/English contexts.
    static ref INVOICE_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"INV[-_#\s]*(\d{4,})").unwrap(),
        Regex::new(r"INVOICE[-_#\s]*(\d{4,})").unwrap(),
        Regex::new(r"NO[-_.\s]*(\d{4,})").unwrap(),
        Regex::new(r"REF[-_#\s]*(\d{4,})").unwrap(),
        Regex::new(r"TRF[-_#\s]*(\d{4,})").unwrap(),
        Regex::new(r"KWITANSI[-_#\s]*(\d{4,})").unwrap(),
        Regex::new(r"SPK[-_#\s]*(\d{4,})").unwrap(),
        Regex::new(r"PO[-_#\s]*(\d{4,})").unwrap(),
    ];

    static ref BATCH_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"BATCH[-_#\s]*(\d+)").unwrap(),
        Regex::new(r"PAYROLL[-_#\s]*(\d+)").unwrap(),
        Regex::new(r"PAYMENT[-_#\s]*GROUP[-_#\s]*(\d+)").unwrap(),
        Regex::new(r"GIRO[-_#\s]*(\d+)").unwrap(),
        Regex::new(r"CEK[-_#\s]*(\d+)").unwrap(),
    ];

    static ref LEGAL_TERM: Regex = Regex::new(r"\b(PT|CV|UD|TBK|LTD|INC|CORP)\.?\b").unwrap();
    static ref NON_WORD: Regex = Regex::new(r"[^\w\s]").unwrap();
}

/// Extract the most likely invoice/reference number from text, normalized to
/// `REF000123`.
pub fn extract_invoice_ref(text: &str) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    let upper = text.to_uppercase();
    for pattern in INVOICE_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(&upper) {
            let digits = caps.get(1)?.as_str();
            return Some(format!("REF{:0>6}", digits));
        }
    }
    None
}

/// Extract a batch/group payment identifier, normalized to `BATCH123`.
pub fn extract_batch_ref(description: &str) -> Option<String> {
    if description.is_empty() {
        return None;
    }
    let upper = description.to_uppercase();
    for pattern in BATCH_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(&upper) {
            return Some(format!("BATCH{}", caps.get(1)?.as_str()));
        }
    }
    None
}

/// All identifiable references from one description.
#[derive(Debug, Clone, Default)]
pub struct ExtractedReferences {
    pub invoice_ref: Option<String>,
    pub batch_ref: Option<String>,
}

pub fn extract_all_references(description: &str) -> ExtractedReferences {
    ExtractedReferences {
        invoice_ref: extract_invoice_ref(description),
        batch_ref: extract_batch_ref(description),
    }
}

/// Normalize a vendor name: strip legal suffixes, drop punctuation, collapse
/// whitespace, uppercase.
pub fn normalize_vendor_name(name: &str) -> String {
    if name.is_empty() {
        return String::new();
    }
    let upper = name.to_uppercase();
    let without_legal = LEGAL_TERM.replace_all(&upper, "");
    let without_punct = NON_WORD.replace_all(&without_legal, "");
    without_punct.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Vendor similarity in 0-100: max of simple, partial and token-sort ratios
/// over normalized names. 100.0 on exact normalized equality.
pub fn vendor_similarity(name1: &str, name2: &str) -> f64 {
    if name1.is_empty() || name2.is_empty() {
        return 0.0;
    }
    let a = normalize_vendor_name(name1);
    let b = normalize_vendor_name(name2);
    if a == b {
        return 100.0;
    }
    fuzzy::simple_ratio(&a, &b)
        .max(fuzzy::partial_ratio(&a, &b))
        .max(fuzzy::token_sort_ratio(&a, &b))
}

/// Clearing channel inferred from a bank description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClearingChannel {
    Rtgs,
    BiFast,
    Atm,
    Check,
    International,
    Unknown,
}

impl ClearingChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClearingChannel::Rtgs => "RTGS",
            ClearingChannel::BiFast => "BI_FAST",
            ClearingChannel::Atm => "ATM",
            ClearingChannel::Check => "CHECK",
            ClearingChannel::International => "INT",
            ClearingChannel::Unknown => "UNKNOWN",
        }
    }

    /// Clearing window in days; `UNKNOWN` falls back to the project default.
    pub fn window_days(&self, default_days: i64) -> i64 {
        match self {
            ClearingChannel::Rtgs | ClearingChannel::BiFast => 1,
            ClearingChannel::Atm => 2,
            ClearingChannel::Check => 7,
            ClearingChannel::International => 14,
            ClearingChannel::Unknown => default_days,
        }
    }
}

pub fn detect_channel(description: &str) -> ClearingChannel {
    let d = description.to_uppercase();
    if ["RTGS", "SKN", "KLIRING"].iter().any(|m| d.contains(m)) {
        return ClearingChannel::Rtgs;
    }
    if ["BI-FAST", "BI FAST", "BIF"].iter().any(|m| d.contains(m)) {
        return ClearingChannel::BiFast;
    }
    if ["ATM", "TARIK TUNAI", "CDM"].iter().any(|m| d.contains(m)) {
        return ClearingChannel::Atm;
    }
    if ["CEK", "GIRO", "BG"].iter().any(|m| d.contains(m)) {
        return ClearingChannel::Check;
    }
    if ["USD", "EUR", "SWIFT", "TT", "VALAS"].iter().any(|m| d.contains(m)) {
        return ClearingChannel::International;
    }
    ClearingChannel::Unknown
}

/// Confidence bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfidenceTier {
    Tier1Perfect,
    Tier2Strong,
    Tier3Probable,
    Tier4Weak,
}

impl ConfidenceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceTier::Tier1Perfect => "TIER_1_PERFECT",
            ConfidenceTier::Tier2Strong => "TIER_2_STRONG",
            ConfidenceTier::Tier3Probable => "TIER_3_PROBABLE",
            ConfidenceTier::Tier4Weak => "TIER_4_WEAK",
        }
    }

    pub fn from_score(score: f64) -> Self {
        if score >= 0.95 {
            ConfidenceTier::Tier1Perfect
        } else if score >= 0.85 {
            ConfidenceTier::Tier2Strong
        } else if score >= 0.70 {
            ConfidenceTier::Tier3Probable
        } else {
            ConfidenceTier::Tier4Weak
        }
    }
}

/// Auto-confirmation decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoGate {
    AutoOk,
    Review,
    Investigate,
}

impl AutoGate {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoGate::AutoOk => "AUTO_OK",
            AutoGate::Review => "REVIEW",
            AutoGate::Investigate => "INVESTIGATE",
        }
    }

    /// Gate from tier and the ledger row's risk score.
    pub fn decide(tier: ConfidenceTier, risk_score: f64) -> Self {
        match tier {
            ConfidenceTier::Tier1Perfect => AutoGate::AutoOk,
            ConfidenceTier::Tier2Strong if risk_score < 0.3 => AutoGate::AutoOk,
            ConfidenceTier::Tier3Probable => AutoGate::Review,
            _ => AutoGate::Investigate,
        }
    }
}

/// Inputs to the multi-factor confidence score.
#[derive(Debug, Clone, Default)]
pub struct ConfidenceFactors {
    pub amount_similarity: f64,
    pub temporal_proximity_days: f64,
    pub vendor_similarity: f64,
    pub semantic_similarity: f64,
    pub invoice_match: bool,
    pub batch_match: bool,
    pub risk_score: f64,
    pub is_direct: bool,
}

/// Multi-factor confidence:
/// 40% amount, 20% temporal, 10% vendor, 5% semantic, +10% invoice match,
/// +15% batch match, +5% direct, minus up to 10% risk penalty. Clamped to
/// [0,1].
pub fn confidence(factors: &ConfidenceFactors) -> (f64, ConfidenceTier) {
    let mut score = 0.40 * factors.amount_similarity;

    let temporal_score = if factors.temporal_proximity_days <= 1.0 {
        1.0
    } else if factors.temporal_proximity_days <= 3.0 {
        0.9
    } else if factors.temporal_proximity_days <= 7.0 {
        0.7
    } else if factors.temporal_proximity_days <= 14.0 {
        0.4
    } else {
        0.2
    };
    score += 0.20 * temporal_score;

    if factors.vendor_similarity > 0.0 {
        score += 0.10 * (factors.vendor_similarity / 100.0);
    }
    if factors.semantic_similarity > 0.0 {
        score += 0.05 * (factors.semantic_similarity / 100.0);
    }
    if factors.invoice_match {
        score += 0.10;
    }
    if factors.batch_match {
        score += 0.15;
    }
    if factors.is_direct {
        score += 0.05;
    }
    score -= (0.10f64).min(factors.risk_score * 0.10);

    let score = score.clamp(0.0, 1.0);
    (score, ConfidenceTier::from_score(score))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoice_refs_normalize() {
        assert_eq!(extract_invoice_ref("INV-2024-001234"), Some("REF001234".to_string()));
        assert_eq!(extract_invoice_ref("pembayaran KWITANSI 5521"), Some("REF005521".to_string()));
        assert_eq!(extract_invoice_ref("NO. 042"), None); // under 4 digits
        assert_eq!(extract_invoice_ref("NO. 00423"), Some("REF000423".to_string()));
        assert_eq!(extract_invoice_ref(""), None);
    }

    #[test]
    fn invoice_ref_pads_to_six() {
        assert_eq!(extract_invoice_ref("REF 1234"), Some("REF001234".to_string()));
    }

    #[test]
    fn batch_refs_extract() {
        assert_eq!(extract_batch_ref("PAYROLL 88 April"), Some("BATCH88".to_string()));
        assert_eq!(extract_batch_ref("GIRO#5120"), Some("BATCH5120".to_string()));
        assert_eq!(extract_batch_ref("transfer biasa"), None);
    }

    #[test]
    fn vendor_normalization_strips_legal_forms() {
        assert_eq!(normalize_vendor_name("PT. Semen Indonesia, Tbk"), "SEMEN INDONESIA");
        assert_eq!(normalize_vendor_name("CV Batu-Alam  Jaya"), "BATUALAM JAYA");
    }

    #[test]
    fn vendor_similarity_handles_aliases() {
        let score = vendor_similarity("PT. SEMEN INDONESIA", "TRF PT SEMEN INDONESIA");
        assert!(score >= 95.0, "got {score}");
        assert_eq!(vendor_similarity("PT Semen Indonesia", "PT. SEMEN INDONESIA"), 100.0);
    }

    #[test]
    fn channel_detection_and_windows() {
        assert_eq!(detect_channel("RTGS TRANSFER"), ClearingChannel::Rtgs);
        assert_eq!(detect_channel("via BI-FAST"), ClearingChannel::BiFast);
        assert_eq!(detect_channel("TARIK TUNAI ATM"), ClearingChannel::Atm);
        assert_eq!(detect_channel("BG 1231"), ClearingChannel::Check);
        assert_eq!(detect_channel("SWIFT USD"), ClearingChannel::International);
        assert_eq!(detect_channel("transfer antar rekening"), ClearingChannel::Unknown);

        assert_eq!(ClearingChannel::Rtgs.window_days(7), 1);
        assert_eq!(ClearingChannel::Atm.window_days(7), 2);
        assert_eq!(ClearingChannel::Check.window_days(3), 7);
        assert_eq!(ClearingChannel::International.window_days(7), 14);
        assert_eq!(ClearingChannel::Unknown.window_days(9), 9);
    }

    #[test]
    fn tier_boundaries() {
        assert_eq!(ConfidenceTier::from_score(0.95), ConfidenceTier::Tier1Perfect);
        assert_eq!(ConfidenceTier::from_score(0.85), ConfidenceTier::Tier2Strong);
        assert_eq!(ConfidenceTier::from_score(0.8499), ConfidenceTier::Tier3Probable);
        assert_eq!(ConfidenceTier::from_score(0.70), ConfidenceTier::Tier3Probable);
        assert_eq!(ConfidenceTier::from_score(0.6999), ConfidenceTier::Tier4Weak);
    }

    #[test]
    fn gate_decisions() {
        assert_eq!(AutoGate::decide(ConfidenceTier::Tier1Perfect, 0.9), AutoGate::AutoOk);
        assert_eq!(AutoGate::decide(ConfidenceTier::Tier2Strong, 0.1), AutoGate::AutoOk);
        assert_eq!(AutoGate::decide(ConfidenceTier::Tier2Strong, 0.5), AutoGate::Investigate);
        assert_eq!(AutoGate::decide(ConfidenceTier::Tier3Probable, 0.0), AutoGate::Review);
        assert_eq!(AutoGate::decide(ConfidenceTier::Tier4Weak, 0.0), AutoGate::Investigate);
    }

    #[test]
    fn perfect_direct_match_reaches_tier_one() {
        let (score, tier) = confidence(&ConfidenceFactors {
            amount_similarity: 1.0,
            temporal_proximity_days: 1.0,
            vendor_similarity: 100.0,
            semantic_similarity: 90.0,
            invoice_match: true,
            batch_match: false,
            risk_score: 0.0,
            is_direct: true,
        });
        assert!(score >= 0.95, "got {score}");
        assert_eq!(tier, ConfidenceTier::Tier1Perfect);
    }

    #[test]
    fn risk_penalty_caps_at_ten_percent() {
        let base = ConfidenceFactors {
            amount_similarity: 1.0,
            temporal_proximity_days: 1.0,
            is_direct: true,
            ..Default::default()
        };
        let (clean, _) = confidence(&base);
        let (risky, _) = confidence(&ConfidenceFactors { risk_score: 5.0, ..base.clone() });
        assert!((clean - risky - 0.10).abs() < 1e-9);
    }

    #[test]
    fn temporal_decay_steps() {
        let factors = |days: f64| ConfidenceFactors {
            amount_similarity: 0.0,
            temporal_proximity_days: days,
            ..Default::default()
        };
        let (d1, _) = confidence(&factors(1.0));
        let (d3, _) = confidence(&factors(3.0));
        let (d7, _) = confidence(&factors(7.0));
        let (d14, _) = confidence(&factors(14.0));
        let (d30, _) = confidence(&factors(30.0));
        assert!((d1 - 0.20).abs() < 1e-9);
        assert!((d3 - 0.18).abs() < 1e-9);
        assert!((d7 - 0.14).abs() < 1e-9);
        assert!((d14 - 0.08).abs() < 1e-9);
        assert!((d30 - 0.04).abs() < 1e-9);
    }
}
