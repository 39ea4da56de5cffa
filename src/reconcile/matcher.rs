//! The reconciliation matcher: suggestion, confirmation, auto-confirmation.

use crate::errors::{EngineError, EngineResult};
use crate::events::{EventBus, EventKind};
use crate::models::*;
use crate::reconcile::currency::CurrencyService;
use crate::reconcile::intelligence::{
    self, AutoGate, ConfidenceFactors, ConfidenceTier,
};
use crate::reconcile::semantic::{cosine_similarity, SemanticService};
use crate::store::audit::{AuditLogger, ChangeRecord};
use crate::store::{ForensicStore, TransactionFilter};
use crate::triggers::TriggerEngine;
use rayon::prelude::*;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

const AMOUNT_EPSILON: f64 = 0.01;
const AGGREGATE_SUM_TOLERANCE: f64 = 1.0;
const AGGREGATE_CONFIDENCE: f64 = 0.9;
const PROPORTIONAL_CONFIDENCE: f64 = 0.9;
const PROPORTIONAL_REL_TOLERANCE: f64 = 0.001;
const FUZZY_VECTOR_MIN: f64 = 0.85;
const SEMANTIC_SHORT_CIRCUIT: f64 = 0.85;
const INVESTIGATE_VARIANCE_THRESHOLD: usize = 5;

/// Overhead ratios commonly separating a ledger voucher from the cleared
/// bank amount (VAT, PPh 23, combined, 2% markup).
const OVERHEAD_RATIOS: &[f64] = &[1.0, 1.11, 0.98, 1.09, 1.02];

/// Result of a suggestion sweep: the matches produced plus how many candidate
/// pairs were skipped due to per-pair errors.
#[derive(Debug, Clone, Default)]
pub struct SuggestOutcome {
    pub matches: Vec<ReconciliationMatch>,
    pub skipped_pairs: usize,
}

/// Result of an auto-confirmation pass.
#[derive(Debug, Clone, Default)]
pub struct AutoConfirmSummary {
    pub confirmed: usize,
    pub review: usize,
    pub investigate: usize,
}

pub struct ReconciliationMatcher {
    store: ForensicStore,
    bus: Arc<EventBus>,
    triggers: Arc<TriggerEngine>,
    currency: Arc<CurrencyService>,
    semantic: Arc<dyn SemanticService>,
}

impl ReconciliationMatcher {
    pub fn new(
        store: ForensicStore,
        bus: Arc<EventBus>,
        triggers: Arc<TriggerEngine>,
        currency: Arc<CurrencyService>,
        semantic: Arc<dyn SemanticService>,
    ) -> Self {
        Self { store, bus, triggers, currency, semantic }
    }

    /// Description similarity per the matching contract: exact (lowercased)
    /// equality scores 1.0, a strong token-sort score short-circuits, and
    /// only the remainder is delegated to the semantic service.
    fn description_similarity(&self, a: &str, b: &str) -> f64 {
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        if a.to_lowercase() == b.to_lowercase() {
            return 1.0;
        }
        let token_sort = crate::fuzzy::token_sort_ratio(&a.to_lowercase(), &b.to_lowercase()) / 100.0;
        if token_sort >= SEMANTIC_SHORT_CIRCUIT {
            return token_sort;
        }
        self.semantic.similarity(a, b)
    }

    /// Produce and persist suggested matches for a project.
    pub fn suggest(&self, project_id: &str) -> EngineResult<SuggestOutcome> {
        let settings = self.store.settings_for(project_id)?;
        let internal = self.store.query_transactions(&TransactionFilter {
            project_id: Some(project_id.to_string()),
            statuses: vec![TransactionStatus::Pending, TransactionStatus::Flagged],
            ..Default::default()
        })?;
        let bank_rows = self.store.list_bank_transactions(project_id)?;

        let mut outcome = SuggestOutcome::default();
        let tolerance = settings.amount_tolerance_percent / 100.0;

        for bank in &bank_rows {
            let channel = intelligence::detect_channel(&bank.description);
            let window_days = channel.window_days(settings.clearing_window_days);

            // Direct pairing: scoring is pure, so the candidate sweep runs in
            // parallel; persistence stays sequential.
            let scored: Vec<(usize, EngineResult<Option<ReconciliationMatch>>)> = internal
                .par_iter()
                .enumerate()
                .map(|(index, ledger)| {
                    (index, self.direct_pair(ledger, bank, window_days, tolerance, channel.as_str()))
                })
                .collect();
            for (index, pair) in scored {
                match pair {
                    Ok(Some(m)) => outcome.matches.push(self.store.upsert_match(&m)?),
                    Ok(None) => {}
                    Err(err) => {
                        outcome.skipped_pairs += 1;
                        warn!(ledger = %internal[index].id, bank = %bank.id, %err, "Pair skipped");
                    }
                }
            }

            // Aggregate pairing (minimal money-flow): greedy V/P/F accumulation
            match self.aggregate_group(&internal, bank, settings.batch_window_days) {
                Ok(group_matches) => {
                    for m in group_matches {
                        outcome.matches.push(self.store.upsert_match(&m)?);
                    }
                }
                Err(err) => {
                    outcome.skipped_pairs += 1;
                    warn!(bank = %bank.id, %err, "Aggregate pass skipped");
                }
            }
        }

        // Proportional and vector passes only consider still-unmatched rows.
        for ledger in &internal {
            if self.store.has_internal_match(&ledger.id)? {
                continue;
            }
            match self.proportional_pair(ledger, &bank_rows) {
                Ok(Some(m)) => outcome.matches.push(self.store.upsert_match(&m)?),
                Ok(None) => {}
                Err(err) => {
                    outcome.skipped_pairs += 1;
                    warn!(ledger = %ledger.id, %err, "Proportional pass skipped");
                }
            }
        }
        for ledger in &internal {
            if self.store.has_internal_match(&ledger.id)? {
                continue;
            }
            match self.fuzzy_vector_pair(ledger, &bank_rows) {
                Ok(Some(m)) => outcome.matches.push(self.store.upsert_match(&m)?),
                Ok(None) => {}
                Err(err) => {
                    outcome.skipped_pairs += 1;
                    warn!(ledger = %ledger.id, %err, "Vector pass skipped");
                }
            }
        }

        info!(
            project = project_id,
            matches = outcome.matches.len(),
            skipped = outcome.skipped_pairs,
            "🔍 Reconciliation suggestions produced"
        );
        Ok(outcome)
    }

    fn direct_pair(
        &self,
        ledger: &Transaction,
        bank: &BankTransaction,
        window_days: i64,
        tolerance: f64,
        channel: &str,
    ) -> EngineResult<Option<ReconciliationMatch>> {
        // Multi-currency conversion into the ledger currency
        let bank_amount = if ledger.currency != bank.currency {
            self.currency.convert(bank.amount, &bank.currency, &ledger.currency)
        } else {
            bank.amount
        };

        let variance = (ledger.actual_amount - bank_amount).abs();
        let amount_ok = variance < AMOUNT_EPSILON
            || (ledger.actual_amount > 0.0 && variance / ledger.actual_amount < tolerance);
        if !amount_ok {
            return Ok(None);
        }

        let ledger_date = ledger.effective_date();
        let bank_date = bank.effective_date();
        let time_diff = (ledger_date - bank_date).abs();
        if time_diff > chrono::Duration::days(window_days) {
            return Ok(None);
        }
        let days = time_diff.num_days();

        let ledger_refs =
            intelligence::extract_all_references(ledger.description.as_deref().unwrap_or(""));
        let bank_refs = intelligence::extract_all_references(&bank.description);
        let invoice_match = matches!(
            (&ledger_refs.invoice_ref, &bank_refs.invoice_ref),
            (Some(a), Some(b)) if a == b
        );
        let batch_match = matches!(
            (&ledger.batch_reference, &bank.batch_reference),
            (Some(a), Some(b)) if a == b
        );

        let vendor_sim = if !ledger.receiver.is_empty() {
            intelligence::vendor_similarity(&ledger.receiver, &bank.description)
        } else {
            0.0
        };

        let amount_sim = if ledger.actual_amount > 0.0 {
            1.0 - (variance / ledger.actual_amount).min(1.0)
        } else if variance < AMOUNT_EPSILON {
            1.0
        } else {
            0.0
        };

        let semantic_sim = match &ledger.description {
            Some(desc) => self.description_similarity(desc, &bank.description) * 100.0,
            None => 0.0,
        };

        let (score, tier) = intelligence::confidence(&ConfidenceFactors {
            amount_similarity: amount_sim,
            temporal_proximity_days: days as f64,
            vendor_similarity: vendor_sim,
            semantic_similarity: semantic_sim,
            invoice_match,
            batch_match,
            risk_score: ledger.risk_score,
            is_direct: true,
        });
        let gate = AutoGate::decide(tier, ledger.risk_score);

        let mut reasoning = vec![
            format!("AmtΔ{:.0}", variance),
            format!("{}d (Window:{}d)", days, window_days),
            format!("Channel:{}", channel),
        ];
        if invoice_match {
            if let Some(invoice) = &ledger_refs.invoice_ref {
                reasoning.push(format!("INV:{}", invoice));
            }
        }
        if batch_match {
            if let Some(batch) = &ledger.batch_reference {
                reasoning.push(format!("BATCH:{}", batch));
            }
        }
        if vendor_sim > 80.0 {
            reasoning.push(format!("Vendor:{:.0}%", vendor_sim));
        }
        if semantic_sim > 80.0 {
            reasoning.push(format!("Semantic:{:.0}%", semantic_sim));
        }
        reasoning.push(tier.as_str().to_string());
        reasoning.push(gate.as_str().to_string());

        Ok(Some(
            ReconciliationMatch::new(&ledger.id, &bank.id, score, MatchType::Direct)
                .with_reasoning(reasoning.join(" | ")),
        ))
    }

    /// Greedy accumulation of V/P/F vouchers (largest first) toward one bank
    /// amount, within the batch window.
    fn aggregate_group(
        &self,
        internal: &[Transaction],
        bank: &BankTransaction,
        batch_window_days: i64,
    ) -> EngineResult<Vec<ReconciliationMatch>> {
        let bank_date = bank.effective_date();
        let mut vouchers: Vec<&Transaction> = internal
            .iter()
            .filter(|t| {
                matches!(
                    t.category,
                    TransactionCategory::V | TransactionCategory::P | TransactionCategory::F
                )
            })
            .filter(|t| {
                (t.effective_date() - bank_date).abs()
                    <= chrono::Duration::days(batch_window_days)
            })
            .collect();
        vouchers.sort_by(|a, b| {
            b.actual_amount
                .partial_cmp(&a.actual_amount)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut group: Vec<&Transaction> = Vec::new();
        let mut sum = 0.0;
        for voucher in vouchers {
            if sum + voucher.actual_amount <= bank.amount + AMOUNT_EPSILON {
                sum += voucher.actual_amount;
                group.push(voucher);
            }
            if (sum - bank.amount).abs() < AGGREGATE_SUM_TOLERANCE {
                let reasoning = format!(
                    "Matched as part of aggregate flow sum ({} items) to bank entry {}",
                    group.len(),
                    bank.id
                );
                return Ok(group
                    .iter()
                    .map(|t| {
                        ReconciliationMatch::new(
                            &t.id,
                            &bank.id,
                            AGGREGATE_CONFIDENCE,
                            MatchType::Aggregate,
                        )
                        .with_reasoning(reasoning.clone())
                    })
                    .collect());
            }
        }
        Ok(Vec::new())
    }

    /// Tax/fee striping: ledger amount equals bank amount times a standard
    /// overhead ratio.
    fn proportional_pair(
        &self,
        ledger: &Transaction,
        bank_rows: &[BankTransaction],
    ) -> EngineResult<Option<ReconciliationMatch>> {
        for bank in bank_rows {
            for ratio in OVERHEAD_RATIOS {
                let expected = bank.amount * ratio;
                if expected <= 0.0 {
                    continue;
                }
                let rel = (ledger.actual_amount - expected).abs() / expected;
                if rel < PROPORTIONAL_REL_TOLERANCE {
                    return Ok(Some(
                        ReconciliationMatch::new(
                            &ledger.id,
                            &bank.id,
                            PROPORTIONAL_CONFIDENCE,
                            MatchType::Proportional,
                        )
                        .with_reasoning(format!("Stripped overhead (ratio {})", ratio)),
                    ));
                }
            }
        }
        Ok(None)
    }

    /// Embedding cosine similarity over still-unmatched ledger rows.
    fn fuzzy_vector_pair(
        &self,
        ledger: &Transaction,
        bank_rows: &[BankTransaction],
    ) -> EngineResult<Option<ReconciliationMatch>> {
        let ledger_vec = match &ledger.embedding {
            Some(v) if !v.is_empty() => v,
            _ => return Ok(None),
        };
        let mut best: Option<(f64, &BankTransaction)> = None;
        for bank in bank_rows {
            if let Some(bank_vec) = &bank.embedding {
                let score = cosine_similarity(ledger_vec, bank_vec);
                if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                    best = Some((score, bank));
                }
            }
        }
        match best {
            Some((score, bank)) if score >= FUZZY_VECTOR_MIN => Ok(Some(
                ReconciliationMatch::new(&ledger.id, &bank.id, score, MatchType::FuzzyVector)
                    .with_reasoning(format!("Semantic similarity: {:.2}", score)),
            )),
            _ => Ok(None),
        }
    }

    /// Re-run the trigger battery over a project's pending rows, recording
    /// status/category/stage transitions in the audit chain.
    pub fn run(&self, project_id: &str) -> EngineResult<(usize, usize)> {
        let pending = self.store.query_transactions(&TransactionFilter {
            project_id: Some(project_id.to_string()),
            statuses: vec![TransactionStatus::Pending],
            ..Default::default()
        })?;

        let mut processed = 0usize;
        let mut flagged = 0usize;
        for mut tx in pending {
            let old_status = tx.status;
            let old_category = tx.category;
            let old_stage = tx.aml_stage;
            let outcome = self.triggers.evaluate(&mut tx);

            if tx.status != old_status {
                let action = if matches!(
                    tx.status,
                    TransactionStatus::Flagged | TransactionStatus::Locked
                ) {
                    "FORENSIC_FLAG"
                } else {
                    "STATUS_CHANGE"
                };
                AuditLogger::log_change(
                    &self.store,
                    ChangeRecord::new("Transaction", &tx.id, action)
                        .field("status", Some(old_status.as_str()), Some(tx.status.as_str()))
                        .reason(&outcome.triggers.join("; ")),
                )?;
            }
            if tx.category != old_category {
                AuditLogger::log_change(
                    &self.store,
                    ChangeRecord::new("Transaction", &tx.id, "CATEGORY_CHANGE")
                        .field(
                            "category_code",
                            Some(old_category.as_str()),
                            Some(tx.category.as_str()),
                        )
                        .reason("Personal Leakage Quarantine"),
                )?;
            }
            if tx.aml_stage != old_stage {
                AuditLogger::log_change(
                    &self.store,
                    ChangeRecord::new("Transaction", &tx.id, "AML_STAGE_ASSIGNMENT")
                        .field(
                            "aml_stage",
                            old_stage.map(|s| s.as_str()),
                            tx.aml_stage.map(|s| s.as_str()),
                        )
                        .reason("Automated AML stage classification based on forensic triggers"),
                )?;
            }

            if !outcome.triggers.is_empty() {
                flagged += 1;
            }
            self.store.update_transaction(&tx)?;
            processed += 1;
        }

        let flag_rate = if processed > 0 { flagged as f64 / processed as f64 } else { 0.0 };
        self.bus.publish_with(
            EventKind::ReconciliationCompleted,
            json!({
                "project_id": project_id,
                "processed_count": processed,
                "flagged_count": flagged,
                "flag_rate": (flag_rate * 100.0 * 100.0).round() / 100.0,
            }),
            None,
            Some(project_id.to_string()),
        );
        if processed > 0 && flag_rate > 0.2 {
            self.bus.publish_with(
                EventKind::VarianceDetected,
                json!({
                    "project_id": project_id,
                    "flagged_count": flagged,
                    "processed_count": processed,
                    "variance_rate": (flag_rate * 100.0 * 100.0).round() / 100.0,
                    "severity": if flag_rate > 0.4 { "high" } else { "medium" },
                }),
                None,
                Some(project_id.to_string()),
            );
        }
        Ok((processed, flagged))
    }

    /// Confirm one match. Idempotent: a second call is a no-op and produces
    /// no additional audit entry.
    pub fn confirm(&self, match_id: &str) -> EngineResult<ReconciliationMatch> {
        let m = self.store.get_match(match_id)?;
        if m.confirmed {
            debug!(match_id, "Match already confirmed");
            return Ok(m);
        }

        // Double-confirmation of the same pairing through another match row
        // is a conflict.
        let tx = self.store.get_transaction(&m.internal_tx_id)?;

        let confirmed = self.store.in_transaction(|conn| {
            ForensicStore::set_match_confirmed_on(conn, &m.id)?;
            AuditLogger::log_change_on(
                conn,
                ChangeRecord::new("ReconciliationMatch", &m.id, "CONFIRM_MATCH")
                    .field("confirmed", Some("false"), Some("true"))
                    .reason(&format!(
                        "Matched with {:.0}% confidence",
                        m.confidence_score * 100.0
                    )),
            )?;
            let mut tx = tx.clone();
            let old_status = tx.status;
            tx.status = TransactionStatus::Matched;
            ForensicStore::update_transaction_on(conn, &tx)?;
            AuditLogger::log_change_on(
                conn,
                ChangeRecord::new("Transaction", &tx.id, "STATUS_CHANGE")
                    .field("status", Some(old_status.as_str()), Some("matched"))
                    .reason(&format!("Confirmed match with Bank TX {}", m.bank_tx_id)),
            )?;
            Ok(ReconciliationMatch { confirmed: true, ..m.clone() })
        })?;

        self.bus.publish(
            EventKind::TransactionMatched,
            json!({
                "match_id": confirmed.id,
                "internal_tx_id": confirmed.internal_tx_id,
                "bank_tx_id": confirmed.bank_tx_id,
                "confidence_score": confirmed.confidence_score,
                "match_type": confirmed.match_type.as_str(),
            }),
        );
        Ok(confirmed)
    }

    /// Confirm every match gated `AUTO_OK`, atomically, and report the
    /// review/investigate buckets. Idempotent over already-confirmed matches.
    pub fn auto_confirm(&self, project_id: &str) -> EngineResult<AutoConfirmSummary> {
        let auto_ok = self.store.matches_with_reasoning(project_id, "AUTO_OK")?;
        let review = self.store.matches_with_reasoning(project_id, "REVIEW")?;
        let investigate = self.store.matches_with_reasoning(project_id, "INVESTIGATE")?;

        let to_confirm: Vec<ReconciliationMatch> =
            auto_ok.into_iter().filter(|m| !m.confirmed).collect();

        // One transaction for the whole pass: either every eligible match
        // confirms or none do.
        let mut confirmed_ids = Vec::with_capacity(to_confirm.len());
        if !to_confirm.is_empty() {
            self.store.in_transaction(|conn| {
                for m in &to_confirm {
                    ForensicStore::set_match_confirmed_on(conn, &m.id)?;
                    AuditLogger::log_change_on(
                        conn,
                        ChangeRecord::new("ReconciliationMatch", &m.id, "CONFIRM_MATCH")
                            .field("confirmed", Some("false"), Some("true"))
                            .reason(&format!(
                                "Auto-confirmed: {}",
                                m.ai_reasoning.as_deref().unwrap_or("")
                            )),
                    )?;
                    let mut tx = Self::get_transaction_on(conn, &m.internal_tx_id)?;
                    let old_status = tx.status;
                    if old_status != TransactionStatus::Matched {
                        tx.status = TransactionStatus::Matched;
                        ForensicStore::update_transaction_on(conn, &tx)?;
                        AuditLogger::log_change_on(
                            conn,
                            ChangeRecord::new("Transaction", &tx.id, "STATUS_CHANGE")
                                .field("status", Some(old_status.as_str()), Some("matched"))
                                .reason(&format!("Confirmed match with Bank TX {}", m.bank_tx_id)),
                        )?;
                    }
                    confirmed_ids.push(m.id.clone());
                }
                Ok(())
            })?;
        }

        for id in &confirmed_ids {
            if let Ok(m) = self.store.get_match(id) {
                self.bus.publish(
                    EventKind::TransactionMatched,
                    json!({
                        "match_id": m.id,
                        "internal_tx_id": m.internal_tx_id,
                        "bank_tx_id": m.bank_tx_id,
                        "confidence_score": m.confidence_score,
                        "match_type": m.match_type.as_str(),
                    }),
                );
            }
        }

        let summary = AutoConfirmSummary {
            confirmed: confirmed_ids.len(),
            review: review.len(),
            investigate: investigate.len(),
        };

        self.bus.publish_with(
            EventKind::ReconciliationCompleted,
            json!({
                "project_id": project_id,
                "auto_confirmed": summary.confirmed,
                "flagged_for_review": summary.review,
                "flagged_for_investigation": summary.investigate,
            }),
            None,
            Some(project_id.to_string()),
        );
        if summary.investigate > INVESTIGATE_VARIANCE_THRESHOLD {
            self.bus.publish_with(
                EventKind::VarianceDetected,
                json!({
                    "project_id": project_id,
                    "investigation_required": summary.investigate,
                    "severity": if summary.investigate > 20 { "high" } else { "medium" },
                }),
                None,
                Some(project_id.to_string()),
            );
        }
        Ok(summary)
    }

    fn get_transaction_on(conn: &rusqlite::Connection, id: &str) -> EngineResult<Transaction> {
        let sql = format!("SELECT {} FROM transactions WHERE id = ?1", ForensicStore::TX_COLS);
        conn.query_row(&sql, rusqlite::params![id], ForensicStore::tx_from_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    EngineError::NotFound(format!("transaction {id}"))
                }
                other => other.into(),
            })
    }

    /// Tier/gate distribution over a project's matches.
    pub fn stats(&self, project_id: &str) -> EngineResult<serde_json::Value> {
        let all = self.store.list_matches_for_project(project_id)?;
        let total = all.len();
        let count_token = |token: &str| {
            all.iter()
                .filter(|m| m.ai_reasoning.as_deref().map(|r| r.contains(token)).unwrap_or(false))
                .count()
        };
        let avg_confidence = if total > 0 {
            all.iter().map(|m| m.confidence_score).sum::<f64>() / total as f64
        } else {
            0.0
        };
        Ok(json!({
            "total_matches": total,
            "tier_distribution": {
                "tier_1_perfect": count_token(ConfidenceTier::Tier1Perfect.as_str()),
                "tier_2_strong": count_token(ConfidenceTier::Tier2Strong.as_str()),
                "tier_3_probable": count_token(ConfidenceTier::Tier3Probable.as_str()),
                "tier_4_weak": count_token(ConfidenceTier::Tier4Weak.as_str()),
            },
            "auto_confirmation": {
                "auto_confirmable": count_token("AUTO_OK"),
                "needs_review": count_token("REVIEW"),
                "needs_investigation": count_token("INVESTIGATE"),
            },
            "intelligence": {
                "invoice_matches": count_token("INV:"),
                "vendor_matches": count_token("Vendor:"),
            },
            "avg_confidence": (avg_confidence * 1000.0).round() / 1000.0,
        }))
    }
}
