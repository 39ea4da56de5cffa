//! Digit-distribution and velocity analytics: Benford first-digit deviation,
//! structuring bursts, cross-project circular capital.

use crate::errors::EngineResult;
use crate::events::{EventBus, EventKind};
use crate::models::{CopilotInsight, Transaction, TransactionCategory};
use crate::store::{ForensicStore, TransactionFilter};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

const BENFORD_DEVIATION_THRESHOLD: f64 = 0.5;
const BURST_SUM_THRESHOLD: f64 = 50_000_000.0;
const BURST_MIN_COUNT: usize = 3;
const BURST_WINDOW_HOURS: i64 = 24;

/// First-digit frequency report.
#[derive(Debug, Clone)]
pub struct BenfordReport {
    /// Observed relative frequency per digit 1..=9.
    pub observed: [f64; 9],
    /// Benford-expected P(d) = log10(1 + 1/d).
    pub expected: [f64; 9],
    /// L1 deviation between observed and expected.
    pub deviation: f64,
    pub sample_size: usize,
}

impl BenfordReport {
    pub fn is_anomalous(&self) -> bool {
        self.deviation > BENFORD_DEVIATION_THRESHOLD
    }
}

fn first_digit(value: f64) -> Option<u32> {
    let mut v = value.abs();
    if v == 0.0 || !v.is_finite() {
        return None;
    }
    while v >= 10.0 {
        v /= 10.0;
    }
    while v < 1.0 {
        v *= 10.0;
    }
    Some(v as u32)
}

/// Tabulate first-digit frequencies over |amount| > 0.
pub fn benford_report(rows: &[Transaction]) -> Option<BenfordReport> {
    let digits: Vec<u32> = rows
        .iter()
        .filter_map(|t| {
            let amount = if t.actual_amount != 0.0 { t.actual_amount } else { t.proposed_amount };
            first_digit(amount)
        })
        .collect();
    if digits.is_empty() {
        return None;
    }
    let total = digits.len() as f64;
    let mut observed = [0.0f64; 9];
    for d in &digits {
        if (1..=9).contains(d) {
            observed[(*d - 1) as usize] += 1.0;
        }
    }
    for slot in &mut observed {
        *slot /= total;
    }
    let mut expected = [0.0f64; 9];
    for (i, slot) in expected.iter_mut().enumerate() {
        *slot = (1.0 + 1.0 / (i as f64 + 1.0)).log10();
    }
    let deviation = observed.iter().zip(&expected).map(|(o, e)| (o - e).abs()).sum();
    Some(BenfordReport { observed, expected, deviation, sample_size: digits.len() })
}

/// Entity transaction-velocity metrics over a 30-day lookback.
#[derive(Debug, Clone)]
pub struct VelocityProfile {
    pub entity: String,
    pub total_tx_30d: usize,
    pub max_daily_tx: usize,
    pub avg_daily_tx: f64,
    pub structuring_attempts: usize,
    pub velocity_risk: &'static str,
}

pub struct DigitAnalytics {
    store: ForensicStore,
    bus: Arc<EventBus>,
}

impl DigitAnalytics {
    pub fn new(store: ForensicStore, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    /// Run the Benford scan over one project. A deviation above 0.5 persists
    /// an ANOMALY insight and emits `anomaly.detected`.
    pub fn benford_scan(&self, project_id: &str) -> EngineResult<Option<BenfordReport>> {
        let rows = self.store.list_transactions(project_id)?;
        let Some(report) = benford_report(&rows) else { return Ok(None) };

        if report.is_anomalous() {
            let content = format!(
                "Detected significant deviation ({:.2}) in leading digits. Potential manual manipulation.",
                report.deviation
            );
            let mut insight =
                CopilotInsight::new(project_id, "ANOMALY", "Benford's Law Violation", &content);
            insight.confidence = 0.8;
            insight.metadata.insert("deviation".to_string(), json!(report.deviation));
            insight.metadata.insert("sample_size".to_string(), json!(report.sample_size));
            self.store.insert_insight(&insight)?;

            self.bus.publish_with(
                EventKind::AnomalyDetected,
                json!({
                    "project_id": project_id,
                    "analysis": "benford",
                    "deviation": report.deviation,
                    "risk_score": 0.8,
                }),
                None,
                Some(project_id.to_string()),
            );
            info!(project = project_id, deviation = report.deviation, "📊 Benford violation");
        }
        Ok(Some(report))
    }

    /// Sliding 24h windows per receiver: a window with >= 3 transactions
    /// summing past 50M IDR is a structuring (smurfing) burst.
    pub fn structuring_bursts(&self, project_id: &str) -> EngineResult<usize> {
        let rows = self.store.query_transactions(&TransactionFilter {
            project_id: Some(project_id.to_string()),
            ..Default::default()
        })?;
        let mut by_receiver: BTreeMap<&str, Vec<&Transaction>> = BTreeMap::new();
        for tx in &rows {
            by_receiver.entry(&tx.receiver).or_default().push(tx);
        }

        let mut bursts = 0usize;
        for (receiver, mut txs) in by_receiver {
            txs.sort_by_key(|t| t.effective_date());
            let mut index = 0usize;
            while index < txs.len() {
                let window_start = txs[index].effective_date();
                let mut window_sum = 0.0;
                let mut window_len = 0usize;
                for tx in &txs[index..] {
                    if (tx.effective_date() - window_start)
                        <= chrono::Duration::hours(BURST_WINDOW_HOURS)
                    {
                        window_sum += tx.actual_amount;
                        window_len += 1;
                    } else {
                        break;
                    }
                }
                if window_sum >= BURST_SUM_THRESHOLD && window_len >= BURST_MIN_COUNT {
                    let content = format!(
                        "Detected {} transactions totaling {:.2} within 24h.",
                        window_len, window_sum
                    );
                    let mut insight = CopilotInsight::new(
                        project_id,
                        "SMURFING",
                        &format!("Structuring Burst: {}", receiver),
                        &content,
                    );
                    insight.confidence = 0.85;
                    insight.metadata.insert("receiver".to_string(), Value::String(receiver.to_string()));
                    insight.metadata.insert("total".to_string(), json!(window_sum));
                    insight.metadata.insert(
                        "tx_ids".to_string(),
                        json!(txs[index..index + window_len].iter().map(|t| t.id.clone()).collect::<Vec<_>>()),
                    );
                    self.store.insert_insight(&insight)?;
                    bursts += 1;
                    // Jump past the window to avoid double counting
                    index += window_len;
                } else {
                    index += 1;
                }
            }
        }
        Ok(bursts)
    }

    /// Per-entity velocity profile over a 30-day lookback: daily counts,
    /// structuring attempts in the `[90M, 100M)` window, burst flag.
    pub fn velocity_profile(&self, receiver: &str) -> EngineResult<Option<VelocityProfile>> {
        if receiver.is_empty() || receiver.eq_ignore_ascii_case("unknown") {
            return Ok(None);
        }
        let lookback_days = 30i64;
        let since = chrono::Utc::now() - chrono::Duration::days(lookback_days);
        let txs = self.store.query_transactions(&TransactionFilter {
            receiver: Some(receiver.to_string()),
            since: Some(since),
            ..Default::default()
        })?;
        if txs.is_empty() {
            return Ok(None);
        }
        let mut daily: BTreeMap<String, usize> = BTreeMap::new();
        for tx in &txs {
            *daily.entry(tx.timestamp.format("%Y-%m-%d").to_string()).or_insert(0) += 1;
        }
        let max_daily = daily.values().copied().max().unwrap_or(0);
        let avg_daily = txs.len() as f64 / lookback_days as f64;
        let structuring_attempts = txs
            .iter()
            .filter(|t| (90_000_000.0..100_000_000.0).contains(&t.actual_amount))
            .count();
        let is_bursting = max_daily as f64 > avg_daily * 5.0 && max_daily > 3;
        Ok(Some(VelocityProfile {
            entity: receiver.to_string(),
            total_tx_30d: txs.len(),
            max_daily_tx: max_daily,
            avg_daily_tx: avg_daily,
            structuring_attempts,
            velocity_risk: if is_bursting || structuring_attempts > 0 { "HIGH" } else { "NORMAL" },
        }))
    }

    /// Cross-project circular capital: XP outflows whose receiver shows up as
    /// a MAT-category sender in a different project.
    pub fn cross_project_circular(&self, project_id: &str) -> EngineResult<usize> {
        let outflows = self.store.query_transactions(&TransactionFilter {
            project_id: Some(project_id.to_string()),
            ..Default::default()
        })?;
        // One sweep over the global table; MAT inflows indexed by sender.
        let all_rows = self.store.query_transactions(&TransactionFilter::default())?;
        let mut mat_by_sender: BTreeMap<&str, Vec<&Transaction>> = BTreeMap::new();
        for other in &all_rows {
            if other.project_id.as_deref() != Some(project_id)
                && other.category == TransactionCategory::MAT
            {
                mat_by_sender.entry(&other.sender).or_default().push(other);
            }
        }
        let mut loops = 0usize;
        for tx in outflows.iter().filter(|t| t.category == TransactionCategory::XP) {
            let hits: Vec<&Transaction> = mat_by_sender
                .get(tx.receiver.as_str())
                .map(|v| v.iter().copied().collect())
                .unwrap_or_default();
            if let Some(first_hit) = hits.first() {
                let content = format!(
                    "Entity received funds from {} (Expense) and funded {} (Capital).",
                    project_id,
                    first_hit.project_id.as_deref().unwrap_or("unknown")
                );
                let mut insight = CopilotInsight::new(
                    project_id,
                    "CIRCULAR",
                    &format!("Cross-Project Loop: {}", tx.receiver),
                    &content,
                );
                insight.confidence = 0.9;
                insight.metadata.insert("entity".to_string(), Value::String(tx.receiver.clone()));
                insight.metadata.insert("source_tx".to_string(), Value::String(tx.id.clone()));
                insight.metadata.insert(
                    "sink_txs".to_string(),
                    json!(hits.iter().map(|h| h.id.clone()).collect::<Vec<_>>()),
                );
                self.store.insert_insight(&insight)?;
                self.bus.publish_with(
                    EventKind::CircularFlowDetected,
                    json!({
                        "project_id": project_id,
                        "entity": tx.receiver,
                        "sink_project": first_hit.project_id,
                    }),
                    None,
                    Some(project_id.to_string()),
                );
                loops += 1;
            }
        }
        Ok(loops)
    }
}
