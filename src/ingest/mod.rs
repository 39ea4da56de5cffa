//! Ingestion pipeline: heterogeneous ledger and statement rows in, canonical
//! persisted transactions out.
//!
//! Per row: column-mapping resolution (explicit or alias-derived), robust
//! numeric/date/coordinate parsing, entity upserts, batch-reference
//! extraction, balance-gap ghost reconstruction for statements, trigger
//! evaluation and embedding enrichment. Malformed rows degrade to warnings;
//! ingestion always continues.
//!
//! Within one ingestion rows are processed sequentially so the per-account
//! balance state survives; independent ingestions may run in parallel.

pub mod parse;

use crate::errors::{EngineError, EngineResult};
use crate::events::{EventBus, EventKind};
use crate::entity::EntityResolver;
use crate::models::*;
use crate::reconcile::semantic::SemanticService;
use crate::store::audit::{AuditLogger, ChangeRecord};
use crate::store::ForensicStore;
use crate::triggers::TriggerEngine;
use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

const WARNING_CAP: usize = 50;
const ANOMALY_VARIANCE_RATIO: f64 = 0.2;
const PERSONAL_SIGNATURE_KEYWORDS: &[&str] = &["GPA", "PRIVATE", "MALL", "MEAL", "LUNCH"];
const PERSONAL_RECEIVER_RISK_FLOOR: f64 = 0.75;
const KNOWN_CITIES: &[&str] = &["jakarta", "surabaya", "bandung", "medan"];

/// Input shape being ingested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestKind {
    Ledger,
    Statement,
}

impl IngestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestKind::Ledger => "ledger",
            IngestKind::Statement => "statement",
        }
    }
}

/// Caller-supplied column mapping. `intent` carries the forensic routing hint
/// for custom fields.
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    pub system_field: String,
    pub file_column: String,
    pub intent: Option<String>,
    pub label: Option<String>,
}

impl ColumnMapping {
    pub fn new(system_field: &str, file_column: &str) -> Self {
        Self {
            system_field: system_field.to_string(),
            file_column: file_column.to_string(),
            intent: None,
            label: None,
        }
    }

    pub fn with_intent(mut self, intent: &str) -> Self {
        self.intent = Some(intent.to_string());
        self
    }
}

/// Known header aliases per system field, used when the caller supplies no
/// explicit mapping.
const FIELD_ALIASES: &[(&str, &[&str])] = &[
    ("date", &["date", "tanggal", "tgl", "transaction_date", "timeline"]),
    ("description", &["description", "uraian", "keterangan", "memo"]),
    ("amount", &["amount", "jumlah", "nilai"]),
    ("proposed_amount", &["proposed_amount", "rab", "anggaran"]),
    ("actual_amount", &["actual_amount", "realisasi"]),
    ("balance", &["balance", "saldo"]),
    ("credit", &["credit", "kredit"]),
    ("debit", &["debit"]),
    ("sender", &["sender", "pengirim", "from"]),
    ("receiver", &["receiver", "penerima", "to", "vendor"]),
    ("account_number", &["account_number", "no_rekening", "account"]),
    ("city", &["city", "kota"]),
    ("sub_group", &["sub_group", "subgroup"]),
    ("geolocation", &["geolocation", "geo", "koordinat"]),
    ("latitude", &["latitude", "lat"]),
    ("longitude", &["longitude", "lon", "lng"]),
    ("category", &["category", "kategori", "category_code"]),
    ("bank_name", &["bank_name", "bank"]),
    ("audit_comment", &["audit_comment", "comment", "catatan"]),
];

/// Derive mappings from a sample row's keys via the alias table.
pub fn auto_mappings(sample: &Value) -> Vec<ColumnMapping> {
    let Some(object) = sample.as_object() else { return Vec::new() };
    let mut mappings = Vec::new();
    for (system_field, aliases) in FIELD_ALIASES {
        for key in object.keys() {
            if aliases.iter().any(|a| a.eq_ignore_ascii_case(key)) {
                mappings.push(ColumnMapping::new(system_field, key));
                break;
            }
        }
    }
    mappings
}

/// Outcome of one ingestion run.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub ingestion_id: String,
    pub processed: usize,
    pub entities_created: usize,
    pub ghost_transactions: usize,
    pub warnings: Vec<String>,
    pub anomaly_counts: BTreeMap<String, usize>,
    pub quality_score: f64,
}

impl IngestReport {
    pub fn anomaly_total(&self) -> usize {
        self.anomaly_counts.values().sum()
    }
}

pub struct IngestionPipeline {
    store: ForensicStore,
    bus: Arc<EventBus>,
    resolver: Arc<EntityResolver>,
    triggers: Arc<TriggerEngine>,
    semantic: Arc<dyn SemanticService>,
    balance_gap_threshold: f64,
}

impl IngestionPipeline {
    pub fn new(
        store: ForensicStore,
        bus: Arc<EventBus>,
        resolver: Arc<EntityResolver>,
        triggers: Arc<TriggerEngine>,
        semantic: Arc<dyn SemanticService>,
        balance_gap_threshold: f64,
    ) -> Self {
        Self { store, bus, resolver, triggers, semantic, balance_gap_threshold }
    }

    /// Ingest one file's rows into a project.
    pub fn ingest(
        &self,
        file_name: &str,
        project_id: &str,
        mappings: &[ColumnMapping],
        rows: &[Value],
        kind: IngestKind,
    ) -> EngineResult<IngestReport> {
        let project = self.store.get_project(project_id)?;
        let ingestion_id = new_id();

        let mappings: Vec<ColumnMapping> = if mappings.is_empty() {
            rows.first().map(auto_mappings).unwrap_or_default()
        } else {
            mappings.to_vec()
        };
        let field_map: BTreeMap<&str, &str> = mappings
            .iter()
            .map(|m| (m.system_field.as_str(), m.file_column.as_str()))
            .collect();

        let file_hash = {
            let mut hasher = Sha256::new();
            hasher.update(serde_json::to_string(rows)?.as_bytes());
            hex::encode(hasher.finalize())
        };
        let mut record = IngestionRecord {
            id: ingestion_id.clone(),
            project_id: project_id.to_string(),
            file_name: file_name.to_string(),
            file_type: kind.as_str().to_string(),
            file_hash,
            records_processed: 0,
            status: "completed".to_string(),
            metadata: Default::default(),
            created_at: Utc::now(),
        };
        self.store.insert_ingestion(&record)?;

        self.bus.publish_with(
            EventKind::DataUploaded,
            json!({
                "ingestion_id": ingestion_id,
                "file_name": file_name,
                "row_count": rows.len(),
            }),
            None,
            Some(project_id.to_string()),
        );

        // Statements are re-ordered by date so the per-account balance chain
        // is reconstructible.
        let mut ordered: Vec<&Value> = rows.iter().collect();
        if kind == IngestKind::Statement {
            let date_col = field_map.get("date").copied();
            ordered.sort_by_key(|row| {
                date_col
                    .and_then(|col| row.get(col))
                    .and_then(value_as_string)
                    .and_then(|raw| parse::parse_date(&raw))
                    .unwrap_or_else(Utc::now)
            });
        }

        let mut warnings: Vec<String> = Vec::new();
        let mut anomaly_counts: BTreeMap<String, usize> = BTreeMap::new();
        let mut processed = 0usize;
        let mut entities_created = 0usize;
        let mut ghost_transactions = 0usize;
        let mut account_balances: BTreeMap<String, f64> = BTreeMap::new();
        let mut seen_rows: HashSet<String> = HashSet::new();

        for (row_index, row) in ordered.iter().enumerate() {
            match self.ingest_row(
                &project,
                &ingestion_id,
                &field_map,
                &mappings,
                row,
                row_index,
                kind,
                &mut account_balances,
                &mut seen_rows,
                &mut anomaly_counts,
                &mut warnings,
                &mut entities_created,
                &mut ghost_transactions,
            ) {
                Ok(()) => processed += 1,
                Err(err) => {
                    let mut message = format!("Row {}: {}", row_index + 1, err);
                    message.truncate(160);
                    warnings.push(message);
                }
            }
        }

        let quality_score = (100.0 - 2.0 * warnings.len() as f64).max(0.0);
        warnings.truncate(WARNING_CAP);
        record.records_processed = processed;
        record.status =
            if warnings.is_empty() { "completed".to_string() } else { "warning".to_string() };
        record.metadata.insert("anomaly_count".to_string(), json!(anomaly_counts.values().sum::<usize>()));
        record.metadata.insert("warnings".to_string(), json!(warnings));
        record.metadata.insert("quality_score".to_string(), json!(quality_score));
        self.store.update_ingestion(&record)?;

        AuditLogger::log_change(
            &self.store,
            ChangeRecord::new("Ingestion", &ingestion_id, "CONSOLIDATE")
                .reason(&format!("Processed {} records from {}", processed, file_name)),
        )?;

        let report = IngestReport {
            ingestion_id: ingestion_id.clone(),
            processed,
            entities_created,
            ghost_transactions,
            warnings: record
                .metadata
                .get("warnings")
                .and_then(|v| v.as_array())
                .map(|a| a.iter().filter_map(|w| w.as_str().map(String::from)).collect())
                .unwrap_or_default(),
            anomaly_counts,
            quality_score,
        };

        self.bus.publish_with(
            EventKind::DataValidated,
            json!({
                "ingestion_id": ingestion_id,
                "quality_score": quality_score,
                "records_processed": processed,
                "issues": report.warnings.iter().take(10).collect::<Vec<_>>(),
                "anomaly_types": report.anomaly_counts.keys().collect::<Vec<_>>(),
            }),
            None,
            Some(project_id.to_string()),
        );
        self.bus.publish_with(
            EventKind::DataIngested,
            json!({
                "ingestion_id": ingestion_id,
                "project_id": project_id,
                "records_count": processed,
                "entities_created": entities_created,
                "ghost_transactions": ghost_transactions,
                "anomalies_detected": report.anomaly_total(),
                "ingestion_type": kind.as_str(),
            }),
            None,
            Some(project_id.to_string()),
        );
        if processed > 0 && report.anomaly_total() as f64 / processed as f64 > ANOMALY_VARIANCE_RATIO
        {
            self.bus.publish_with(
                EventKind::VarianceDetected,
                json!({
                    "ingestion_id": ingestion_id,
                    "project_id": project_id,
                    "anomaly_count": report.anomaly_total(),
                    "anomaly_breakdown": report.anomaly_counts,
                    "risk_score": (report.anomaly_total() as f64 / processed as f64).min(1.0),
                }),
                None,
                Some(project_id.to_string()),
            );
        }

        info!(
            project = project_id,
            file = file_name,
            processed,
            ghosts = ghost_transactions,
            anomalies = report.anomaly_total(),
            "📥 Ingestion complete"
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn ingest_row(
        &self,
        project: &Project,
        ingestion_id: &str,
        field_map: &BTreeMap<&str, &str>,
        mappings: &[ColumnMapping],
        row: &Value,
        row_index: usize,
        kind: IngestKind,
        account_balances: &mut BTreeMap<String, f64>,
        seen_rows: &mut HashSet<String>,
        anomaly_counts: &mut BTreeMap<String, usize>,
        warnings: &mut Vec<String>,
        entities_created: &mut usize,
        ghost_transactions: &mut usize,
    ) -> EngineResult<()> {
        let get_value = |field: &str| -> Option<String> {
            field_map
                .get(field)
                .and_then(|col| row.get(*col))
                .and_then(value_as_string)
                .filter(|v| !v.trim().is_empty() && v != "—")
        };
        let get_numeric = |field: &str| -> f64 {
            get_value(field)
                .and_then(|raw| parse::parse_amount(&raw))
                .unwrap_or(0.0)
        };

        let mut amount = get_numeric("amount");
        let credit = get_numeric("credit");
        let debit = get_numeric("debit");
        let balance = get_numeric("balance");
        if amount == 0.0 {
            amount = if credit > 0.0 { credit } else { debit };
        }
        if amount < 0.0 {
            return Err(EngineError::Validation(format!("negative amount {amount}")));
        }

        let description = get_value("description");
        let account_label = get_value("account_number").unwrap_or_else(|| "Main".to_string());
        let receiver = get_value("receiver")
            .or_else(|| get_value("sender"))
            .unwrap_or_else(|| "Unknown".to_string());
        let sender = get_value("sender").unwrap_or_else(|| project.contractor_name.clone());

        let txn_date = match get_value("date") {
            Some(raw) => match parse::parse_date(&raw) {
                Some(parsed) => parsed,
                None => {
                    return Err(EngineError::Validation(format!("unparseable date '{raw}'")));
                }
            },
            None => Utc::now(),
        };
        if txn_date > Utc::now() {
            return Err(EngineError::Validation("future-dated row".to_string()));
        }

        // Coordinates: explicit lat/lon columns or a combined geolocation cell
        let mut latitude = get_value("latitude").and_then(|v| v.parse::<f64>().ok());
        let mut longitude = get_value("longitude").and_then(|v| v.parse::<f64>().ok());
        if latitude.is_none() || longitude.is_none() {
            if let Some(geo) = get_value("geolocation") {
                if let Some((lat, lon)) = parse::parse_coordinates(&geo) {
                    latitude = Some(lat);
                    longitude = Some(lon);
                }
            }
        }

        // Entity resolution hooks
        let receiver_id = self.upsert_party(&receiver, None, entities_created)?;
        let sender_id = self.upsert_party(&sender, None, entities_created)?;

        // Personal-leakage signature raises the receiver's global risk floor
        let desc_upper = description.clone().unwrap_or_default().to_uppercase();
        let personal_signature =
            PERSONAL_SIGNATURE_KEYWORDS.iter().any(|kw| desc_upper.contains(kw));
        if personal_signature {
            if let Some(receiver_entity_id) = &receiver_id {
                self.resolver.raise_risk_floor(receiver_entity_id, PERSONAL_RECEIVER_RISK_FLOOR)?;
            }
        }

        let batch_reference =
            crate::reconcile::intelligence::extract_batch_ref(description.as_deref().unwrap_or(""));

        // Row anomaly tagging
        let mut anomalies: Vec<&str> = Vec::new();
        if amount > 0.0 && (amount % 1_000_000.0).abs() < f64::EPSILON {
            anomalies.push("ROUND_AMOUNT_PATTERN");
        }
        if let Some(city) = get_value("city") {
            if !KNOWN_CITIES.contains(&city.to_lowercase().as_str()) && amount > 1_000_000_000.0 {
                anomalies.push("UNUSUAL_LOCATION_HIGH_VALUE");
            }
        }
        let row_key = format!("{}|{}|{}", amount, receiver, get_value("date").unwrap_or_default());
        if !seen_rows.insert(row_key) {
            anomalies.push("DUPLICATE_PAYMENT_PATTERN");
            warnings.push(format!("Row {}: Potential duplicate payment detected.", row_index + 1));
        }

        // Intent-routed custom fields
        let mut custom_fields = serde_json::Map::new();
        for mapping in mappings {
            let Some(intent) = &mapping.intent else { continue };
            let Some(value) = get_value(&mapping.system_field) else { continue };
            let label = mapping.label.clone().unwrap_or_else(|| mapping.system_field.clone());
            custom_fields.insert(label, Value::String(value.clone()));
            match intent.as_str() {
                "SECONDARY_ID" => {
                    if let Some(receiver_entity_id) = &receiver_id {
                        if let Ok(mut entity) = self.store.get_entity(receiver_entity_id) {
                            entity
                                .metadata
                                .insert("alias_id".to_string(), Value::String(value.clone()));
                            self.store.update_entity(&entity)?;
                        }
                    }
                }
                "RISK_INDICATOR" => {
                    let upper = value.to_uppercase();
                    if upper.contains("SUSPECT") || upper.contains("FLAG") {
                        anomalies.push("MANUAL_RISK_TAG");
                    }
                }
                _ => {}
            }
        }
        for anomaly in &anomalies {
            *anomaly_counts.entry(anomaly.to_string()).or_insert(0) += 1;
        }

        // Balance-gap reconstruction for statements
        if kind == IngestKind::Statement {
            if let Some(previous_balance) = account_balances.get(&account_label).copied() {
                let expected = previous_balance + credit - debit;
                let delta = balance - expected;
                if delta.abs() > self.balance_gap_threshold {
                    *anomaly_counts.entry("BALANCE_GAP".to_string()).or_insert(0) += 1;
                    warnings.push(format!(
                        "Row {}: Balance Gap Detected. Diff: {:.2}",
                        row_index + 1,
                        delta
                    ));
                    let mut ghost = Transaction::new(
                        project.id.as_str(),
                        delta.abs(),
                        delta.abs(),
                        &format!("Unknown-Gap-{}", account_label),
                        "Unknown-Gap",
                    )
                    .with_description("[FORENSIC] Inferred Gap / Missing Transaction")
                    .with_category(TransactionCategory::U)
                    .with_timestamp(txn_date);
                    ghost.transaction_date = Some(txn_date);
                    ghost.is_inferred = true;
                    ghost.metadata.insert("ingestion_id".to_string(), json!(ingestion_id));
                    ghost.metadata.insert("gap_delta".to_string(), json!(delta));
                    ghost.metadata.insert("previous_balance".to_string(), json!(previous_balance));
                    ghost.metadata.insert("current_balance".to_string(), json!(balance));
                    self.store.insert_transaction(&ghost)?;
                    *ghost_transactions += 1;
                }
            }
            account_balances.insert(account_label.clone(), balance);
        }

        // Semantic footprint
        let embedding_text = format!(
            "{} | {}",
            description.as_deref().unwrap_or(""),
            receiver
        );
        let embedding = self.semantic.embed(embedding_text.trim());

        if kind == IngestKind::Statement {
            let mut bank_tx = BankTransaction::new(
                &project.id,
                amount,
                &get_value("bank_name").unwrap_or_else(|| "Unknown Bank".to_string()),
                &description.unwrap_or_else(|| format!("Statement Item {}", row_index)),
            );
            bank_tx.timestamp = txn_date;
            bank_tx.booking_date = Some(txn_date);
            bank_tx.batch_reference = batch_reference;
            bank_tx.embedding = Some(embedding);
            self.store.insert_bank_transaction(&bank_tx)?;
        } else {
            let proposed = match get_value("proposed_amount") {
                Some(raw) => parse::parse_amount(&raw).unwrap_or(amount),
                None => amount,
            };
            let actual = match get_value("actual_amount") {
                Some(raw) => parse::parse_amount(&raw).unwrap_or(amount),
                None => amount,
            };
            let category = get_value("category")
                .and_then(|c| TransactionCategory::parse(c.trim()))
                .unwrap_or(TransactionCategory::P);

            let mut tx = Transaction::new(&project.id, proposed, actual, &sender, &receiver);
            tx.description =
                Some(description.unwrap_or_else(|| format!("Txn {}", row_index)));
            tx.category = category;
            tx.account_label = get_value("account_number");
            tx.timestamp = Utc::now();
            tx.transaction_date = Some(txn_date);
            tx.sender_entity_id = sender_id;
            tx.receiver_entity_id = receiver_id;
            tx.batch_reference = batch_reference;
            tx.audit_comment = get_value("audit_comment");
            tx.latitude = latitude;
            tx.longitude = longitude;
            tx.metadata.insert("ingestion_id".to_string(), json!(ingestion_id));
            tx.metadata.insert("row_index".to_string(), json!(row_index + 1));
            tx.metadata.insert("anomalies".to_string(), json!(anomalies));
            if !custom_fields.is_empty() {
                tx.metadata.insert("custom_fields".to_string(), Value::Object(custom_fields));
            }
            tx.embedding = Some(embedding);

            self.triggers.evaluate(&mut tx);
            self.store.insert_transaction(&tx)?;
        }
        Ok(())
    }

    fn upsert_party(
        &self,
        name: &str,
        account: Option<&str>,
        entities_created: &mut usize,
    ) -> EngineResult<Option<String>> {
        let trimmed = name.trim();
        if trimmed.is_empty() || ["Unknown", "—", "Unknown-Gap"].contains(&trimmed) {
            return Ok(None);
        }
        match self.resolver.upsert(trimmed, account) {
            Ok(entity) => {
                *entities_created += 1;
                Ok(Some(entity.id))
            }
            Err(err) => {
                warn!(party = trimmed, %err, "Entity upsert degraded");
                Ok(None)
            }
        }
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod ingest_tests;

impl crate::batch::BatchProcessor for IngestionPipeline {
    /// Batch jobs feed row chunks straight through the pipeline; the mapping
    /// is alias-derived from the first row of each batch.
    fn process_batch(
        &self,
        project_id: Option<&str>,
        data_type: &str,
        items: &[Value],
    ) -> EngineResult<crate::batch::BatchStats> {
        let project_id = project_id.ok_or_else(|| {
            EngineError::Validation("batch ingestion requires a project".to_string())
        })?;
        let kind = if data_type == "statement" { IngestKind::Statement } else { IngestKind::Ledger };
        let report = self.ingest("batch-job", project_id, &[], items, kind)?;
        Ok(crate::batch::BatchStats {
            processed: report.processed,
            failed: items.len().saturating_sub(report.processed),
        })
    }
}
