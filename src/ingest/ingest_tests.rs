//! Pipeline behavior: mapping, ghost reconstruction, events, warnings.

use crate::entity::EntityResolver;
use crate::events::{EventBus, EventKind};
use crate::ingest::{ColumnMapping, IngestKind, IngestionPipeline};
use crate::models::*;
use crate::reconcile::semantic::LexicalSemanticService;
use crate::store::{ForensicStore, TransactionFilter};
use crate::triggers::TriggerEngine;
use serde_json::json;
use std::sync::Arc;

fn setup() -> (IngestionPipeline, ForensicStore, Arc<EventBus>, Project) {
    let store = ForensicStore::open_in_memory().unwrap();
    let bus = Arc::new(EventBus::new());
    let resolver = Arc::new(EntityResolver::new(store.clone()));
    let triggers = Arc::new(TriggerEngine::new(store.clone(), bus.clone()));
    let pipeline = IngestionPipeline::new(
        store.clone(),
        bus.clone(),
        resolver,
        triggers,
        Arc::new(LexicalSemanticService::new()),
        1000.0,
    );
    let project = Project::new("Audit", "CTR-700", 5_000_000_000.0, "PT Kontraktor");
    store.insert_project(&project).unwrap();
    (pipeline, store, bus, project)
}

fn ledger_mappings() -> Vec<ColumnMapping> {
    vec![
        ColumnMapping::new("date", "Tanggal"),
        ColumnMapping::new("description", "Uraian"),
        ColumnMapping::new("proposed_amount", "RAB"),
        ColumnMapping::new("actual_amount", "Realisasi"),
        ColumnMapping::new("receiver", "Penerima"),
        ColumnMapping::new("audit_comment", "Catatan"),
    ]
}

#[test]
fn ledger_row_lands_with_triggers_applied() {
    let (pipeline, store, bus, project) = setup();
    let rows = vec![json!({
        "Tanggal": "15/01/2024",
        "Uraian": "Bapa Banda",
        "RAB": "Rp 7,550,000",
        "Realisasi": "Rp 5,250,000",
        "Penerima": "Bapa Banda",
    })];
    let report = pipeline
        .ingest("journal.csv", &project.id, &ledger_mappings(), &rows, IngestKind::Ledger)
        .unwrap();
    assert_eq!(report.processed, 1);

    let stored = store.list_transactions(&project.id).unwrap();
    assert_eq!(stored.len(), 1);
    let tx = &stored[0];
    assert!((tx.delta_inflation - 2_300_000.0).abs() < 1e-9);
    assert_eq!(tx.status, TransactionStatus::Flagged);
    assert_eq!(tx.aml_stage, Some(AmlStage::Placement));
    assert!(tx.embedding.is_some());
    assert!(tx.receiver_entity_id.is_some());

    let ingested = bus.recent(Some(EventKind::DataIngested), None, 5);
    assert_eq!(ingested.len(), 1);
    assert_eq!(ingested[0].data["records_count"], 1);
}

#[test]
fn statement_balance_gap_creates_ghost_transaction() {
    let (pipeline, store, _, project) = setup();
    let mappings = vec![
        ColumnMapping::new("date", "date"),
        ColumnMapping::new("description", "desc"),
        ColumnMapping::new("credit", "credit"),
        ColumnMapping::new("debit", "debit"),
        ColumnMapping::new("balance", "balance"),
        ColumnMapping::new("account_number", "acct"),
        ColumnMapping::new("bank_name", "bank"),
    ];
    let rows = vec![
        json!({"date": "2024-01-10", "desc": "setoran awal", "credit": "10000000",
               "debit": "0", "balance": "10000000", "acct": "921", "bank": "BCA"}),
        // 10M + 0 - 2M = 8M expected, statement says 5M: 3M gap
        json!({"date": "2024-01-11", "desc": "penarikan", "credit": "0",
               "debit": "2000000", "balance": "5000000", "acct": "921", "bank": "BCA"}),
    ];
    let report = pipeline
        .ingest("statement.csv", &project.id, &mappings, &rows, IngestKind::Statement)
        .unwrap();
    assert_eq!(report.processed, 2);
    assert_eq!(report.ghost_transactions, 1);
    assert_eq!(*report.anomaly_counts.get("BALANCE_GAP").unwrap(), 1);

    let bank_rows = store.list_bank_transactions(&project.id).unwrap();
    assert_eq!(bank_rows.len(), 2);

    let ghosts = store
        .query_transactions(&TransactionFilter {
            project_id: Some(project.id.clone()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(ghosts.len(), 1);
    let ghost = &ghosts[0];
    assert!(ghost.is_inferred);
    assert_eq!(ghost.category, TransactionCategory::U);
    assert!((ghost.actual_amount - 3_000_000.0).abs() < 1e-6);
    assert_eq!(ghost.sender, "Unknown-Gap-921");
}

#[test]
fn small_balance_drift_does_not_ghost() {
    let (pipeline, _, _, project) = setup();
    let mappings = vec![
        ColumnMapping::new("date", "date"),
        ColumnMapping::new("credit", "credit"),
        ColumnMapping::new("debit", "debit"),
        ColumnMapping::new("balance", "balance"),
    ];
    let rows = vec![
        json!({"date": "2024-01-10", "credit": "1000000", "debit": "0", "balance": "1000000"}),
        // 500-unit drift stays under the 1000 threshold
        json!({"date": "2024-01-11", "credit": "0", "debit": "0", "balance": "1000500"}),
    ];
    let report = pipeline
        .ingest("stmt.csv", &project.id, &mappings, &rows, IngestKind::Statement)
        .unwrap();
    assert_eq!(report.ghost_transactions, 0);
}

#[test]
fn malformed_rows_warn_and_continue() {
    let (pipeline, store, _, project) = setup();
    let rows = vec![
        json!({"Tanggal": "definitely not a date", "Uraian": "x", "RAB": "100",
               "Realisasi": "100", "Penerima": "A"}),
        json!({"Tanggal": "15/01/2024", "Uraian": "ok", "RAB": "100",
               "Realisasi": "100", "Penerima": "B"}),
    ];
    let report = pipeline
        .ingest("mixed.csv", &project.id, &ledger_mappings(), &rows, IngestKind::Ledger)
        .unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.quality_score < 100.0);
    assert_eq!(store.list_transactions(&project.id).unwrap().len(), 1);
}

#[test]
fn future_dated_rows_are_rejected_per_row() {
    let (pipeline, store, _, project) = setup();
    let rows = vec![json!({
        "Tanggal": "2099-01-01",
        "Uraian": "masa depan",
        "RAB": "100",
        "Realisasi": "100",
        "Penerima": "A",
    })];
    let report = pipeline
        .ingest("future.csv", &project.id, &ledger_mappings(), &rows, IngestKind::Ledger)
        .unwrap();
    assert_eq!(report.processed, 0);
    assert_eq!(report.warnings.len(), 1);
    assert!(store.list_transactions(&project.id).unwrap().is_empty());
}

#[test]
fn auto_mapping_resolves_known_aliases() {
    let (pipeline, store, _, project) = setup();
    let rows = vec![json!({
        "tanggal": "10/01/2024",
        "uraian": "pembelian semen",
        "jumlah": "2500000",
        "penerima": "PT Semen Indonesia",
    })];
    let report = pipeline
        .ingest("aliased.csv", &project.id, &[], &rows, IngestKind::Ledger)
        .unwrap();
    assert_eq!(report.processed, 1);
    let tx = &store.list_transactions(&project.id).unwrap()[0];
    assert_eq!(tx.receiver, "PT Semen Indonesia");
    assert!((tx.actual_amount - 2_500_000.0).abs() < 1e-9);
}

#[test]
fn geolocation_cell_is_parsed_onto_the_row() {
    let (pipeline, store, _, project) = setup();
    let mut mappings = ledger_mappings();
    mappings.push(ColumnMapping::new("geolocation", "Koordinat"));
    let rows = vec![json!({
        "Tanggal": "12/01/2024",
        "Uraian": "survey lokasi",
        "RAB": "500000",
        "Realisasi": "500000",
        "Penerima": "CV Survey",
        "Koordinat": "-6.9175, 107.6191",
    })];
    pipeline
        .ingest("geo.csv", &project.id, &mappings, &rows, IngestKind::Ledger)
        .unwrap();
    let tx = &store.list_transactions(&project.id).unwrap()[0];
    assert!((tx.latitude.unwrap() + 6.9175).abs() < 1e-9);
    assert!((tx.longitude.unwrap() - 107.6191).abs() < 1e-9);
}

#[test]
fn duplicate_rows_are_tagged() {
    let (pipeline, _, _, project) = setup();
    let row = json!({
        "Tanggal": "12/01/2024",
        "Uraian": "pembayaran vendor",
        "RAB": "1000000",
        "Realisasi": "1000000",
        "Penerima": "CV Dobel",
    });
    let report = pipeline
        .ingest("dupes.csv", &project.id, &ledger_mappings(), &[row.clone(), row], IngestKind::Ledger)
        .unwrap();
    assert_eq!(*report.anomaly_counts.get("DUPLICATE_PAYMENT_PATTERN").unwrap(), 1);
}

#[test]
fn secondary_id_intent_bridges_to_entity_metadata() {
    let (pipeline, store, _, project) = setup();
    let mut mappings = ledger_mappings();
    mappings.push(ColumnMapping::new("sub_group", "NIK").with_intent("SECONDARY_ID"));
    let rows = vec![json!({
        "Tanggal": "12/01/2024",
        "Uraian": "honor",
        "RAB": "750000",
        "Realisasi": "750000",
        "Penerima": "Pak Tukang",
        "NIK": "3171234567890001",
    })];
    pipeline
        .ingest("intent.csv", &project.id, &mappings, &rows, IngestKind::Ledger)
        .unwrap();
    let tx = &store.list_transactions(&project.id).unwrap()[0];
    let receiver = store.get_entity(tx.receiver_entity_id.as_ref().unwrap()).unwrap();
    assert_eq!(
        receiver.metadata.get("alias_id").and_then(|v| v.as_str()),
        Some("3171234567890001")
    );
}
