//! End-to-end engine scenarios: ingestion through triggers, reconciliation,
//! graph analytics and batch orchestration against a disk-backed store.

use chrono::{TimeZone, Utc};
use ledgerhawk_backend::batch::{BatchOrchestrator, OrchestratorConfig};
use ledgerhawk_backend::entity::EntityResolver;
use ledgerhawk_backend::events::{EventBus, EventKind};
use ledgerhawk_backend::graph::cycles::{CycleDetector, DEFAULT_MAX_DEPTH, DEFAULT_MIN_AMOUNT};
use ledgerhawk_backend::ingest::{ColumnMapping, IngestKind, IngestionPipeline};
use ledgerhawk_backend::models::*;
use ledgerhawk_backend::reconcile::{
    CurrencyService, LexicalSemanticService, ReconciliationMatcher, SemanticService,
};
use ledgerhawk_backend::store::audit::AuditLogger;
use ledgerhawk_backend::store::ForensicStore;
use ledgerhawk_backend::triggers::TriggerEngine;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Engine {
    store: ForensicStore,
    bus: Arc<EventBus>,
    pipeline: Arc<IngestionPipeline>,
    matcher: Arc<ReconciliationMatcher>,
    _dir: tempfile::TempDir,
}

fn engine() -> Engine {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("engine.db");
    let store = ForensicStore::open(db_path.to_str().unwrap()).unwrap();
    let bus = Arc::new(EventBus::new());
    let resolver = Arc::new(EntityResolver::new(store.clone()));
    let triggers = Arc::new(TriggerEngine::new(store.clone(), bus.clone()));
    let semantic: Arc<dyn SemanticService> = Arc::new(LexicalSemanticService::new());
    let pipeline = Arc::new(IngestionPipeline::new(
        store.clone(),
        bus.clone(),
        resolver,
        triggers.clone(),
        semantic.clone(),
        1000.0,
    ));
    let matcher = Arc::new(ReconciliationMatcher::new(
        store.clone(),
        bus.clone(),
        triggers,
        Arc::new(CurrencyService::default()),
        semantic,
    ));
    Engine { store, bus, pipeline, matcher, _dir: dir }
}

fn seeded_project(store: &ForensicStore) -> Project {
    let project = Project::new("Jembatan Timur", "CTR-2024-001", 12_000_000_000.0, "PT Kontraktor")
        .with_site("Jakarta Site", -6.2088, 106.8456);
    store.insert_project(&project).unwrap();
    project
}

fn ledger_mappings() -> Vec<ColumnMapping> {
    vec![
        ColumnMapping::new("date", "tanggal"),
        ColumnMapping::new("description", "uraian"),
        ColumnMapping::new("proposed_amount", "rab"),
        ColumnMapping::new("actual_amount", "realisasi"),
        ColumnMapping::new("receiver", "penerima"),
        ColumnMapping::new("audit_comment", "catatan"),
    ]
}

#[test]
fn inflation_detection_flow() {
    let engine = engine();
    let project = seeded_project(&engine.store);
    let rows = vec![json!({
        "tanggal": "15/01/2024",
        "uraian": "Bapa Banda",
        "rab": "7550000",
        "realisasi": "5250000",
        "penerima": "Bapa Banda",
    })];
    engine
        .pipeline
        .ingest("journal.csv", &project.id, &ledger_mappings(), &rows, IngestKind::Ledger)
        .unwrap();

    let stored = engine.store.list_transactions(&project.id).unwrap();
    assert_eq!(stored.len(), 1);
    let tx = &stored[0];
    assert!((tx.delta_inflation - 2_300_000.0).abs() < 1e-9);
    assert_eq!(tx.status, TransactionStatus::Flagged);
    assert_eq!(tx.aml_stage, Some(AmlStage::Placement));
    assert!(tx
        .mens_rea_description
        .as_deref()
        .map(|m| m.contains("Penggelembungan"))
        .unwrap_or(false));
}

#[test]
fn locked_evidence_flow_writes_audit_entry() {
    let engine = engine();
    let project = seeded_project(&engine.store);
    let rows = vec![json!({
        "tanggal": "16/01/2024",
        "uraian": "pembelian material",
        "rab": "1200000",
        "realisasi": "1200000",
        "penerima": "CV Material",
        "catatan": "BUTUH BUKTI - No receipt found",
    })];
    engine
        .pipeline
        .ingest("journal.csv", &project.id, &ledger_mappings(), &rows, IngestKind::Ledger)
        .unwrap();

    // Ingestion applies the trigger; the scan pass records the transition.
    // Reset to pending first so the scan sees it fresh.
    let mut tx = engine.store.list_transactions(&project.id).unwrap().remove(0);
    assert_eq!(tx.status, TransactionStatus::Locked);
    assert!(tx.needs_proof);

    tx.status = TransactionStatus::Pending;
    tx.needs_proof = false;
    engine.store.update_transaction(&tx).unwrap();
    engine.matcher.run(&project.id).unwrap();

    let rescanned = engine.store.get_transaction(&tx.id).unwrap();
    assert_eq!(rescanned.status, TransactionStatus::Locked);
    assert!(rescanned.needs_proof);

    let entries = AuditLogger::entries_for(&engine.store, &tx.id).unwrap();
    let flag_entry = entries.iter().find(|e| e.action == "FORENSIC_FLAG").unwrap();
    assert_eq!(flag_entry.field_name.as_deref(), Some("status"));
    assert_eq!(flag_entry.old_value.as_deref(), Some("pending"));
    assert_eq!(flag_entry.new_value.as_deref(), Some("locked"));
    AuditLogger::verify_chain(&engine.store, &tx.id).unwrap();
}

#[test]
fn direct_match_auto_confirms_and_audits_once() {
    let engine = engine();
    let project = seeded_project(&engine.store);

    let ledger = Transaction::new(
        &project.id,
        3_125_000_000.0,
        3_125_000_000.0,
        "PT Kontraktor",
        "PT. SEMEN INDONESIA",
    )
    .with_description("Pembayaran INV-2024-001234 PT SEMEN INDONESIA")
    .with_timestamp(Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap());
    engine.store.insert_transaction(&ledger).unwrap();

    let mut bank = BankTransaction::new(
        &project.id,
        3_125_000_000.0,
        "BCA",
        "TRF PT SEMEN INDONESIA INVOICE INV-2024-001234",
    );
    bank.timestamp = Utc.with_ymd_and_hms(2024, 1, 16, 9, 0, 0).unwrap();
    engine.store.insert_bank_transaction(&bank).unwrap();

    let outcome = engine.matcher.suggest(&project.id).unwrap();
    let direct = outcome
        .matches
        .iter()
        .find(|m| m.match_type == MatchType::Direct)
        .expect("direct match");
    let reasoning = direct.ai_reasoning.as_deref().unwrap();
    assert!(reasoning.contains("AUTO_OK"), "{reasoning}");
    assert!(reasoning.contains("INV:"), "{reasoning}");

    let summary = engine.matcher.auto_confirm(&project.id).unwrap();
    assert_eq!(summary.confirmed, 1);

    let matched_tx = engine.store.get_transaction(&ledger.id).unwrap();
    assert_eq!(matched_tx.status, TransactionStatus::Matched);

    // Exactly one CONFIRM_MATCH entry, and idempotent on re-run
    engine.matcher.auto_confirm(&project.id).unwrap();
    let entries = AuditLogger::entries_for(&engine.store, &direct.id).unwrap();
    assert_eq!(entries.iter().filter(|e| e.action == "CONFIRM_MATCH").count(), 1);

    let events = engine.bus.recent(Some(EventKind::TransactionMatched), None, 10);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data["match_id"], direct.id);
}

#[test]
fn aggregate_match_flow() {
    let engine = engine();
    let project = seeded_project(&engine.store);
    let base = Utc.with_ymd_and_hms(2024, 2, 10, 10, 0, 0).unwrap();

    let amounts = [3_000_000.0, 1_500_000.0, 500_000.0];
    let categories = [TransactionCategory::V, TransactionCategory::P, TransactionCategory::F];
    for (amount, category) in amounts.iter().zip(categories) {
        let tx = Transaction::new(&project.id, 0.0, *amount, "PT Kontraktor", &format!("V{amount}"))
            .with_description(&format!("voucher {amount}"))
            .with_category(category)
            .with_timestamp(base);
        engine.store.insert_transaction(&tx).unwrap();
    }
    let mut bank = BankTransaction::new(&project.id, 5_000_000.0, "BCA", "setoran gabungan");
    bank.timestamp = base + chrono::Duration::days(1);
    engine.store.insert_bank_transaction(&bank).unwrap();

    let outcome = engine.matcher.suggest(&project.id).unwrap();
    let aggregate: Vec<_> = outcome
        .matches
        .iter()
        .filter(|m| m.match_type == MatchType::Aggregate)
        .collect();
    assert_eq!(aggregate.len(), 3);
    assert!(aggregate.iter().all(|m| (m.confidence_score - 0.9).abs() < 1e-9));
    assert!(aggregate.iter().all(|m| m.bank_tx_id == bank.id));
}

#[test]
fn circular_flow_detection_flow() {
    let engine = engine();
    let project = seeded_project(&engine.store);
    for (sender, receiver, amount) in
        [("A", "B", 50_000_000.0), ("B", "C", 48_000_000.0), ("C", "A", 45_000_000.0)]
    {
        let tx = Transaction::new(&project.id, 0.0, amount, sender, receiver);
        engine.store.insert_transaction(&tx).unwrap();
    }

    let detector = CycleDetector::new(engine.store.clone(), engine.bus.clone());
    let cycles = detector.detect(&project.id, DEFAULT_MIN_AMOUNT, DEFAULT_MAX_DEPTH).unwrap();
    assert_eq!(cycles.len(), 1);
    let cycle = &cycles[0];
    assert_eq!(cycle.depth, 3);
    assert_eq!(cycle.min_flow, 45_000_000.0);
    assert!(cycle.risk_score >= 0.90);

    let events = engine.bus.recent(Some(EventKind::CorrelationFound), None, 10);
    assert_eq!(events.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_job_processes_ledger_rows_end_to_end() {
    let engine = engine();
    let project = seeded_project(&engine.store);

    let orchestrator = BatchOrchestrator::new(
        engine.store.clone(),
        engine.bus.clone(),
        engine.pipeline.clone(),
        OrchestratorConfig {
            max_job_items: 1_000_000,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(10),
            retry_max_delay: Duration::from_millis(100),
            soft_timeout: Duration::from_secs(30),
            hard_timeout: Duration::from_secs(60),
            global_worker_cap: 8,
        },
    );

    let items: Vec<serde_json::Value> = (0..600)
        .map(|i| {
            json!({
                "tanggal": "10/01/2024",
                "uraian": format!("pengadaan item {i}"),
                "jumlah": format!("{}", 1_000_000 + i),
                "penerima": format!("Vendor {}", i % 7),
            })
        })
        .collect();

    let job_id = orchestrator
        .submit(items, Some(project.id.clone()), "transaction")
        .unwrap();

    let mut status = JobStatus::Pending;
    for _ in 0..600 {
        let job = orchestrator.status(&job_id).unwrap();
        status = job.status;
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(status, JobStatus::Completed);

    let job = orchestrator.status(&job_id).unwrap();
    assert_eq!(job.items_processed, 600);
    assert_eq!(job.items_failed, 0);
    assert_eq!(job.batches_completed, job.total_batches);
    assert!((job.success_rate() - 100.0).abs() < 1e-9);

    let completed = engine.bus.recent(Some(EventKind::BatchJobCompleted), None, 10);
    assert_eq!(completed.len(), 1);

    let stored = engine.store.list_transactions(&project.id).unwrap();
    assert_eq!(stored.len(), 600);
    assert!(stored.iter().all(|t| t.embedding.is_some()));
}

#[test]
fn entity_upsert_is_idempotent_across_flows() {
    let engine = engine();
    let project = seeded_project(&engine.store);
    let rows = vec![
        json!({
            "tanggal": "10/01/2024", "uraian": "termin 1",
            "rab": "1000000", "realisasi": "1000000",
            "penerima": "PT Semen Indonesia",
        }),
        json!({
            "tanggal": "11/01/2024", "uraian": "termin 2",
            "rab": "1000000", "realisasi": "1000000",
            "penerima": "PT. SEMEN INDONESIA",
        }),
    ];
    engine
        .pipeline
        .ingest("journal.csv", &project.id, &ledger_mappings(), &rows, IngestKind::Ledger)
        .unwrap();

    let stored = engine.store.list_transactions(&project.id).unwrap();
    let ids: Vec<_> = stored.iter().filter_map(|t| t.receiver_entity_id.clone()).collect();
    assert_eq!(ids.len(), 2);
    assert_eq!(ids[0], ids[1], "variant spellings must resolve to one entity");
    let entity = engine.store.get_entity(&ids[0]).unwrap();
    assert!(!entity.aliases().is_empty());
}

#[test]
fn audit_chain_reproduces_signatures() {
    let engine = engine();
    let project = seeded_project(&engine.store);
    let tx = Transaction::new(&project.id, 2_000_000.0, 1_000_000.0, "A", "B")
        .with_description("dana proyek");
    engine.store.insert_transaction(&tx).unwrap();
    engine.matcher.run(&project.id).unwrap();

    let entries = AuditLogger::entries_for(&engine.store, &tx.id).unwrap();
    assert!(!entries.is_empty());
    AuditLogger::verify_chain(&engine.store, &tx.id).unwrap();
}
