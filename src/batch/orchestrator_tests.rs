//! Orchestrator lifecycle tests: completion accounting, retries,
//! cancellation, failure propagation.

use crate::batch::orchestrator::{
    BatchOrchestrator, BatchProcessor, BatchStats, OrchestratorConfig,
};
use crate::errors::{EngineError, EngineResult};
use crate::events::{EventBus, EventKind};
use crate::models::JobStatus;
use crate::store::ForensicStore;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        max_job_items: 1_000_000,
        max_retries: 3,
        retry_base_delay: Duration::from_millis(5),
        retry_max_delay: Duration::from_millis(40),
        soft_timeout: Duration::from_millis(400),
        hard_timeout: Duration::from_millis(600),
        global_worker_cap: 8,
    }
}

struct CountingProcessor {
    calls: AtomicUsize,
}

impl BatchProcessor for CountingProcessor {
    fn process_batch(
        &self,
        _project_id: Option<&str>,
        _data_type: &str,
        items: &[Value],
    ) -> EngineResult<BatchStats> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(BatchStats { processed: items.len(), failed: 0 })
    }
}

struct FlakyProcessor {
    attempts: AtomicUsize,
}

impl BatchProcessor for FlakyProcessor {
    fn process_batch(
        &self,
        _project_id: Option<&str>,
        _data_type: &str,
        items: &[Value],
    ) -> EngineResult<BatchStats> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < 2 {
            return Err(EngineError::Transient("store busy".to_string()));
        }
        Ok(BatchStats { processed: items.len(), failed: 0 })
    }
}

struct AlwaysFailingProcessor;

impl BatchProcessor for AlwaysFailingProcessor {
    fn process_batch(
        &self,
        _project_id: Option<&str>,
        _data_type: &str,
        _items: &[Value],
    ) -> EngineResult<BatchStats> {
        Err(EngineError::Transient("down forever".to_string()))
    }
}

struct SlowProcessor;

impl BatchProcessor for SlowProcessor {
    fn process_batch(
        &self,
        _project_id: Option<&str>,
        _data_type: &str,
        items: &[Value],
    ) -> EngineResult<BatchStats> {
        std::thread::sleep(Duration::from_millis(60));
        Ok(BatchStats { processed: items.len(), failed: 0 })
    }
}

fn items(count: usize) -> Vec<Value> {
    (0..count).map(|i| json!({"seq": i})).collect()
}

async fn wait_terminal(orchestrator: &BatchOrchestrator, job_id: &str) -> JobStatus {
    for _ in 0..400 {
        let job = orchestrator.status(job_id).unwrap();
        if job.status.is_terminal() {
            return job.status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never reached a terminal state");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn job_completes_with_exact_accounting() {
    let store = ForensicStore::open_in_memory().unwrap();
    let bus = Arc::new(EventBus::new());
    let processor = Arc::new(CountingProcessor { calls: AtomicUsize::new(0) });
    let orchestrator =
        BatchOrchestrator::new(store.clone(), bus.clone(), processor.clone(), test_config());

    let job_id = orchestrator.submit(items(1000), None, "transaction").unwrap();
    let status = wait_terminal(&orchestrator, &job_id).await;
    assert_eq!(status, JobStatus::Completed);

    let job = orchestrator.status(&job_id).unwrap();
    assert_eq!(job.items_processed, 1000);
    assert_eq!(job.items_failed, 0);
    assert_eq!(job.batches_completed, job.total_batches);
    assert!((job.progress_percent() - 100.0).abs() < 1e-9);
    assert!((job.success_rate() - 100.0).abs() < 1e-9);
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());
    assert_eq!(processor.calls.load(Ordering::SeqCst), job.total_batches);
    assert_eq!(job.worker_task_ids.len(), job.total_batches);

    let started = bus.recent(Some(EventKind::BatchJobStarted), None, 10);
    assert_eq!(started.len(), 1);
    let completed = bus.recent(Some(EventKind::BatchJobCompleted), None, 10);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].data["total_processed"], 1000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_failures_retry_then_succeed() {
    let store = ForensicStore::open_in_memory().unwrap();
    let bus = Arc::new(EventBus::new());
    let processor = Arc::new(FlakyProcessor { attempts: AtomicUsize::new(0) });
    let orchestrator =
        BatchOrchestrator::new(store.clone(), bus.clone(), processor.clone(), test_config());

    // Single batch (50 items < any base size)
    let job_id = orchestrator.submit(items(50), None, "transaction").unwrap();
    let status = wait_terminal(&orchestrator, &job_id).await;
    assert_eq!(status, JobStatus::Completed);

    let job = orchestrator.status(&job_id).unwrap();
    assert_eq!(job.items_processed, 50);
    assert_eq!(job.retry_count, 2);
    assert!(bus.recent(Some(EventKind::BatchJobFailed), None, 5).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exhausted_retries_fail_the_job() {
    let store = ForensicStore::open_in_memory().unwrap();
    let bus = Arc::new(EventBus::new());
    let orchestrator = BatchOrchestrator::new(
        store.clone(),
        bus.clone(),
        Arc::new(AlwaysFailingProcessor),
        test_config(),
    );

    let job_id = orchestrator.submit(items(50), None, "transaction").unwrap();
    let status = wait_terminal(&orchestrator, &job_id).await;
    assert_eq!(status, JobStatus::Failed);

    let job = orchestrator.status(&job_id).unwrap();
    assert!(job.error_message.is_some());
    assert_eq!(job.items_failed, 50);
    assert_eq!(job.batches_completed, job.total_batches);
    assert_eq!(bus.recent(Some(EventKind::BatchJobFailed), None, 5).len(), 1);
    assert!(bus.recent(Some(EventKind::BatchJobCompleted), None, 5).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancellation_stops_at_batch_boundaries() {
    let store = ForensicStore::open_in_memory().unwrap();
    let bus = Arc::new(EventBus::new());
    let orchestrator =
        BatchOrchestrator::new(store.clone(), bus.clone(), Arc::new(SlowProcessor), test_config());

    // Many small batches so cancellation lands mid-stream
    let job_id = orchestrator.submit(items(3000), None, "embedding").unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    orchestrator.cancel(&job_id).unwrap();

    let status = wait_terminal(&orchestrator, &job_id).await;
    assert_eq!(status, JobStatus::Cancelled);

    let job = orchestrator.status(&job_id).unwrap();
    // Confirmed outcomes only: no double counting, no phantom progress
    assert!(job.items_processed + job.items_failed <= job.total_items);
    assert!(job.batches_completed <= job.total_batches);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_after_terminal_is_a_conflict() {
    let store = ForensicStore::open_in_memory().unwrap();
    let bus = Arc::new(EventBus::new());
    let orchestrator = BatchOrchestrator::new(
        store.clone(),
        bus,
        Arc::new(CountingProcessor { calls: AtomicUsize::new(0) }),
        test_config(),
    );
    let job_id = orchestrator.submit(items(10), None, "transaction").unwrap();
    wait_terminal(&orchestrator, &job_id).await;
    let err = orchestrator.cancel(&job_id).unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_submissions_are_rejected() {
    let store = ForensicStore::open_in_memory().unwrap();
    let bus = Arc::new(EventBus::new());
    let orchestrator = BatchOrchestrator::new(
        store,
        bus,
        Arc::new(CountingProcessor { calls: AtomicUsize::new(0) }),
        OrchestratorConfig { max_job_items: 100, ..test_config() },
    );
    let err = orchestrator.submit(items(101), None, "transaction").unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    let err = orchestrator.submit(Vec::new(), None, "transaction").unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}
