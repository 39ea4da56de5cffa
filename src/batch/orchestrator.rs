//! Batch job orchestrator.
//!
//! A submitted job is split into batches sized by the optimizer. A bounded
//! pool of workers (tokio tasks behind a fair semaphore) consumes the batch
//! FIFO; each worker processes one batch atomically, retries transient
//! failures with exponential backoff and jitter, paces between completions,
//! and checks cancellation at batch boundaries.
//!
//! Progress counters are incremented atomically per completed batch; a
//! finalize step reconciles the per-batch sums against the job counters and
//! corrects to the authoritative sum before marking the job terminal.

use crate::batch::optimizer::BatchOptimizer;
use crate::errors::{EngineError, EngineResult};
use crate::events::{EventBus, EventKind};
use crate::models::{new_id, JobStatus, ProcessingJob};
use crate::store::ForensicStore;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Per-batch processing statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchStats {
    pub processed: usize,
    pub failed: usize,
}

/// The work a batch performs. Implementations are blocking (store-bound) and
/// are run on the blocking thread pool.
pub trait BatchProcessor: Send + Sync {
    fn process_batch(
        &self,
        project_id: Option<&str>,
        data_type: &str,
        items: &[Value],
    ) -> EngineResult<BatchStats>;
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_job_items: usize,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub soft_timeout: Duration,
    pub hard_timeout: Duration,
    /// Process-wide cap on concurrently running batch workers, shared by all
    /// jobs.
    pub global_worker_cap: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_job_items: 1_000_000,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(60),
            retry_max_delay: Duration::from_secs(600),
            soft_timeout: Duration::from_secs(240),
            hard_timeout: Duration::from_secs(300),
            global_worker_cap: 8,
        }
    }
}

struct JobHandle {
    cancelled: AtomicBool,
}

enum BatchOutcome {
    Completed(BatchStats),
    Failed(String),
    Cancelled,
}

enum RetryDecision {
    Retry,
    Terminal(BatchOutcome),
}

struct Inner {
    store: ForensicStore,
    bus: Arc<EventBus>,
    optimizer: BatchOptimizer,
    processor: Arc<dyn BatchProcessor>,
    config: OrchestratorConfig,
    handles: Mutex<HashMap<String, Arc<JobHandle>>>,
    global_slots: Arc<Semaphore>,
}

#[derive(Clone)]
pub struct BatchOrchestrator {
    inner: Arc<Inner>,
}

impl BatchOrchestrator {
    pub fn new(
        store: ForensicStore,
        bus: Arc<EventBus>,
        processor: Arc<dyn BatchProcessor>,
        config: OrchestratorConfig,
    ) -> Self {
        let global_slots = Arc::new(Semaphore::new(config.global_worker_cap.max(1)));
        Self {
            inner: Arc::new(Inner {
                store,
                bus,
                optimizer: BatchOptimizer::new(),
                processor,
                config,
                handles: Mutex::new(HashMap::new()),
                global_slots,
            }),
        }
    }

    /// Submit a dataset for batched processing. Returns the job id; the work
    /// runs on background tasks.
    pub fn submit(
        &self,
        items: Vec<Value>,
        project_id: Option<String>,
        data_type: &str,
    ) -> EngineResult<String> {
        if items.is_empty() {
            return Err(EngineError::Validation("no items provided".to_string()));
        }
        if items.len() > self.inner.config.max_job_items {
            return Err(EngineError::Validation(format!(
                "maximum {} items per job",
                self.inner.config.max_job_items
            )));
        }

        let batch_config = self.inner.optimizer.calculate(data_type, items.len());
        let batches: Vec<Vec<Value>> =
            items.chunks(batch_config.size).map(|c| c.to_vec()).collect();

        let job = ProcessingJob {
            id: new_id(),
            project_id: project_id.clone(),
            data_type: data_type.to_string(),
            status: JobStatus::Pending,
            total_items: items.len(),
            total_batches: batches.len(),
            batches_completed: 0,
            items_processed: 0,
            items_failed: 0,
            batch_config: batch_config.clone(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            retry_count: 0,
            worker_task_ids: HashMap::new(),
        };
        self.inner.store.insert_job(&job)?;
        let job_id = job.id.clone();

        info!(
            job = %job_id,
            items = job.total_items,
            batches = job.total_batches,
            batch_size = batch_config.size,
            concurrency = batch_config.concurrency,
            "📦 Batch job submitted"
        );

        let handle = Arc::new(JobHandle { cancelled: AtomicBool::new(false) });
        self.inner.handles.lock().insert(job_id.clone(), handle.clone());

        let this = self.clone();
        let spawn_project = project_id;
        let spawn_data_type = data_type.to_string();
        tokio::spawn(async move {
            this.run_job(job_id, spawn_project, spawn_data_type, batches, handle).await;
        });

        Ok(job.id)
    }

    pub fn status(&self, job_id: &str) -> EngineResult<ProcessingJob> {
        self.inner.store.get_job(job_id)
    }

    /// Cancel a job: queued batches are revoked and in-flight workers stop at
    /// the next batch boundary. Already-persisted items stay persisted.
    pub fn cancel(&self, job_id: &str) -> EngineResult<()> {
        let job = self.inner.store.get_job(job_id)?;
        if job.status.is_terminal() {
            return Err(EngineError::Conflict(format!(
                "job already {}",
                job.status.as_str()
            )));
        }
        if let Some(handle) = self.inner.handles.lock().get(job_id) {
            handle.cancelled.store(true, Ordering::SeqCst);
        }
        self.inner.store.set_job_status(job_id, JobStatus::Cancelled, None, Some(Utc::now()))?;
        info!(job = job_id, "🛑 Job cancelled");
        Ok(())
    }

    /// Prune terminal jobs older than seven days.
    pub fn prune_old_jobs(&self) -> EngineResult<usize> {
        self.inner.store.prune_terminal_jobs(Utc::now() - chrono::Duration::days(7))
    }

    async fn run_job(
        &self,
        job_id: String,
        project_id: Option<String>,
        data_type: String,
        batches: Vec<Vec<Value>>,
        handle: Arc<JobHandle>,
    ) {
        let total_batches = batches.len();
        let job = match self.inner.store.get_job(&job_id) {
            Ok(job) => job,
            Err(err) => {
                error!(job = %job_id, %err, "Job vanished before start");
                return;
            }
        };
        let concurrency = job.batch_config.concurrency.max(1);
        let delay = Duration::from_millis(job.batch_config.inter_batch_delay_ms);

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut join_set: JoinSet<BatchOutcome> = JoinSet::new();

        for (batch_index, batch) in batches.into_iter().enumerate() {
            let this = self.clone();
            let semaphore = semaphore.clone();
            let handle = handle.clone();
            let job_id = job_id.clone();
            let project_id = project_id.clone();
            let data_type = data_type.clone();
            join_set.spawn(async move {
                // Fair semaphore: batches start in FIFO order.
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return BatchOutcome::Cancelled,
                };
                // The global pool bounds workers across jobs.
                let _slot = match this.inner.global_slots.clone().acquire_owned().await {
                    Ok(slot) => slot,
                    Err(_) => return BatchOutcome::Cancelled,
                };
                if handle.cancelled.load(Ordering::SeqCst) {
                    return BatchOutcome::Cancelled;
                }
                let outcome = this
                    .run_batch(&job_id, project_id.as_deref(), &data_type, batch_index, batch, &handle)
                    .await;
                // Cooperative pacing between completions on this worker slot
                tokio::time::sleep(delay).await;
                outcome
            });
        }

        let mut fatal: Option<String> = None;
        let mut saw_cancel = false;
        let mut sums = BatchStats::default();
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(BatchOutcome::Completed(stats)) => {
                    sums.processed += stats.processed;
                    sums.failed += stats.failed;
                }
                Ok(BatchOutcome::Failed(message)) => fatal = Some(message),
                Ok(BatchOutcome::Cancelled) => saw_cancel = true,
                Err(join_err) => fatal = Some(format!("worker panicked: {join_err}")),
            }
        }

        self.finalize(&job_id, total_batches, sums, fatal, saw_cancel).await;
        self.inner.handles.lock().remove(&job_id);
    }

    async fn run_batch(
        &self,
        job_id: &str,
        project_id: Option<&str>,
        data_type: &str,
        batch_index: usize,
        batch: Vec<Value>,
        handle: &JobHandle,
    ) -> BatchOutcome {
        let batch_len = batch.len();
        let task_id = new_id();
        if let Err(err) = self.inner.store.record_worker_task(job_id, batch_index, &task_id) {
            warn!(job = job_id, batch = batch_index, %err, "Worker id not recorded");
        }

        // First pickup flips the job to processing and announces the start.
        match self.inner.store.mark_job_started(job_id, Utc::now()) {
            Ok(true) => {
                if let Ok(job) = self.inner.store.get_job(job_id) {
                    self.inner.bus.publish_with(
                        EventKind::BatchJobStarted,
                        json!({
                            "job_id": job_id,
                            "project_id": project_id,
                            "total_items": job.total_items,
                            "total_batches": job.total_batches,
                            "data_type": data_type,
                        }),
                        None,
                        project_id.map(String::from),
                    );
                }
            }
            Ok(false) => {}
            Err(err) => warn!(job = job_id, %err, "Job start transition failed"),
        }

        let mut attempt: u32 = 0;
        loop {
            if handle.cancelled.load(Ordering::SeqCst) {
                return BatchOutcome::Cancelled;
            }

            let processor = self.inner.processor.clone();
            let batch_clone = batch.clone();
            let project = project_id.map(String::from);
            let data_type_owned = data_type.to_string();
            let mut work = tokio::task::spawn_blocking(move || {
                processor.process_batch(project.as_deref(), &data_type_owned, &batch_clone)
            });

            // Soft timeout logs; hard timeout fails the attempt.
            let soft = self.inner.config.soft_timeout;
            let hard = self.inner.config.hard_timeout;
            let join_result = tokio::select! {
                result = &mut work => Some(result),
                _ = tokio::time::sleep(soft) => None,
            };
            let join_result = match join_result {
                Some(result) => result,
                None => {
                    warn!(job = job_id, batch = batch_index, "Batch past soft timeout");
                    match tokio::time::timeout(hard.saturating_sub(soft), &mut work).await {
                        Ok(result) => result,
                        Err(_) => {
                            work.abort();
                            let message = format!(
                                "batch {} exceeded hard timeout ({}s)",
                                batch_index,
                                hard.as_secs()
                            );
                            match self
                                .handle_batch_error(
                                    job_id,
                                    project_id,
                                    batch_index,
                                    batch_len,
                                    &mut attempt,
                                    EngineError::Transient(message),
                                )
                                .await
                            {
                                RetryDecision::Retry => continue,
                                RetryDecision::Terminal(outcome) => return outcome,
                            }
                        }
                    }
                }
            };

            let result = match join_result {
                Ok(result) => result,
                Err(join_err) => Err(EngineError::Permanent(format!(
                    "batch worker panicked: {join_err}"
                ))),
            };

            match result {
                Ok(stats) => {
                    if let Err(err) =
                        self.inner.store.record_batch_completion(job_id, stats.processed, stats.failed)
                    {
                        error!(job = job_id, batch = batch_index, %err, "Progress update failed");
                    }
                    return BatchOutcome::Completed(stats);
                }
                Err(err) => {
                    match self
                        .handle_batch_error(job_id, project_id, batch_index, batch_len, &mut attempt, err)
                        .await
                    {
                        RetryDecision::Retry => continue,
                        RetryDecision::Terminal(outcome) => return outcome,
                    }
                }
            }
        }
    }

    /// Decide between retry and fatal failure for one batch error.
    async fn handle_batch_error(
        &self,
        job_id: &str,
        project_id: Option<&str>,
        batch_index: usize,
        batch_len: usize,
        attempt: &mut u32,
        err: EngineError,
    ) -> RetryDecision {
        if err.is_transient() && *attempt < self.inner.config.max_retries {
            *attempt += 1;
            let _ = self.inner.store.bump_job_retry_count(job_id);
            let backoff = self.backoff_delay(*attempt);
            warn!(
                job = job_id,
                batch = batch_index,
                attempt = *attempt,
                delay_ms = backoff.as_millis() as u64,
                %err,
                "Transient batch failure; retrying"
            );
            tokio::time::sleep(backoff).await;
            return RetryDecision::Retry;
        }

        error!(job = job_id, batch = batch_index, %err, "Batch failed terminally");
        if matches!(err, EngineError::Permanent(_)) {
            self.inner.bus.publish_with(
                EventKind::SystemError,
                json!({"job_id": job_id, "batch_num": batch_index + 1, "error": err.to_string()}),
                None,
                project_id.map(String::from),
            );
        }
        // Failed batches still account their items so terminal jobs always
        // reconcile to total_batches.
        let _ = self.inner.store.record_batch_completion(job_id, 0, batch_len);
        let _ = self.inner.store.set_job_status(
            job_id,
            JobStatus::Failed,
            Some(&err.to_string()),
            None,
        );
        if let Ok(job) = self.inner.store.get_job(job_id) {
            self.inner.bus.publish_with(
                EventKind::BatchJobFailed,
                json!({
                    "job_id": job_id,
                    "project_id": project_id,
                    "batch_num": batch_index + 1,
                    "error": err.to_string(),
                    "items_processed": job.items_processed,
                    "items_failed": job.items_failed,
                }),
                None,
                project_id.map(String::from),
            );
        }
        RetryDecision::Terminal(BatchOutcome::Failed(err.to_string()))
    }

    /// Exponential backoff with jitter: base * 2^(attempt-1), capped, then
    /// jittered into [half, full].
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.inner.config.retry_base_delay;
        let cap = self.inner.config.retry_max_delay;
        let exp = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(cap);
        let half = capped / 2;
        let jitter_ms = if half.as_millis() > 0 {
            rand::thread_rng().gen_range(0..=half.as_millis() as u64)
        } else {
            0
        };
        half + Duration::from_millis(jitter_ms)
    }

    async fn finalize(
        &self,
        job_id: &str,
        total_batches: usize,
        sums: BatchStats,
        fatal: Option<String>,
        saw_cancel: bool,
    ) {
        let job = match self.inner.store.get_job(job_id) {
            Ok(job) => job,
            Err(err) => {
                error!(job = job_id, %err, "Finalize could not load job");
                return;
            }
        };

        if job.status == JobStatus::Cancelled || saw_cancel && fatal.is_none() {
            // Cancellation already recorded; counters reflect only confirmed
            // batch outcomes.
            if job.status != JobStatus::Cancelled {
                let _ = self.inner.store.set_job_status(
                    job_id,
                    JobStatus::Cancelled,
                    None,
                    Some(Utc::now()),
                );
            }
            return;
        }

        if let Some(message) = fatal {
            let _ = self.inner.store.set_job_status(
                job_id,
                JobStatus::Failed,
                Some(&message),
                Some(Utc::now()),
            );
            return;
        }

        // Reconcile: the per-batch sums are authoritative.
        if job.batches_completed != total_batches {
            warn!(
                job = job_id,
                recorded = job.batches_completed,
                expected = total_batches,
                "Batch count mismatch at finalize"
            );
        }
        if job.items_processed != sums.processed || job.items_failed != sums.failed {
            warn!(
                job = job_id,
                counter_processed = job.items_processed,
                counter_failed = job.items_failed,
                sum_processed = sums.processed,
                sum_failed = sums.failed,
                "Item accounting mismatch at finalize; correcting to batch sums"
            );
            let _ = self.inner.store.set_job_counts(job_id, sums.processed, sums.failed);
        }
        let completed_at = Utc::now();
        let _ = self.inner.store.set_job_status(
            job_id,
            JobStatus::Completed,
            None,
            Some(completed_at),
        );
        let job = match self.inner.store.get_job(job_id) {
            Ok(job) => job,
            Err(_) => return,
        };
        let duration_seconds = job
            .started_at
            .map(|started| (completed_at - started).num_milliseconds() as f64 / 1000.0);
        info!(
            job = job_id,
            processed = job.items_processed,
            failed = job.items_failed,
            success_rate = job.success_rate(),
            "✅ Batch job completed"
        );
        self.inner.bus.publish_with(
            EventKind::BatchJobCompleted,
            json!({
                "job_id": job_id,
                "project_id": job.project_id,
                "total_processed": job.items_processed,
                "total_failed": job.items_failed,
                "success_rate": job.success_rate(),
                "duration_seconds": duration_seconds,
            }),
            None,
            job.project_id.clone(),
        );
    }
}
