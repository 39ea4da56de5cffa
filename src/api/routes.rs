//! HTTP routes. Handlers validate, delegate to the core services and map
//! engine errors onto status codes; no business logic lives here.

use crate::batch::BatchOrchestrator;
use crate::cases::CaseService;
use crate::errors::EngineError;
use crate::events::forwarder::PushMessage;
use crate::events::EventBus;
use crate::graph::{CycleDetector, DigitAnalytics, OwnershipEngine};
use crate::ingest::{ColumnMapping, IngestKind, IngestionPipeline};
use crate::integrity::IntegrityRegistry;
use crate::models::*;
use crate::monitor::ProactiveMonitor;
use crate::reconcile::ReconciliationMatcher;
use crate::stats::AuditStatsService;
use crate::store::ForensicStore;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: ForensicStore,
    pub bus: Arc<EventBus>,
    pub pipeline: Arc<IngestionPipeline>,
    pub matcher: Arc<ReconciliationMatcher>,
    pub orchestrator: BatchOrchestrator,
    pub cases: Arc<CaseService>,
    pub cycles: Arc<CycleDetector>,
    pub ownership: Arc<OwnershipEngine>,
    pub analytics: Arc<DigitAnalytics>,
    pub monitor: Arc<ProactiveMonitor>,
    pub registry: Arc<IntegrityRegistry>,
    pub stats: Arc<AuditStatsService>,
    pub push: broadcast::Sender<PushMessage>,
}

struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Permanent(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({"error": self.0.to_string(), "kind": self.0.kind()})))
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/projects", post(create_project))
        .route("/api/ingest/:project_id/:kind", post(ingest))
        .route("/api/ingest/:project_id/seal/:ingestion_id", post(seal_ingestion))
        .route("/api/reconcile/:project_id/run", post(reconcile_run))
        .route("/api/reconcile/:project_id/settings", post(update_settings))
        .route("/api/reconcile/:project_id/suggested", get(reconcile_suggested))
        .route("/api/reconcile/:project_id/auto-confirm", post(reconcile_auto_confirm))
        .route("/api/reconcile/:project_id/confirm/:match_id", post(reconcile_confirm))
        .route("/api/reconcile/:project_id/stats", get(reconcile_stats))
        .route("/api/cases/:project_id", post(create_case))
        .route("/api/cases/:project_id/:case_id/exhibits", post(add_exhibit))
        .route("/api/cases/:project_id/:case_id/exhibits/:exhibit_id", patch(adjudicate_exhibit))
        .route("/api/cases/:project_id/:case_id/seal", post(seal_case))
        .route("/api/cases/:project_id/:case_id/dossier", get(compile_dossier))
        .route("/api/stats", get(global_stats))
        .route("/api/batch-jobs/submit", post(submit_job))
        .route("/api/batch-jobs", get(list_jobs))
        .route("/api/batch-jobs/:job_id", get(job_status))
        .route("/api/batch-jobs/:job_id/cancel", post(cancel_job))
        .route("/api/graph/:project_id/cycles", get(detect_cycles))
        .route("/api/graph/:project_id/benford", get(benford))
        .route("/api/graph/:project_id/structuring", get(structuring))
        .route("/api/graph/:project_id/cross-project", get(cross_project))
        .route("/api/graph/:project_id/nexus", get(asset_nexus))
        .route("/api/graph/velocity/:receiver", get(velocity))
        .route("/api/graph/ubo/:entity_id", get(resolve_ubo))
        .route("/api/alerts", get(run_monitor))
        .route("/api/telemetry/query", post(record_query))
        .route("/api/telemetry/query/:user_id/suggestions", get(query_suggestions))
        .route("/api/registry/verify/:hash", get(verify_hash))
        .route("/ws", get(websocket))
        // Bulk uploads are capped at 50 MB
        .layer(axum::extract::DefaultBodyLimit::max(50 * 1024 * 1024))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

#[derive(Deserialize)]
struct CreateProjectRequest {
    name: String,
    code: String,
    contract_value: f64,
    contractor_name: String,
    site_location: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

async fn create_project(
    State(state): State<AppState>,
    Json(request): Json<CreateProjectRequest>,
) -> ApiResult<Json<Project>> {
    let mut project = Project::new(
        &request.name,
        &request.code,
        request.contract_value,
        &request.contractor_name,
    );
    project.site_location = request.site_location;
    project.latitude = request.latitude;
    project.longitude = request.longitude;
    state.store.insert_project(&project)?;
    Ok(Json(project))
}

#[derive(Deserialize)]
struct IngestRequest {
    file_name: Option<String>,
    #[serde(default)]
    mappings: Vec<MappingSpec>,
    rows: Vec<Value>,
}

#[derive(Deserialize)]
struct MappingSpec {
    system_field: String,
    file_column: String,
    intent: Option<String>,
    label: Option<String>,
}

/// Row-shaped bulk ingestion. Mapped uploads run the pipeline directly and
/// report per-file results; unmapped uploads are queued through the batch
/// orchestrator and tracked by job id.
async fn ingest(
    State(state): State<AppState>,
    Path((project_id, kind)): Path<(String, String)>,
    Json(request): Json<IngestRequest>,
) -> ApiResult<Json<Value>> {
    let kind = match kind.as_str() {
        "ledger" => IngestKind::Ledger,
        "bank" | "statement" => IngestKind::Statement,
        other => {
            return Err(EngineError::Validation(format!("unknown ingest kind '{other}'")).into())
        }
    };
    if request.rows.is_empty() {
        return Err(EngineError::Validation("no rows provided".to_string()).into());
    }
    if request.rows.len() > 100_000 {
        return Err(
            EngineError::Validation("maximum 100,000 rows per file".to_string()).into()
        );
    }
    // The project must exist before we queue anything.
    state.store.get_project(&project_id)?;

    if !request.mappings.is_empty() {
        let mappings: Vec<ColumnMapping> = request
            .mappings
            .iter()
            .map(|m| {
                let mut mapping = ColumnMapping::new(&m.system_field, &m.file_column);
                mapping.intent = m.intent.clone();
                mapping.label = m.label.clone();
                mapping
            })
            .collect();
        let file_name = request.file_name.clone().unwrap_or_else(|| "upload".to_string());
        let rows = request.rows;
        let pid = project_id.clone();
        let pipeline = state.pipeline.clone();
        let report = tokio::task::spawn_blocking(move || {
            pipeline.ingest(&file_name, &pid, &mappings, &rows, kind)
        })
        .await
        .map_err(|e| EngineError::Transient(format!("ingest task failed: {e}")))??;
        return Ok(Json(json!({
            "status": "ingested",
            "ingestion_id": report.ingestion_id,
            "processed": report.processed,
            "ghost_transactions": report.ghost_transactions,
            "quality_score": report.quality_score,
            "warnings": report.warnings,
        })));
    }

    let data_type = match kind {
        IngestKind::Ledger => "transaction",
        IngestKind::Statement => "statement",
    };
    let job_id =
        state.orchestrator.submit(request.rows, Some(project_id.clone()), data_type)?;
    debug!(project = %project_id, job = %job_id, file = ?request.file_name, "Ingestion queued");
    Ok(Json(json!({"job_id": job_id, "status": "submitted"})))
}

async fn reconcile_run(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let state_clone = state.clone();
    let pid = project_id.clone();
    let (processed, flagged) =
        tokio::task::spawn_blocking(move || state_clone.matcher.run(&pid))
            .await
            .map_err(|e| EngineError::Transient(format!("scan task failed: {e}")))??;
    let suggest = {
        let state_clone = state.clone();
        let pid = project_id.clone();
        tokio::task::spawn_blocking(move || state_clone.matcher.suggest(&pid))
            .await
            .map_err(|e| EngineError::Transient(format!("suggest task failed: {e}")))??
    };
    Ok(Json(json!({
        "status": "success",
        "processed": processed,
        "forensic_flags": flagged,
        "suggested_matches": suggest.matches.len(),
        "skipped_pairs": suggest.skipped_pairs,
    })))
}

async fn reconcile_suggested(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<Vec<ReconciliationMatch>>> {
    let outcome = tokio::task::spawn_blocking(move || state.matcher.suggest(&project_id))
        .await
        .map_err(|e| EngineError::Transient(format!("suggest task failed: {e}")))??;
    if outcome.skipped_pairs > 0 {
        warn!(skipped = outcome.skipped_pairs, "Suggestion sweep skipped pairs");
    }
    Ok(Json(outcome.matches))
}

async fn reconcile_auto_confirm(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let summary = tokio::task::spawn_blocking(move || state.matcher.auto_confirm(&project_id))
        .await
        .map_err(|e| EngineError::Transient(format!("auto-confirm task failed: {e}")))??;
    Ok(Json(json!({
        "status": "success",
        "auto_confirmed": summary.confirmed,
        "flagged_for_review": summary.review,
        "flagged_for_investigation": summary.investigate,
    })))
}

async fn reconcile_confirm(
    State(state): State<AppState>,
    Path((_project_id, match_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let confirmed = tokio::task::spawn_blocking(move || state.matcher.confirm(&match_id))
        .await
        .map_err(|e| EngineError::Transient(format!("confirm task failed: {e}")))??;
    Ok(Json(json!({"status": "confirmed", "match_id": confirmed.id})))
}

async fn reconcile_stats(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.matcher.stats(&project_id)?))
}

#[derive(Deserialize)]
struct CreateCaseRequest {
    title: String,
    description: String,
}

async fn create_case(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(request): Json<CreateCaseRequest>,
) -> ApiResult<Json<Case>> {
    Ok(Json(state.cases.create_case(&project_id, &request.title, &request.description)?))
}

#[derive(Deserialize)]
struct AddExhibitRequest {
    evidence_type: String,
    evidence_id: String,
    label: String,
}

async fn add_exhibit(
    State(state): State<AppState>,
    Path((_project_id, case_id)): Path<(String, String)>,
    Json(request): Json<AddExhibitRequest>,
) -> ApiResult<Json<CaseExhibit>> {
    Ok(Json(state.cases.add_exhibit(
        &case_id,
        &request.evidence_type,
        &request.evidence_id,
        &request.label,
    )?))
}

#[derive(Deserialize)]
struct VerdictRequest {
    verdict: String,
    adjudicated_by: Option<String>,
}

async fn adjudicate_exhibit(
    State(state): State<AppState>,
    Path((_project_id, _case_id, exhibit_id)): Path<(String, String, String)>,
    Json(request): Json<VerdictRequest>,
) -> ApiResult<Json<CaseExhibit>> {
    let verdict = ExhibitVerdict::parse(&request.verdict)
        .ok_or_else(|| EngineError::Validation(format!("unknown verdict '{}'", request.verdict)))?;
    Ok(Json(state.cases.set_verdict(&exhibit_id, verdict, request.adjudicated_by.as_deref())?))
}

#[derive(Deserialize)]
struct SealRequestBody {
    /// Explicit report bytes; omitted means "compile and seal the dossier".
    report: Option<String>,
    sealed_by: String,
}

async fn seal_case(
    State(state): State<AppState>,
    Path((_project_id, case_id)): Path<(String, String)>,
    Json(request): Json<SealRequestBody>,
) -> ApiResult<Json<Case>> {
    let cases = state.cases.clone();
    let sealed = tokio::task::spawn_blocking(move || match request.report {
        Some(report) => cases.seal_case(&case_id, report.as_bytes(), &request.sealed_by),
        None => cases.seal_with_dossier(&case_id, &request.sealed_by),
    })
    .await
    .map_err(|e| EngineError::Transient(format!("seal task failed: {e}")))??;
    Ok(Json(sealed))
}

async fn compile_dossier(
    State(state): State<AppState>,
    Path((_project_id, case_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let package = tokio::task::spawn_blocking(move || state.cases.compile_dossier(&case_id))
        .await
        .map_err(|e| EngineError::Transient(format!("dossier task failed: {e}")))??;
    Ok(Json(package.document))
}

async fn global_stats(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let report = tokio::task::spawn_blocking(move || state.stats.global_stats())
        .await
        .map_err(|e| EngineError::Transient(format!("stats task failed: {e}")))??;
    Ok(Json(report))
}

#[derive(Deserialize)]
struct SubmitJobRequest {
    project_id: Option<String>,
    #[serde(default = "default_data_type")]
    data_type: String,
    items: Vec<Value>,
}

fn default_data_type() -> String {
    "transaction".to_string()
}

async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitJobRequest>,
) -> ApiResult<Json<Value>> {
    let count = request.items.len();
    let job_id =
        state.orchestrator.submit(request.items, request.project_id, &request.data_type)?;
    Ok(Json(json!({
        "job_id": job_id,
        "status": "submitted",
        "message": format!("Job queued with {} items", count),
    })))
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let job = state.orchestrator.status(&job_id)?;
    Ok(Json(json!({
        "id": job.id,
        "status": job.status.as_str(),
        "progress_percent": job.progress_percent(),
        "items_processed": job.items_processed,
        "items_failed": job.items_failed,
        "total_items": job.total_items,
        "total_batches": job.total_batches,
        "batches_completed": job.batches_completed,
        "success_rate": job.success_rate(),
        "error_message": job.error_message,
    })))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.orchestrator.cancel(&job_id)?;
    Ok(Json(json!({"status": "cancelled", "job_id": job_id})))
}

async fn detect_cycles(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let cycles = tokio::task::spawn_blocking(move || {
        state.cycles.detect(
            &project_id,
            crate::graph::cycles::DEFAULT_MIN_AMOUNT,
            crate::graph::cycles::DEFAULT_MAX_DEPTH,
        )
    })
    .await
    .map_err(|e| EngineError::Transient(format!("cycle task failed: {e}")))??;
    Ok(Json(json!({
        "cycles": cycles
            .iter()
            .map(|c| json!({
                "path": c.path,
                "depth": c.depth,
                "flow_amount": c.min_flow,
                "risk_score": c.risk_score,
            }))
            .collect::<Vec<_>>(),
    })))
}

async fn benford(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let report = tokio::task::spawn_blocking(move || state.analytics.benford_scan(&project_id))
        .await
        .map_err(|e| EngineError::Transient(format!("benford task failed: {e}")))??;
    Ok(Json(match report {
        Some(r) => json!({
            "deviation": r.deviation,
            "anomalous": r.is_anomalous(),
            "sample_size": r.sample_size,
        }),
        None => json!({"status": "no_data"}),
    }))
}

async fn resolve_ubo(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let owners = tokio::task::spawn_blocking(move || state.ownership.resolve_ubo(&entity_id))
        .await
        .map_err(|e| EngineError::Transient(format!("ubo task failed: {e}")))??;
    Ok(Json(json!({
        "owners": owners
            .iter()
            .map(|o| json!({
                "entity_id": o.entity_id,
                "name": o.name,
                "stake": o.stake,
                "control_type": o.control_type,
                "is_ubo_candidate": o.is_ubo_candidate,
                "path_depth": o.path_depth,
                "intermediate_company": o.intermediate_company,
            }))
            .collect::<Vec<_>>(),
    })))
}

async fn run_monitor(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let alerts = tokio::task::spawn_blocking(move || state.monitor.run(None))
        .await
        .map_err(|e| EngineError::Transient(format!("monitor task failed: {e}")))??;
    Ok(Json(json!({
        "alerts": alerts
            .iter()
            .map(|a| json!({
                "type": a.alert_type,
                "severity": a.severity.as_str(),
                "message": a.message,
                "project_id": a.project_id,
                "metadata": a.metadata,
            }))
            .collect::<Vec<_>>(),
    })))
}

#[derive(Deserialize)]
struct SealIngestionRequest {
    sealed_by: String,
}

/// Register an ingestion's file hash as a sealed transaction set.
async fn seal_ingestion(
    State(state): State<AppState>,
    Path((project_id, ingestion_id)): Path<(String, String)>,
    Json(request): Json<SealIngestionRequest>,
) -> ApiResult<Json<Value>> {
    let ingestion = state.store.get_ingestion(&ingestion_id)?;
    if ingestion.project_id != project_id {
        return Err(EngineError::NotFound(format!("ingestion {ingestion_id}")).into());
    }
    let entry = state.registry.seal_hash(
        &ingestion.file_hash,
        crate::integrity::SealRequest {
            project_id: &project_id,
            entity_type: SealedEntityType::TransactionSet,
            entity_id: &ingestion_id,
            sealed_by_id: &request.sealed_by,
        },
    )?;
    Ok(Json(json!({
        "status": "sealed",
        "file_hash": entry.file_hash,
        "anchor_id": entry.anchor_id,
    })))
}

#[derive(Deserialize)]
struct SettingsRequest {
    clearing_window_days: Option<i64>,
    amount_tolerance_percent: Option<f64>,
    batch_window_days: Option<i64>,
    auto_confirm_threshold: Option<f64>,
}

/// Tune the per-project matching sensitivity.
async fn update_settings(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(request): Json<SettingsRequest>,
) -> ApiResult<Json<ReconciliationSettings>> {
    state.store.get_project(&project_id)?;
    let mut settings = state.store.settings_for(&project_id)?;
    if let Some(days) = request.clearing_window_days {
        settings.clearing_window_days = days;
    }
    if let Some(tolerance) = request.amount_tolerance_percent {
        settings.amount_tolerance_percent = tolerance;
    }
    if let Some(days) = request.batch_window_days {
        settings.batch_window_days = days;
    }
    if let Some(threshold) = request.auto_confirm_threshold {
        settings.auto_confirm_threshold = threshold;
    }
    state.store.upsert_settings(&settings)?;
    Ok(Json(settings))
}

async fn list_jobs(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let jobs = state.store.list_jobs(None)?;
    let count_status = |status: JobStatus| jobs.iter().filter(|j| j.status == status).count();
    let attempted: usize = jobs.iter().map(|j| j.items_processed + j.items_failed).sum();
    let processed: usize = jobs.iter().map(|j| j.items_processed).sum();
    Ok(Json(json!({
        "jobs": jobs
            .iter()
            .map(|j| json!({
                "id": j.id,
                "project_id": j.project_id,
                "status": j.status.as_str(),
                "data_type": j.data_type,
                "progress_percent": j.progress_percent(),
                "total_items": j.total_items,
            }))
            .collect::<Vec<_>>(),
        "summary": {
            "total_jobs": jobs.len(),
            "by_status": {
                "pending": count_status(JobStatus::Pending),
                "processing": count_status(JobStatus::Processing),
                "completed": count_status(JobStatus::Completed),
                "failed": count_status(JobStatus::Failed),
                "cancelled": count_status(JobStatus::Cancelled),
            },
            "total_items_processed": processed,
            "average_success_rate": if attempted > 0 {
                processed as f64 / attempted as f64 * 100.0
            } else {
                0.0
            },
        },
    })))
}

async fn structuring(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let bursts = tokio::task::spawn_blocking(move || state.analytics.structuring_bursts(&project_id))
        .await
        .map_err(|e| EngineError::Transient(format!("structuring task failed: {e}")))??;
    Ok(Json(json!({"status": "burst_scan_complete", "bursts_found": bursts})))
}

async fn cross_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let loops =
        tokio::task::spawn_blocking(move || state.analytics.cross_project_circular(&project_id))
            .await
            .map_err(|e| EngineError::Transient(format!("cross-project task failed: {e}")))??;
    Ok(Json(json!({"status": "circular_scan_complete", "loops_found": loops})))
}

async fn asset_nexus(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let findings =
        tokio::task::spawn_blocking(move || state.ownership.asset_temporal_nexus(&project_id))
            .await
            .map_err(|e| EngineError::Transient(format!("nexus task failed: {e}")))??;
    Ok(Json(json!({
        "assets": findings
            .iter()
            .map(|f| json!({
                "asset_id": f.asset_id,
                "name": f.asset_name,
                "value": f.estimated_value,
                "frozen": f.is_frozen,
                "temporal_nexus": f.temporal_proximity,
            }))
            .collect::<Vec<_>>(),
    })))
}

async fn velocity(
    State(state): State<AppState>,
    Path(receiver): Path<String>,
) -> ApiResult<Json<Value>> {
    let profile = tokio::task::spawn_blocking(move || state.analytics.velocity_profile(&receiver))
        .await
        .map_err(|e| EngineError::Transient(format!("velocity task failed: {e}")))??;
    Ok(Json(match profile {
        Some(p) => json!({
            "entity": p.entity,
            "total_tx_30d": p.total_tx_30d,
            "max_daily_tx": p.max_daily_tx,
            "avg_daily_tx": p.avg_daily_tx,
            "structuring_attempts": p.structuring_attempts,
            "velocity_risk": p.velocity_risk,
        }),
        None => json!({"status": "no_data"}),
    }))
}

#[derive(Deserialize)]
struct QueryTelemetryRequest {
    user_id: String,
    project_id: Option<String>,
    query_text: String,
    #[serde(default = "default_intent")]
    intent_type: String,
    #[serde(default = "default_success")]
    was_successful: bool,
    page_context: Option<String>,
}

fn default_intent() -> String {
    "sql_query".to_string()
}

fn default_success() -> bool {
    true
}

/// Operator query telemetry: duplicate texts increment frequency; the top
/// patterns feed personalized suggestions.
async fn record_query(
    State(state): State<AppState>,
    Json(request): Json<QueryTelemetryRequest>,
) -> ApiResult<Json<Value>> {
    let pattern = UserQueryPattern {
        id: new_id(),
        user_id: request.user_id.clone(),
        project_id: request.project_id.clone(),
        query_text: request.query_text.clone(),
        intent_type: request.intent_type.clone(),
        was_successful: request.was_successful,
        query_frequency: 1,
        page_context: request.page_context.clone(),
        created_at: chrono::Utc::now(),
        last_executed_at: chrono::Utc::now(),
    };
    state.store.record_query_pattern(&pattern)?;
    state.bus.publish_with(
        crate::events::EventKind::SqlQueryExecuted,
        json!({
            "query_text": request.query_text,
            "intent_type": request.intent_type,
            "was_successful": request.was_successful,
        }),
        Some(request.user_id),
        request.project_id,
    );
    Ok(Json(json!({"status": "recorded"})))
}

async fn query_suggestions(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let patterns = state.store.top_query_patterns(&user_id, 5)?;
    Ok(Json(json!({
        "suggestions": patterns
            .iter()
            .map(|p| json!({
                "query_text": p.query_text,
                "intent_type": p.intent_type,
                "frequency": p.query_frequency,
            }))
            .collect::<Vec<_>>(),
    })))
}

async fn verify_hash(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> ApiResult<Json<Value>> {
    match state.registry.verify(&hash)? {
        Some(entry) => Ok(Json(json!({
            "verified": true,
            "entity_type": entry.entity_type.as_str(),
            "entity_id": entry.entity_id,
            "sealed_at": entry.sealed_at.to_rfc3339(),
        }))),
        None => Ok(Json(json!({"verified": false}))),
    }
}

/// Push channel: best-effort broadcast of forwarded engine events.
async fn websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.push.subscribe()))
}

async fn handle_socket(mut socket: WebSocket, mut events: broadcast::Receiver<PushMessage>) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(message) => {
                    let text = message.to_string();
                    if socket.send(Message::Text(text)).await.is_err() {
                        break; // client gone; drop, never retry
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "WebSocket client lagged; continuing");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                // Inbound traffic is only read to detect disconnects
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }
}
