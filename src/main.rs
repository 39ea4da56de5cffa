//! LedgerHawk - Forensic Audit Analytics Engine
//! Ledgers in, evidence-grade findings out.
//!
//! Wires the engine services into an axum server: ingestion, reconciliation,
//! trigger battery, graph analytics, batch orchestration, proactive
//! monitoring, sealed-artifact registry and the WebSocket push channel.

use anyhow::{Context, Result};
use clap::Parser;
use ledgerhawk_backend::api::{router, AppState};
use ledgerhawk_backend::batch::{BatchOrchestrator, OrchestratorConfig};
use ledgerhawk_backend::cases::CaseService;
use ledgerhawk_backend::entity::EntityResolver;
use ledgerhawk_backend::events::{forwarder, EventBus};
use ledgerhawk_backend::graph::{CycleDetector, DigitAnalytics, OwnershipEngine};
use ledgerhawk_backend::ingest::IngestionPipeline;
use ledgerhawk_backend::integrity::IntegrityRegistry;
use ledgerhawk_backend::models::Config;
use ledgerhawk_backend::monitor::ProactiveMonitor;
use ledgerhawk_backend::stats::AuditStatsService;
use ledgerhawk_backend::reconcile::{
    CurrencyService, LexicalSemanticService, ReconciliationMatcher, SemanticService,
};
use ledgerhawk_backend::store::ForensicStore;
use ledgerhawk_backend::triggers::TriggerEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "ledgerhawk", about = "Forensic audit analytics engine")]
struct Args {
    /// Override DATABASE_PATH
    #[arg(long)]
    database: Option<String>,
    /// Override PORT
    #[arg(long)]
    port: Option<u16>,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ledgerhawk_backend=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let args = Args::parse();
    let mut config = Config::from_env().context("load configuration")?;
    if let Some(database) = args.database {
        config.database_path = database;
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    info!("🦅 LedgerHawk Forensic Engine starting");

    let store = ForensicStore::open(&config.database_path)
        .map_err(|e| anyhow::anyhow!("open store: {e}"))?;
    let bus = Arc::new(EventBus::new());
    let push = forwarder::install(&bus, 256);

    let resolver = Arc::new(EntityResolver::new(store.clone()));
    let triggers = Arc::new(TriggerEngine::new(store.clone(), bus.clone()));
    let semantic: Arc<dyn SemanticService> = Arc::new(LexicalSemanticService::new());
    let currency = Arc::new(CurrencyService::default());

    let pipeline = Arc::new(IngestionPipeline::new(
        store.clone(),
        bus.clone(),
        resolver.clone(),
        triggers.clone(),
        semantic.clone(),
        config.balance_gap_threshold,
    ));
    let matcher = Arc::new(ReconciliationMatcher::new(
        store.clone(),
        bus.clone(),
        triggers.clone(),
        currency,
        semantic.clone(),
    ));

    let orchestrator = BatchOrchestrator::new(
        store.clone(),
        bus.clone(),
        pipeline.clone(),
        OrchestratorConfig {
            max_job_items: config.max_job_items,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(config.retry_base_delay_secs),
            retry_max_delay: Duration::from_secs(config.retry_max_delay_secs),
            soft_timeout: Duration::from_secs(config.batch_soft_timeout_secs),
            hard_timeout: Duration::from_secs(config.batch_hard_timeout_secs),
            global_worker_cap: config.worker_pool_cap,
        },
    );

    let registry = Arc::new(IntegrityRegistry::new(store.clone(), None));
    let cases = Arc::new(CaseService::new(store.clone(), bus.clone(), registry.clone()));
    let cycles = Arc::new(CycleDetector::new(store.clone(), bus.clone()));
    let ownership = Arc::new(OwnershipEngine::new(store.clone(), bus.clone()));
    let analytics = Arc::new(DigitAnalytics::new(store.clone(), bus.clone()));
    let stats = Arc::new(AuditStatsService::new(store.clone()));

    // Proactive monitor: periodic timer plus reactive bus subscriptions
    let monitor = Arc::new(ProactiveMonitor::new(store.clone(), bus.clone()));
    let reactive_events = ProactiveMonitor::attach(&bus);
    monitor.clone().spawn_reactive(reactive_events);
    monitor.clone().spawn_periodic(config.monitor_interval_secs);

    // Daily job-table maintenance
    {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
            loop {
                ticker.tick().await;
                match orchestrator.prune_old_jobs() {
                    Ok(count) if count > 0 => info!(count, "🧹 Old jobs pruned"),
                    Ok(_) => {}
                    Err(err) => tracing::warn!(%err, "Job pruning degraded"),
                }
            }
        });
    }

    let state = AppState {
        store,
        bus,
        pipeline,
        matcher,
        orchestrator,
        cases,
        cycles,
        ownership,
        analytics,
        monitor,
        registry,
        stats,
        push,
    };

    let app = router(state).layer(CorsLayer::permissive()).layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await.context("bind listener")?;
    info!(%addr, "🚀 Operator API listening");
    axum::serve(listener, app).await.context("serve")?;
    Ok(())
}
