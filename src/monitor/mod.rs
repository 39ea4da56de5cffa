//! Proactive monitoring: periodic checks plus reactive bus subscriptions
//! producing operator alerts.
//!
//! Bus handlers never do work inline: they enqueue the event onto an
//! unbounded channel drained by a dedicated task, keeping publishers
//! unblocked. Alerts are deduplicated per (scope, type, project) with a
//! five-minute debounce and a 50-entry ring buffer per bucket.

use crate::errors::EngineResult;
use crate::events::{Event, EventBus, EventKind};
use crate::geo;
use crate::models::*;
use crate::store::{ForensicStore, TransactionFilter};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const HIGH_RISK_THRESHOLD: f64 = 0.9;
const GPS_HIGH_KM: f64 = 50.0;
const GPS_CRITICAL_KM: f64 = 200.0;
const RECON_GAP_RATIO: f64 = 0.15;
const PATTERN_CRITICAL: f64 = 0.85;
const PATTERN_WARNING: f64 = 0.7;
const DEBOUNCE_SECS: i64 = 300;
const BUCKET_CAP: usize = 50;
const DB_ALERT_MERGE_LIMIT: usize = 10;

/// One operator-facing alert.
#[derive(Debug, Clone)]
pub struct MonitorAlert {
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub project_id: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl MonitorAlert {
    fn new(alert_type: &str, severity: AlertSeverity, message: String) -> Self {
        Self {
            alert_type: alert_type.to_string(),
            severity,
            message,
            project_id: None,
            metadata: Value::Null,
            created_at: Utc::now(),
        }
    }

    fn for_project(mut self, project_id: Option<&str>) -> Self {
        self.project_id = project_id.map(String::from);
        self
    }

    fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

type BucketKey = (String, String); // (alert_type, project-or-global)

pub struct ProactiveMonitor {
    store: ForensicStore,
    bus: Arc<EventBus>,
    buckets: Mutex<HashMap<BucketKey, VecDeque<DateTime<Utc>>>>,
}

impl ProactiveMonitor {
    pub fn new(store: ForensicStore, bus: Arc<EventBus>) -> Self {
        Self { store, bus, buckets: Mutex::new(HashMap::new()) }
    }

    /// Run all periodic checks. Returns the alerts that survived the
    /// debounce; each is persisted and published as `proactive.alert`.
    pub fn run(&self, project_id: Option<&str>) -> EngineResult<Vec<MonitorAlert>> {
        let mut alerts = Vec::new();

        // Persisted alerts merge in first so operators see stored triggers
        for stored in self.store.recent_fraud_alerts(project_id, DB_ALERT_MERGE_LIMIT)? {
            alerts.push(
                MonitorAlert::new(&stored.alert_type, stored.severity, stored.description.clone())
                    .for_project(stored.project_id.as_deref())
                    .with_metadata(json!({"transaction_id": stored.transaction_id})),
            );
        }

        if let Some(alert) = self.check_high_risk(project_id)? {
            alerts.push(alert);
        }
        alerts.extend(self.check_gps_anomalies(project_id)?);

        let survivors = self.admit_and_emit(alerts);
        Ok(survivors)
    }

    /// High-risk rows in the last hour collapse into one summary alert.
    fn check_high_risk(&self, project_id: Option<&str>) -> EngineResult<Option<MonitorAlert>> {
        let one_hour_ago = Utc::now() - Duration::hours(1);
        let rows = self.store.query_transactions(&TransactionFilter {
            project_id: project_id.map(String::from),
            min_risk: Some(HIGH_RISK_THRESHOLD),
            since: Some(one_hour_ago),
            ..Default::default()
        })?;
        if rows.is_empty() {
            return Ok(None);
        }
        let total: f64 = rows.iter().map(|t| t.actual_amount).sum();
        let alert = MonitorAlert::new(
            "high_risk_transaction",
            AlertSeverity::Critical,
            format!("🚨 {} high-risk transactions detected in the last hour", rows.len()),
        )
        .for_project(project_id)
        .with_metadata(json!({"count": rows.len(), "total_amount": total}));

        let mut persisted = FraudAlert::new(
            "high_risk_transaction",
            AlertSeverity::Critical,
            &alert.message,
        );
        persisted.project_id = project_id.map(String::from);
        persisted.risk_score = rows.iter().map(|t| t.risk_score).fold(0.0, f64::max);
        self.store.insert_fraud_alert(&persisted)?;
        Ok(Some(alert))
    }

    /// Transactions logged far from their project site.
    fn check_gps_anomalies(&self, project_filter: Option<&str>) -> EngineResult<Vec<MonitorAlert>> {
        let projects: Vec<Project> = match project_filter {
            Some(id) => vec![self.store.get_project(id)?],
            None => self.store.list_projects()?,
        };
        let mut alerts = Vec::new();
        for project in projects {
            let (site_lat, site_lon) = match (project.latitude, project.longitude) {
                (Some(lat), Some(lon)) => (lat, lon),
                _ => continue,
            };
            let rows = self.store.query_transactions(&TransactionFilter {
                project_id: Some(project.id.clone()),
                with_coordinates: true,
                ..Default::default()
            })?;
            for tx in rows {
                let (lat, lon) = match (tx.latitude, tx.longitude) {
                    (Some(lat), Some(lon)) => (lat, lon),
                    _ => continue,
                };
                let distance = geo::haversine_km(lat, lon, site_lat, site_lon);
                if distance > GPS_HIGH_KM {
                    let severity = if distance > GPS_CRITICAL_KM {
                        AlertSeverity::Critical
                    } else {
                        AlertSeverity::High
                    };
                    alerts.push(
                        MonitorAlert::new(
                            "gps_anomaly",
                            severity,
                            format!(
                                "🚩 GPS Anomaly: Transaction {} was logged {:.1}km from the project site.",
                                &tx.id[..8.min(tx.id.len())],
                                distance
                            ),
                        )
                        .for_project(Some(&project.id))
                        .with_metadata(json!({"distance_km": distance, "tx_id": tx.id})),
                    );
                }
            }
        }
        Ok(alerts)
    }

    /// Reactive handler for one bus event.
    pub fn handle_event(&self, event: &Event) -> EngineResult<Vec<MonitorAlert>> {
        let mut alerts = Vec::new();
        match event.kind {
            EventKind::ReconciliationCompleted => {
                if let Some(project_id) = event.project_id.as_deref() {
                    if let Some(alert) = self.check_reconciliation_gap(project_id)? {
                        alerts.push(alert);
                    }
                }
            }
            EventKind::PatternIdentified => {
                let risk = event.data.get("risk_level").and_then(|v| v.as_f64()).unwrap_or(0.0);
                if risk > PATTERN_WARNING {
                    let severity = if risk > PATTERN_CRITICAL {
                        AlertSeverity::Critical
                    } else {
                        AlertSeverity::Medium
                    };
                    alerts.push(
                        MonitorAlert::new(
                            "pattern_identified",
                            severity,
                            format!("Pattern identified with risk level {:.2}", risk),
                        )
                        .for_project(event.project_id.as_deref())
                        .with_metadata(event.data.clone()),
                    );
                }
            }
            EventKind::BatchJobFailed => {
                alerts.push(
                    MonitorAlert::new(
                        "batch_job_failed",
                        AlertSeverity::Medium,
                        format!(
                            "Batch job {} failed: {}",
                            event.data.get("job_id").and_then(|v| v.as_str()).unwrap_or("?"),
                            event.data.get("error").and_then(|v| v.as_str()).unwrap_or("unknown")
                        ),
                    )
                    .for_project(event.project_id.as_deref())
                    .with_metadata(json!({
                        "job_id": event.data.get("job_id"),
                        "actions": ["retry", "inspect_logs"],
                    })),
                );
            }
            _ => {}
        }
        Ok(self.admit_and_emit(alerts))
    }

    /// Unmatched ledger ratio after a reconciliation pass.
    fn check_reconciliation_gap(&self, project_id: &str) -> EngineResult<Option<MonitorAlert>> {
        let all = self.store.list_transactions(project_id)?;
        if all.is_empty() {
            return Ok(None);
        }
        let matched =
            all.iter().filter(|t| t.status == TransactionStatus::Matched).count();
        let unmatched_ratio = (all.len() - matched) as f64 / all.len() as f64;
        if unmatched_ratio > RECON_GAP_RATIO {
            return Ok(Some(
                MonitorAlert::new(
                    "reconciliation_gap",
                    AlertSeverity::Medium,
                    format!(
                        "Reconciliation gap: {:.1}% of ledger rows remain unmatched",
                        unmatched_ratio * 100.0
                    ),
                )
                .for_project(Some(project_id))
                .with_metadata(json!({
                    "total": all.len(),
                    "matched": matched,
                    "unmatched_ratio": unmatched_ratio,
                })),
            ));
        }
        Ok(None)
    }

    /// Debounce + ring buffer admission, then emit the survivors.
    fn admit_and_emit(&self, alerts: Vec<MonitorAlert>) -> Vec<MonitorAlert> {
        let mut admitted = Vec::new();
        let mut buckets = self.buckets.lock();
        for alert in alerts {
            let key: BucketKey = (
                alert.alert_type.clone(),
                alert.project_id.clone().unwrap_or_else(|| "global".to_string()),
            );
            let bucket = buckets.entry(key).or_default();
            if let Some(last) = bucket.back() {
                if (alert.created_at - *last).num_seconds() < DEBOUNCE_SECS {
                    debug!(alert_type = %alert.alert_type, "Alert debounced");
                    continue;
                }
            }
            if bucket.len() >= BUCKET_CAP {
                bucket.pop_front();
            }
            bucket.push_back(alert.created_at);

            self.bus.publish_with(
                EventKind::ProactiveAlert,
                json!({
                    "alert_type": alert.alert_type,
                    "severity": alert.severity.as_str(),
                    "message": alert.message,
                    "metadata": alert.metadata,
                }),
                None,
                alert.project_id.clone(),
            );
            if alert.severity == AlertSeverity::Critical {
                self.bus.publish_with(
                    EventKind::HighRiskAlert,
                    json!({
                        "alert_type": alert.alert_type,
                        "message": alert.message,
                        "metadata": alert.metadata,
                    }),
                    None,
                    alert.project_id.clone(),
                );
            }
            admitted.push(alert);
        }
        admitted
    }

    /// Register reactive subscriptions. Handlers enqueue; the returned
    /// receiver is drained by `spawn_reactive`.
    pub fn attach(bus: &EventBus) -> mpsc::UnboundedReceiver<Event> {
        let (sender, receiver) = mpsc::unbounded_channel();
        for kind in [
            EventKind::ReconciliationCompleted,
            EventKind::PatternIdentified,
            EventKind::BatchJobFailed,
        ] {
            let tx = sender.clone();
            bus.subscribe(kind, move |event| {
                let _ = tx.send(event.clone());
            });
        }
        receiver
    }

    /// Drain reactive events on a dedicated task.
    pub fn spawn_reactive(self: Arc<Self>, mut receiver: mpsc::UnboundedReceiver<Event>) {
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let monitor = self.clone();
                let result =
                    tokio::task::spawn_blocking(move || monitor.handle_event(&event)).await;
                match result {
                    Ok(Ok(alerts)) if !alerts.is_empty() => {
                        info!(count = alerts.len(), "🔔 Reactive alerts emitted");
                    }
                    Ok(Err(err)) => warn!(%err, "Reactive check degraded"),
                    Err(join_err) => warn!(%join_err, "Reactive check panicked"),
                    _ => {}
                }
            }
        });
    }

    /// Periodic loop: run every `interval_secs` until the process exits.
    /// Each tick also publishes a system health check.
    pub fn spawn_periodic(self: Arc<Self>, interval_secs: u64) {
        tokio::spawn(async move {
            let optimizer = crate::batch::BatchOptimizer::new();
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
            loop {
                ticker.tick().await;

                let (health, resources) = optimizer.health_status();
                self.bus.publish(
                    EventKind::SystemHealthCheck,
                    json!({
                        "status": health,
                        "cpu_percent": resources.cpu_percent,
                        "memory_available_gb": resources.memory_available_gb,
                    }),
                );
                if health != "healthy" {
                    self.bus.publish(
                        EventKind::SystemPerformance,
                        json!({"status": health, "cpu_percent": resources.cpu_percent}),
                    );
                }

                let monitor = self.clone();
                let result = tokio::task::spawn_blocking(move || monitor.run(None)).await;
                match result {
                    Ok(Ok(alerts)) if !alerts.is_empty() => {
                        info!(count = alerts.len(), "🔔 Periodic monitor alerts");
                    }
                    Ok(Err(err)) => warn!(%err, "Periodic monitor degraded"),
                    Err(join_err) => warn!(%join_err, "Periodic monitor panicked"),
                    _ => {}
                }
            }
        });
    }
}
