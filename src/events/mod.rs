//! In-process pub/sub backbone.
//!
//! Delivery is synchronous on the publisher's thread, in publish order; a
//! single publish lock serializes concurrent publishers. Handler panics are
//! caught and logged, never propagated to the publisher. Handlers must not
//! block: offload real work to a background executor.
//!
//! A ring buffer retains the last 1000 events for `recent()` queries.

pub mod forwarder;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error};

const MAX_EVENT_LOG: usize = 1000;

/// All system events that can be published. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    // Ingestion
    DataUploaded,
    DataValidated,
    DataIngested,
    BatchJobStarted,
    BatchJobCompleted,
    BatchJobFailed,
    // Reconciliation
    TransactionMatched,
    VarianceDetected,
    ReconciliationCompleted,
    // Investigation
    CaseCreated,
    CaseClosed,
    EvidenceAdded,
    EvidenceVerified,
    // Fraud detection
    AnomalyDetected,
    RiskUpdated,
    PatternIdentified,
    HighRiskAlert,
    CircularFlowDetected,
    CorrelationFound,
    // AI
    AiInsight,
    ProactiveAlert,
    SqlQueryExecuted,
    // User
    UserLogin,
    UserLogout,
    PageViewed,
    ActionPerformed,
    // System
    SystemHealthCheck,
    SystemError,
    SystemPerformance,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::DataUploaded => "data.uploaded",
            EventKind::DataValidated => "data.validated",
            EventKind::DataIngested => "data.ingested",
            EventKind::BatchJobStarted => "batch.job.started",
            EventKind::BatchJobCompleted => "batch.job.completed",
            EventKind::BatchJobFailed => "batch.job.failed",
            EventKind::TransactionMatched => "transaction.matched",
            EventKind::VarianceDetected => "variance.detected",
            EventKind::ReconciliationCompleted => "reconciliation.completed",
            EventKind::CaseCreated => "case.created",
            EventKind::CaseClosed => "case.closed",
            EventKind::EvidenceAdded => "evidence.added",
            EventKind::EvidenceVerified => "evidence.verified",
            EventKind::AnomalyDetected => "anomaly.detected",
            EventKind::RiskUpdated => "risk.updated",
            EventKind::PatternIdentified => "pattern.identified",
            EventKind::HighRiskAlert => "high_risk.alert",
            EventKind::CircularFlowDetected => "circular_flow.detected",
            EventKind::CorrelationFound => "correlation.found",
            EventKind::AiInsight => "ai.insight",
            EventKind::ProactiveAlert => "proactive.alert",
            EventKind::SqlQueryExecuted => "sql.query.executed",
            EventKind::UserLogin => "user.login",
            EventKind::UserLogout => "user.logout",
            EventKind::PageViewed => "page.viewed",
            EventKind::ActionPerformed => "action.performed",
            EventKind::SystemHealthCheck => "system.health_check",
            EventKind::SystemError => "system.error",
            EventKind::SystemPerformance => "system.performance",
        }
    }
}

/// Event container with metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    #[serde(rename = "type")]
    pub type_name: String,
    pub data: Value,
    pub user_id: Option<String>,
    pub project_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self {
            kind,
            type_name: kind.as_str().to_string(),
            data,
            user_id: None,
            project_id: None,
            timestamp: Utc::now(),
        }
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync + 'static>;

/// Central event bus. Modules publish; subscribers (monitor, forwarders,
/// audit hooks) react.
pub struct EventBus {
    /// Handler registration is copy-on-write: publish clones the Arc'd
    /// vectors and runs outside the registry lock.
    subscribers: RwLock<HashMap<EventKind, Arc<Vec<Handler>>>>,
    global_subscribers: RwLock<Arc<Vec<Handler>>>,
    event_log: Mutex<VecDeque<Event>>,
    publish_lock: Mutex<()>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            global_subscribers: RwLock::new(Arc::new(Vec::new())),
            event_log: Mutex::new(VecDeque::with_capacity(MAX_EVENT_LOG)),
            publish_lock: Mutex::new(()),
        }
    }

    /// Subscribe to a specific event type.
    pub fn subscribe(&self, kind: EventKind, handler: impl Fn(&Event) + Send + Sync + 'static) {
        let mut map = self.subscribers.write();
        let entry = map.entry(kind).or_insert_with(|| Arc::new(Vec::new()));
        let mut handlers = entry.as_ref().clone();
        handlers.push(Arc::new(handler));
        *entry = Arc::new(handlers);
        debug!(event = kind.as_str(), "Subscriber registered");
    }

    /// Subscribe to ALL events (global listener).
    pub fn subscribe_all(&self, handler: impl Fn(&Event) + Send + Sync + 'static) {
        let mut global = self.global_subscribers.write();
        let mut handlers = global.as_ref().clone();
        handlers.push(Arc::new(handler));
        *global = Arc::new(handlers);
        debug!("Global subscriber registered");
    }

    /// Publish an event to all subscribers, synchronously and in order.
    pub fn publish(&self, kind: EventKind, data: Value) {
        self.publish_with(kind, data, None, None)
    }

    pub fn publish_with(
        &self,
        kind: EventKind,
        data: Value,
        user_id: Option<String>,
        project_id: Option<String>,
    ) {
        let mut event = Event::new(kind, data);
        event.user_id = user_id;
        event.project_id = project_id;

        // Serialize publishers so per-subscriber delivery order matches
        // publish order even under concurrent publishing.
        let _publish_guard = self.publish_lock.lock();

        {
            let mut log = self.event_log.lock();
            if log.len() >= MAX_EVENT_LOG {
                log.pop_front();
            }
            log.push_back(event.clone());
        }

        let typed: Option<Arc<Vec<Handler>>> = self.subscribers.read().get(&kind).cloned();
        let global: Arc<Vec<Handler>> = self.global_subscribers.read().clone();

        if let Some(handlers) = typed {
            for handler in handlers.iter() {
                Self::invoke(handler, &event);
            }
        }
        for handler in global.iter() {
            Self::invoke(handler, &event);
        }
    }

    fn invoke(handler: &Handler, event: &Event) {
        let result = catch_unwind(AssertUnwindSafe(|| handler(event)));
        if result.is_err() {
            error!(event = event.kind.as_str(), "Event handler panicked; continuing");
        }
    }

    /// Recent events, newest first, with optional filters.
    pub fn recent(
        &self,
        kind: Option<EventKind>,
        project_id: Option<&str>,
        limit: usize,
    ) -> Vec<Event> {
        let log = self.event_log.lock();
        log.iter()
            .rev()
            .filter(|e| kind.map(|k| e.kind == k).unwrap_or(true))
            .filter(|e| {
                project_id
                    .map(|p| e.project_id.as_deref() == Some(p))
                    .unwrap_or(true)
            })
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn log_len(&self) -> usize {
        self.event_log.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn typed_and_global_subscribers_both_fire() {
        let bus = EventBus::new();
        let typed_hits = Arc::new(AtomicUsize::new(0));
        let global_hits = Arc::new(AtomicUsize::new(0));

        let t = typed_hits.clone();
        bus.subscribe(EventKind::AnomalyDetected, move |_| {
            t.fetch_add(1, Ordering::SeqCst);
        });
        let g = global_hits.clone();
        bus.subscribe_all(move |_| {
            g.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(EventKind::AnomalyDetected, json!({"risk_score": 0.95}));
        bus.publish(EventKind::CaseCreated, json!({"case_id": "c-1"}));

        assert_eq!(typed_hits.load(Ordering::SeqCst), 1);
        assert_eq!(global_hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn handler_panic_does_not_reach_publisher() {
        let bus = EventBus::new();
        let after = Arc::new(AtomicUsize::new(0));
        bus.subscribe(EventKind::SystemError, |_| panic!("boom"));
        let a = after.clone();
        bus.subscribe(EventKind::SystemError, move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(EventKind::SystemError, json!({}));
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ring_buffer_caps_at_1000() {
        let bus = EventBus::new();
        for i in 0..1100 {
            bus.publish(EventKind::PageViewed, json!({"seq": i}));
        }
        assert_eq!(bus.log_len(), 1000);
        let recent = bus.recent(None, None, 1);
        assert_eq!(recent[0].data["seq"], 1099);
    }

    #[test]
    fn recent_filters_by_kind_and_project() {
        let bus = EventBus::new();
        bus.publish_with(
            EventKind::TransactionMatched,
            json!({"match_id": "m1"}),
            None,
            Some("p1".to_string()),
        );
        bus.publish_with(
            EventKind::TransactionMatched,
            json!({"match_id": "m2"}),
            None,
            Some("p2".to_string()),
        );
        bus.publish(EventKind::CaseClosed, json!({}));

        let hits = bus.recent(Some(EventKind::TransactionMatched), Some("p1"), 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].data["match_id"], "m1");
    }

    #[test]
    fn delivery_preserves_publish_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        bus.subscribe_all(move |e| {
            s.lock().push(e.data["seq"].as_i64().unwrap());
        });
        for i in 0..20 {
            bus.publish(EventKind::ActionPerformed, json!({"seq": i}));
        }
        assert_eq!(*seen.lock(), (0..20).collect::<Vec<i64>>());
    }
}
