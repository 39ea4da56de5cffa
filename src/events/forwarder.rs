//! Bridges engine events onto the push channel.
//!
//! Subscribers forward selected bus events into a `tokio::sync::broadcast`
//! channel that the WebSocket layer fans out to connected operators.
//! Broadcast is best-effort: a lagging or closed receiver is dropped, never
//! retried.

use crate::events::{Event, EventBus, EventKind};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::debug;

/// Message shape pushed to operator clients.
pub type PushMessage = serde_json::Value;

const FORWARDED: &[EventKind] = &[
    EventKind::HighRiskAlert,
    EventKind::ProactiveAlert,
    EventKind::TransactionMatched,
    EventKind::ReconciliationCompleted,
    EventKind::BatchJobCompleted,
    EventKind::BatchJobFailed,
    EventKind::CircularFlowDetected,
    EventKind::AnomalyDetected,
];

fn forward(sender: &broadcast::Sender<PushMessage>, event: &Event) {
    let message = json!({
        "type": event.type_name,
        "payload": event.data,
        "project_id": event.project_id,
        "timestamp": event.timestamp.to_rfc3339(),
    });
    // Send fails only when there are no receivers; that is fine.
    let _ = sender.send(message);
}

/// Subscribe the push forwarder on the bus. Returns the broadcast sender the
/// WebSocket handler clones per connection.
pub fn install(bus: &EventBus, capacity: usize) -> broadcast::Sender<PushMessage> {
    let (sender, _receiver) = broadcast::channel(capacity);
    for kind in FORWARDED {
        let tx = sender.clone();
        bus.subscribe(*kind, move |event| forward(&tx, event));
    }
    debug!(kinds = FORWARDED.len(), "📡 Push forwarder installed");
    sender
}
