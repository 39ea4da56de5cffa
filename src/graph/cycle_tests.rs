//! Cycle detection correctness: depth bounds, min-flow, order independence.

use crate::events::{EventBus, EventKind};
use crate::graph::cycles::{CycleDetector, DEFAULT_MAX_DEPTH, DEFAULT_MIN_AMOUNT};
use crate::models::{Project, Transaction};
use crate::store::ForensicStore;
use std::sync::Arc;

fn tx(project: &str, sender: &str, receiver: &str, amount: f64) -> Transaction {
    Transaction::new(project, 0.0, amount, sender, receiver)
}

#[test]
fn triangle_cycle_detected_with_min_flow() {
    let rows = vec![
        tx("p", "A", "B", 50_000_000.0),
        tx("p", "B", "C", 48_000_000.0),
        tx("p", "C", "A", 45_000_000.0),
    ];
    let cycles = CycleDetector::detect_in(&rows, DEFAULT_MIN_AMOUNT, DEFAULT_MAX_DEPTH);
    assert_eq!(cycles.len(), 1);
    let cycle = &cycles[0];
    assert_eq!(cycle.depth, 3);
    assert_eq!(cycle.min_flow, 45_000_000.0);
    assert!(cycle.risk_score >= 0.90, "risk {}", cycle.risk_score);
    assert_eq!(cycle.path.first(), cycle.path.last());
    assert_eq!(cycle.path.len(), 4);
}

#[test]
fn two_node_round_trip_scores_075() {
    let rows = vec![tx("p", "A", "B", 20_000_000.0), tx("p", "B", "A", 19_000_000.0)];
    let cycles = CycleDetector::detect_in(&rows, DEFAULT_MIN_AMOUNT, DEFAULT_MAX_DEPTH);
    assert_eq!(cycles.len(), 1);
    assert_eq!(cycles[0].depth, 2);
    assert!((cycles[0].risk_score - 0.75).abs() < 1e-9);
}

#[test]
fn below_min_amount_edges_are_ignored() {
    let rows = vec![
        tx("p", "A", "B", 500_000.0), // under the 1M floor
        tx("p", "B", "A", 20_000_000.0),
    ];
    let cycles = CycleDetector::detect_in(&rows, DEFAULT_MIN_AMOUNT, DEFAULT_MAX_DEPTH);
    assert!(cycles.is_empty());
}

#[test]
fn depth_cap_prunes_long_loops() {
    // Five-hop loop cannot close within max depth 4
    let rows = vec![
        tx("p", "A", "B", 10_000_000.0),
        tx("p", "B", "C", 10_000_000.0),
        tx("p", "C", "D", 10_000_000.0),
        tx("p", "D", "E", 10_000_000.0),
        tx("p", "E", "A", 10_000_000.0),
    ];
    let cycles = CycleDetector::detect_in(&rows, DEFAULT_MIN_AMOUNT, DEFAULT_MAX_DEPTH);
    assert!(cycles.is_empty());
}

#[test]
fn shuffled_input_produces_the_same_cycle_set() {
    let rows = vec![
        tx("p", "A", "B", 50_000_000.0),
        tx("p", "B", "C", 48_000_000.0),
        tx("p", "C", "A", 45_000_000.0),
        tx("p", "X", "Y", 30_000_000.0),
        tx("p", "Y", "X", 29_000_000.0),
    ];
    let forward = CycleDetector::detect_in(&rows, DEFAULT_MIN_AMOUNT, DEFAULT_MAX_DEPTH);
    let mut reversed_rows = rows.clone();
    reversed_rows.reverse();
    let reversed = CycleDetector::detect_in(&reversed_rows, DEFAULT_MIN_AMOUNT, DEFAULT_MAX_DEPTH);

    let key = |cycles: &[crate::graph::cycles::DetectedCycle]| {
        let mut keys: Vec<String> = cycles.iter().map(|c| c.path.join(">")).collect();
        keys.sort();
        keys
    };
    assert_eq!(key(&forward), key(&reversed));
    assert_eq!(forward.len(), 2);
}

#[test]
fn cycles_are_deduped_across_rotations() {
    // A->B->C->A discovered from A, B and C must count once
    let rows = vec![
        tx("p", "A", "B", 10_000_000.0),
        tx("p", "B", "C", 10_000_000.0),
        tx("p", "C", "A", 10_000_000.0),
    ];
    let cycles = CycleDetector::detect_in(&rows, DEFAULT_MIN_AMOUNT, DEFAULT_MAX_DEPTH);
    assert_eq!(cycles.len(), 1);
}

#[test]
fn detect_publishes_correlation_events() {
    let store = ForensicStore::open_in_memory().unwrap();
    let bus = Arc::new(EventBus::new());
    let project = Project::new("Audit", "CTR-400", 1.0, "PT X");
    store.insert_project(&project).unwrap();
    for (s, r, amount) in
        [("A", "B", 50_000_000.0), ("B", "C", 48_000_000.0), ("C", "A", 45_000_000.0)]
    {
        store.insert_transaction(&tx(&project.id, s, r, amount)).unwrap();
    }
    let detector = CycleDetector::new(store, bus.clone());
    let cycles = detector.detect(&project.id, DEFAULT_MIN_AMOUNT, DEFAULT_MAX_DEPTH).unwrap();
    assert_eq!(cycles.len(), 1);
    let events = bus.recent(Some(EventKind::CorrelationFound), None, 10);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data["correlation_type"], "CircularFlow");
}

#[test]
fn results_order_by_min_flow_desc() {
    let rows = vec![
        tx("p", "A", "B", 10_000_000.0),
        tx("p", "B", "A", 10_000_000.0),
        tx("p", "X", "Y", 90_000_000.0),
        tx("p", "Y", "X", 90_000_000.0),
    ];
    let cycles = CycleDetector::detect_in(&rows, DEFAULT_MIN_AMOUNT, DEFAULT_MAX_DEPTH);
    assert_eq!(cycles.len(), 2);
    assert!(cycles[0].min_flow >= cycles[1].min_flow);
}
