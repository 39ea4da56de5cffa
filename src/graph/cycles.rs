//! Circular money-flow detection.
//!
//! Bounded DFS over (sender -> receiver) edges with amount >= `min_amount`:
//! max depth 4, path pruning (an extension whose next receiver is already on
//! the path is dropped), cycle = path whose last node equals its first with
//! depth >= 2. Cycles are canonicalized by rotating the node sequence to
//! start at the lexicographically smallest node, which makes the output a
//! set independent of input order.

use crate::errors::EngineResult;
use crate::events::{EventBus, EventKind};
use crate::models::Transaction;
use crate::store::{ForensicStore, TransactionFilter};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::info;

pub const DEFAULT_MIN_AMOUNT: f64 = 1_000_000.0;
pub const DEFAULT_MAX_DEPTH: usize = 4;
const MAX_CYCLES: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedCycle {
    /// Node path including the closing repeat, e.g. `[A, B, C, A]`.
    pub path: Vec<String>,
    pub depth: usize,
    /// Minimum edge amount along the path.
    pub min_flow: f64,
    pub risk_score: f64,
}

pub struct CycleDetector {
    store: ForensicStore,
    bus: Arc<EventBus>,
}

impl CycleDetector {
    pub fn new(store: ForensicStore, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    /// Detect cycles in one project's flow graph. Emits `correlation.found`
    /// per cycle and returns up to 50 cycles ordered by min-flow descending.
    pub fn detect(
        &self,
        project_id: &str,
        min_amount: f64,
        max_depth: usize,
    ) -> EngineResult<Vec<DetectedCycle>> {
        let rows = self.store.query_transactions(&TransactionFilter {
            project_id: Some(project_id.to_string()),
            ..Default::default()
        })?;
        let cycles = Self::detect_in(&rows, min_amount, max_depth);

        for cycle in &cycles {
            self.bus.publish_with(
                EventKind::CorrelationFound,
                json!({
                    "correlation_type": "CircularFlow",
                    "details": {
                        "path": cycle.path.join(" -> "),
                        "depth": cycle.depth,
                        "flow_amount": cycle.min_flow,
                        "risk_score": cycle.risk_score,
                    },
                }),
                None,
                Some(project_id.to_string()),
            );
        }
        if !cycles.is_empty() {
            info!(project = project_id, cycles = cycles.len(), "🔄 Circular flows detected");
        }
        Ok(cycles)
    }

    /// Pure in-memory detection over a transaction slice.
    pub fn detect_in(rows: &[Transaction], min_amount: f64, max_depth: usize) -> Vec<DetectedCycle> {
        // Deterministic adjacency: sender -> [(receiver, amount)] with sorted
        // keys and edges so input order cannot leak into the result.
        let mut adjacency: BTreeMap<&str, Vec<(&str, f64)>> = BTreeMap::new();
        for tx in rows {
            if tx.actual_amount < min_amount || tx.sender.is_empty() || tx.receiver.is_empty() {
                continue;
            }
            adjacency.entry(&tx.sender).or_default().push((&tx.receiver, tx.actual_amount));
        }
        for edges in adjacency.values_mut() {
            edges.sort_by(|a, b| {
                a.0.cmp(b.0).then(a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            });
        }

        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut cycles: Vec<DetectedCycle> = Vec::new();

        for start in adjacency.keys().copied().collect::<Vec<_>>() {
            let mut path: Vec<&str> = vec![start];
            Self::walk(&adjacency, start, start, f64::MAX, &mut path, max_depth, &mut seen, &mut cycles);
        }

        cycles.sort_by(|a, b| {
            b.min_flow.partial_cmp(&a.min_flow).unwrap_or(std::cmp::Ordering::Equal)
        });
        cycles.truncate(MAX_CYCLES);
        cycles
    }

    #[allow(clippy::too_many_arguments)]
    fn walk<'a>(
        adjacency: &BTreeMap<&'a str, Vec<(&'a str, f64)>>,
        start: &'a str,
        current: &'a str,
        min_flow: f64,
        path: &mut Vec<&'a str>,
        max_depth: usize,
        seen: &mut BTreeSet<String>,
        cycles: &mut Vec<DetectedCycle>,
    ) {
        let depth = path.len() - 1;
        if depth >= max_depth {
            return;
        }
        let Some(edges) = adjacency.get(current) else { return };
        for (receiver, amount) in edges {
            let next_flow = min_flow.min(*amount);
            if *receiver == start {
                let cycle_depth = depth + 1;
                if cycle_depth >= 2 {
                    let nodes: Vec<String> = path.iter().map(|s| s.to_string()).collect();
                    let key = Self::canonical_key(&nodes);
                    if seen.insert(key) {
                        let risk = if cycle_depth > 2 {
                            (0.8 + 0.05 * cycle_depth as f64).min(0.99)
                        } else {
                            0.75
                        };
                        let mut full_path = nodes;
                        full_path.push(start.to_string());
                        cycles.push(DetectedCycle {
                            path: full_path,
                            depth: cycle_depth,
                            min_flow: next_flow,
                            risk_score: risk,
                        });
                    }
                }
                continue;
            }
            // Prune: never revisit a node already on the path.
            if path.contains(receiver) {
                continue;
            }
            path.push(*receiver);
            Self::walk(adjacency, start, *receiver, next_flow, path, max_depth, seen, cycles);
            path.pop();
        }
    }

    /// Rotation-invariant identity of a cycle's node sequence (closing node
    /// excluded).
    fn canonical_key(nodes: &[String]) -> String {
        if nodes.is_empty() {
            return String::new();
        }
        let pivot = nodes
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.cmp(b))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let mut rotated: Vec<&str> = Vec::with_capacity(nodes.len());
        for offset in 0..nodes.len() {
            rotated.push(&nodes[(pivot + offset) % nodes.len()]);
        }
        rotated.join(" -> ")
    }
}
