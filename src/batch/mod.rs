//! Batch processing: adaptive sizing and a bounded-worker orchestrator with
//! retry, pacing, cancellation and exactly-once progress accounting.

pub mod optimizer;
pub mod orchestrator;

pub use optimizer::{BatchOptimizer, SystemResources};
pub use orchestrator::{BatchOrchestrator, BatchProcessor, BatchStats, OrchestratorConfig};

#[cfg(test)]
mod orchestrator_tests;
