//! Adaptive batch sizing from live system resources.
//!
//! Base sizes per data type are scaled by CPU load and free memory, and the
//! concurrency is capped so a small job never spawns idle workers.

use crate::models::BatchConfig;
use parking_lot::Mutex;
use sysinfo::System;
use tracing::{debug, warn};

const CPU_THRESHOLD_LOW: f32 = 50.0;
const CPU_THRESHOLD_HIGH: f32 = 80.0;
const MEMORY_THRESHOLD_GB: f64 = 2.0;

/// Current system resource utilization.
#[derive(Debug, Clone, Copy)]
pub struct SystemResources {
    pub cpu_percent: f32,
    pub memory_available_gb: f64,
    pub disk_io_wait: f64,
}

impl SystemResources {
    /// Conservative defaults when probing fails.
    pub fn conservative() -> Self {
        Self { cpu_percent: 75.0, memory_available_gb: 2.0, disk_io_wait: 10.0 }
    }
}

/// Base batch size by data type.
pub fn base_batch_size(data_type: &str) -> usize {
    match data_type {
        "transaction" => 500,
        "entity" => 200,
        "embedding" => 100, // more CPU intensive
        "reconciliation" => 300,
        "document" => 150,
        _ => 250,
    }
}

pub struct BatchOptimizer {
    system: Mutex<System>,
}

impl Default for BatchOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchOptimizer {
    pub fn new() -> Self {
        Self { system: Mutex::new(System::new()) }
    }

    pub fn probe(&self) -> SystemResources {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        system.refresh_memory();
        let cpu = system.global_cpu_usage();
        let memory_gb = system.available_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        if !cpu.is_finite() || memory_gb <= 0.0 {
            warn!("System probe returned nonsense; using conservative defaults");
            return SystemResources::conservative();
        }
        SystemResources { cpu_percent: cpu, memory_available_gb: memory_gb, disk_io_wait: 0.0 }
    }

    /// Optimal batch configuration for a job.
    pub fn calculate(&self, data_type: &str, total_items: usize) -> BatchConfig {
        self.calculate_with(data_type, total_items, self.probe())
    }

    /// Deterministic variant for tests and replays.
    pub fn calculate_with(
        &self,
        data_type: &str,
        total_items: usize,
        resources: SystemResources,
    ) -> BatchConfig {
        let base = base_batch_size(data_type);
        let (mut size, mut concurrency, delay) = if resources.cpu_percent < CPU_THRESHOLD_LOW {
            ((base as f64 * 1.5) as usize, 4usize, 100u64)
        } else if resources.cpu_percent > CPU_THRESHOLD_HIGH {
            ((base as f64 * 0.5) as usize, 2, 500)
        } else {
            (base, 3, 200)
        };
        if resources.memory_available_gb < MEMORY_THRESHOLD_GB {
            warn!(
                free_gb = resources.memory_available_gb,
                "Low memory; halving batch size"
            );
            size = (size as f64 * 0.5) as usize;
            concurrency = concurrency.saturating_sub(1).max(1);
        }
        let size = size.max(1);
        // Never more workers than batches
        let batches = total_items.div_ceil(size).max(1);
        let concurrency = concurrency.min(batches).max(1);

        debug!(
            data_type,
            size, concurrency, delay,
            cpu = resources.cpu_percent,
            mem_gb = resources.memory_available_gb,
            "Batch config computed"
        );
        BatchConfig { size, concurrency, inter_batch_delay_ms: delay }
    }

    /// Coarse health classification for the monitor's periodic check.
    pub fn health_status(&self) -> (&'static str, SystemResources) {
        let resources = self.probe();
        let status = if resources.cpu_percent > 95.0 || resources.memory_available_gb < 1.0 {
            "critical"
        } else if resources.cpu_percent > 80.0 || resources.memory_available_gb < 2.0 {
            "warning"
        } else {
            "healthy"
        };
        (status, resources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(cpu: f32, mem_gb: f64) -> SystemResources {
        SystemResources { cpu_percent: cpu, memory_available_gb: mem_gb, disk_io_wait: 0.0 }
    }

    #[test]
    fn idle_cpu_scales_up() {
        let optimizer = BatchOptimizer::new();
        let config = optimizer.calculate_with("transaction", 10_000, resources(30.0, 8.0));
        assert_eq!(config.size, 750);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.inter_batch_delay_ms, 100);
    }

    #[test]
    fn stressed_cpu_scales_down() {
        let optimizer = BatchOptimizer::new();
        let config = optimizer.calculate_with("transaction", 10_000, resources(90.0, 8.0));
        assert_eq!(config.size, 250);
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.inter_batch_delay_ms, 500);
    }

    #[test]
    fn normal_load_uses_base_size() {
        let optimizer = BatchOptimizer::new();
        let config = optimizer.calculate_with("entity", 1_000, resources(65.0, 8.0));
        assert_eq!(config.size, 200);
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.inter_batch_delay_ms, 200);
    }

    #[test]
    fn low_memory_halves_and_drops_a_worker() {
        let optimizer = BatchOptimizer::new();
        let config = optimizer.calculate_with("transaction", 10_000, resources(30.0, 1.5));
        assert_eq!(config.size, 375);
        assert_eq!(config.concurrency, 3);
    }

    #[test]
    fn concurrency_never_exceeds_batch_count() {
        let optimizer = BatchOptimizer::new();
        let config = optimizer.calculate_with("transaction", 100, resources(30.0, 8.0));
        // 100 items in one 750-batch: one worker is enough
        assert_eq!(config.concurrency, 1);
    }

    #[test]
    fn unknown_data_type_defaults_to_250() {
        assert_eq!(base_batch_size("mystery"), 250);
        assert_eq!(base_batch_size("embedding"), 100);
    }
}
