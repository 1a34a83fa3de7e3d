use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lifetime counters for the risk engine
#[derive(Clone, Default)]
pub struct EngineMetrics {
    /// Observations newly indexed
    observations_ingested: Arc<AtomicU64>,

    /// Inference records rejected by the normalizer
    records_rejected: Arc<AtomicU64>,

    /// Observations removed by retention sweeps
    observations_evicted: Arc<AtomicU64>,

    /// Cells deleted after becoming empty (all levels)
    cells_evicted: Arc<AtomicU64>,

    alerts_emitted: Arc<AtomicU64>,

    /// Cells whose score could not be recomputed
    recompute_failures: Arc<AtomicU64>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_ingested(&self, count: usize) {
        self.observations_ingested
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.records_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self, observations: usize, cells: usize) {
        self.observations_evicted
            .fetch_add(observations as u64, Ordering::Relaxed);
        self.cells_evicted.fetch_add(cells as u64, Ordering::Relaxed);
    }

    pub fn record_alert(&self) {
        self.alerts_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recompute_failure(&self) {
        self.recompute_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_alerts_emitted(&self) -> u64 {
        self.alerts_emitted.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            observations_ingested: self.observations_ingested.load(Ordering::Relaxed),
            records_rejected: self.records_rejected.load(Ordering::Relaxed),
            observations_evicted: self.observations_evicted.load(Ordering::Relaxed),
            cells_evicted: self.cells_evicted.load(Ordering::Relaxed),
            alerts_emitted: self.get_alerts_emitted(),
            recompute_failures: self.recompute_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the engine counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub observations_ingested: u64,
    pub records_rejected: u64,
    pub observations_evicted: u64,
    pub cells_evicted: u64,
    pub alerts_emitted: u64,
    pub recompute_failures: u64,
}
