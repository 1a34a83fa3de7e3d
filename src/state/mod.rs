// Risk engine: owned state tying normalizer, index, scorer and alerts together

mod engine;
mod metrics;

pub use engine::{BatchReport, RecordRejection, RiskEngine};
pub use metrics::{EngineMetrics, MetricsSnapshot};

#[cfg(test)]
mod tests;
