use crate::alert::{AlertEvaluator, AlertEvent, AlertState};
use crate::config::{ConfigError, RiskConfig};
use crate::grid::{CellKey, CellSnapshot, QueryError, SpatialIndex};
use crate::hotspot::{Heatmap, HeatmapQuery, Hotspot, HotspotAggregator, HotspotQuery};
use crate::observation::{InferenceRecord, Normalizer, Observation, ValidationError};
use crate::scoring::RiskScorer;
use crate::state::metrics::{EngineMetrics, MetricsSnapshot};
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Inference record or observation that failed validation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordRejection {
    /// Position of the record in the submitted batch
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(serialize_with = "display")]
    pub error: ValidationError,
}

fn display<S: Serializer>(error: &ValidationError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

/// Outcome of one ingestion batch, sweep or refresh
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    /// Observations newly indexed
    pub accepted: usize,
    pub rejected: Vec<RecordRejection>,
    /// Cells rescored (all levels)
    pub touched_cells: usize,
    pub evicted_observations: usize,
    pub evicted_cells: usize,
    pub recompute_failures: usize,
    pub alerts: Vec<AlertEvent>,
}

/// Risk engine owns the index, cached scores and alert state.
///
/// Constructed once at service start and shared by reference (or `Arc`)
/// between ingestion and query paths. All mutation goes through `&self`.
pub struct RiskEngine {
    config: RiskConfig,

    normalizer: Normalizer,

    /// Cells at every configured precision
    index: SpatialIndex,

    scorer: RiskScorer,

    /// Per-cell alert state, finest precision only
    alerts: AlertEvaluator,

    /// Broadcast channel for emitted alerts
    alert_tx: broadcast::Sender<AlertEvent>,

    pub metrics: EngineMetrics,
}

impl RiskEngine {
    /// Validate `config` and build an empty engine.
    pub fn new(config: RiskConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let (alert_tx, _) = broadcast::channel(1000);
        let index = SpatialIndex::new(&config.grid);

        info!(
            levels = index.levels().len(),
            finest_precision = index.finest_precision(),
            retention_hours = config.grid.retention_hours,
            "Risk engine initialized"
        );

        Ok(Self {
            normalizer: Normalizer::new(config.normalizer.clone()),
            scorer: RiskScorer::new(config.scoring.clone()),
            alerts: AlertEvaluator::new(config.alerts.clone()),
            index,
            alert_tx,
            metrics: EngineMetrics::new(),
            config,
        })
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn ingest_batch(&self, records: &[InferenceRecord]) -> BatchReport {
        self.ingest_batch_at(records, Utc::now())
    }

    /// Normalize, index, sweep, rescore touched cells and evaluate alerts.
    ///
    /// Invalid records are rejected individually; the rest of the batch is
    /// still processed.
    pub fn ingest_batch_at(&self, records: &[InferenceRecord], now: DateTime<Utc>) -> BatchReport {
        let mut report = BatchReport::default();
        let mut observations = Vec::with_capacity(records.len());

        for (index, record) in records.iter().enumerate() {
            match self.normalizer.normalize(record, now) {
                Ok(observation) => observations.push(observation),
                Err(error) => {
                    warn!(
                        index = index,
                        image_id = ?record.image_id,
                        error = %error,
                        "Rejected inference record"
                    );
                    self.metrics.record_rejected();
                    report.rejected.push(RecordRejection {
                        index,
                        image_id: record.image_id.clone(),
                        error,
                    });
                }
            }
        }

        let touched = self.apply(observations, now, &mut report);
        self.recompute(touched, now, &mut report);

        info!(
            records = records.len(),
            accepted = report.accepted,
            rejected = report.rejected.len(),
            touched_cells = report.touched_cells,
            alerts = report.alerts.len(),
            "Processed inference batch"
        );

        report
    }

    /// Index already-normalized observations (snapshot restore, replays).
    ///
    /// Each observation is range-checked again and rejected individually if
    /// malformed. Observations already present are skipped.
    pub fn insert_observations_at(
        &self,
        observations: Vec<Observation>,
        now: DateTime<Utc>,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        let mut valid = Vec::with_capacity(observations.len());

        for (index, observation) in observations.into_iter().enumerate() {
            let checked = observation
                .validate()
                .and_then(|()| self.normalizer.check_timestamp(observation.timestamp, now));
            match checked {
                Ok(()) => valid.push(observation),
                Err(error) => {
                    warn!(
                        index = index,
                        observation_id = %observation.id,
                        error = %error,
                        "Rejected observation"
                    );
                    self.metrics.record_rejected();
                    report.rejected.push(RecordRejection {
                        index,
                        image_id: observation.image_id,
                        error,
                    });
                }
            }
        }

        let touched = self.apply(valid, now, &mut report);
        self.recompute(touched, now, &mut report);
        report
    }

    /// Evict expired observations and rescore the cells that lost some.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> BatchReport {
        self.insert_observations_at(Vec::new(), now)
    }

    /// Sweep, then rescore every cell and re-evaluate every alert.
    ///
    /// Driven by a timer in the surrounding service so decaying cells can
    /// leave Watch without new data arriving.
    pub fn refresh_at(&self, now: DateTime<Utc>) -> BatchReport {
        let mut report = BatchReport::default();
        self.apply(Vec::new(), now, &mut report);

        let keys: Vec<CellKey> = self
            .index
            .precisions()
            .into_iter()
            .flat_map(|precision| self.index.cell_keys(precision))
            .collect();
        self.recompute(keys, now, &mut report);

        debug!(
            cells = report.touched_cells,
            pending_expiry = self.index.pending_expiry(),
            "Refreshed all cell scores"
        );
        report
    }

    /// Index `observations` and sweep; returns the surviving cells to rescore.
    fn apply(
        &self,
        observations: Vec<Observation>,
        now: DateTime<Utc>,
        report: &mut BatchReport,
    ) -> BTreeSet<CellKey> {
        let mut touched = BTreeSet::new();

        for observation in observations {
            let keys = self.index.insert(Arc::new(observation), now);
            if !keys.is_empty() {
                report.accepted += 1;
            }
            touched.extend(keys);
        }
        self.metrics.record_ingested(report.accepted);

        let outcome = self.index.sweep(now);
        touched.extend(outcome.touched);
        for key in &outcome.removed {
            touched.remove(key);
        }
        report.evicted_observations = outcome.evicted_observations;
        report.evicted_cells = outcome.removed.len();
        self.metrics
            .record_eviction(outcome.evicted_observations, outcome.removed.len());

        // Deleted cells score zero, which lets a watched cell settle
        let finest = self.index.finest_precision();
        for key in outcome.removed.into_iter().filter(|k| k.precision == finest) {
            if let Some(event) = self.alerts.evaluate(key, 0.0, now) {
                self.publish(event, report);
            }
        }

        touched
    }

    /// Rescore `keys` in order, evaluating alerts on the finest level.
    ///
    /// A cell that fails to score keeps its previous score and does not
    /// stop the rest.
    fn recompute(
        &self,
        keys: impl IntoIterator<Item = CellKey>,
        now: DateTime<Utc>,
        report: &mut BatchReport,
    ) {
        let finest = self.index.finest_precision();

        for key in keys {
            report.touched_cells += 1;
            let result = self
                .index
                .recompute(&key, |observations, previous| {
                    self.scorer.score(observations, Some(previous), now)
                });

            match result {
                Some(Ok(score)) if key.precision == finest => {
                    if let Some(event) = self.alerts.evaluate(key, score.value, now) {
                        self.publish(event, report);
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(cell = %key, error = %e, "Failed to recompute cell score");
                    self.metrics.record_recompute_failure();
                    report.recompute_failures += 1;
                }
                // Deleted by a concurrent sweep
                None => {}
            }
        }
    }

    fn publish(&self, event: AlertEvent, report: &mut BatchReport) {
        info!(
            alert_id = %event.id,
            cell = %event.cell_id,
            score = event.score,
            severity = event.severity_level.as_str(),
            suppressed_until = %event.suppressed_until,
            "Alert raised"
        );
        self.metrics.record_alert();

        // No subscribers is fine; the report still carries the event
        let _ = self.alert_tx.send(event.clone());
        report.alerts.push(event);
    }

    pub fn hotspots(&self, query: &HotspotQuery) -> Result<Vec<Hotspot>, QueryError> {
        self.hotspots_at(query, Utc::now())
    }

    pub fn hotspots_at(
        &self,
        query: &HotspotQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<Hotspot>, QueryError> {
        HotspotAggregator::new(&self.index, &self.scorer).hotspots(query, now)
    }

    pub fn heatmap(&self, query: &HeatmapQuery) -> Result<Heatmap, QueryError> {
        self.heatmap_at(query, Utc::now())
    }

    pub fn heatmap_at(&self, query: &HeatmapQuery, now: DateTime<Utc>) -> Result<Heatmap, QueryError> {
        HotspotAggregator::new(&self.index, &self.scorer).heatmap(query, now)
    }

    /// Copy of a cell with its cached score
    pub fn cell(&self, key: &CellKey) -> Option<CellSnapshot> {
        self.index.get(key)
    }

    pub fn index(&self) -> &SpatialIndex {
        &self.index
    }

    /// Subscribe to alert events
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertEvent> {
        self.alert_tx.subscribe()
    }

    pub fn alert_state(&self, key: &CellKey) -> AlertState {
        self.alerts.state(key)
    }

    /// All indexed observations ordered by (timestamp, id)
    pub fn observations(&self) -> Vec<Observation> {
        self.index.observations()
    }

    pub fn observation_count(&self) -> usize {
        self.index.observation_count()
    }

    /// Tear down the engine, returning its final counters.
    pub fn shutdown(self) -> MetricsSnapshot {
        let metrics = self.metrics.snapshot();
        info!(
            observations = self.index.observation_count(),
            cells = self.index.cell_count(),
            ingested = metrics.observations_ingested,
            rejected = metrics.records_rejected,
            alerts = metrics.alerts_emitted,
            "Risk engine shut down"
        );
        metrics
    }
}
