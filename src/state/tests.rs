use super::*;
use crate::config::{ConfigError, RiskConfig};
use crate::grid::{CellKey, GeoBounds, Region};
use crate::hotspot::{HeatmapQuery, HotspotQuery, KindFilter};
use crate::observation::{
    InferencePayload, InferenceRecord, LatLon, Observation, ObservationKind, PixelBox,
    TrashDetection, ValidationError, WaterReading,
};
use crate::alert::AlertState;
use crate::scoring::{RiskScorer, ScoringConfig, Trend};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 8, 24, 8, 0, 0).unwrap()
}

fn engine() -> RiskEngine {
    let mut config = RiskConfig::default();
    config.grid.retention_hours = 24;
    RiskEngine::new(config).unwrap()
}

fn water_record(lat: f64, lon: f64, index: f64, at: DateTime<Utc>) -> InferenceRecord {
    InferenceRecord {
        image_id: Some(format!("img-{lat}-{lon}")),
        lat,
        lon,
        timestamp: at,
        payload: InferencePayload::Water {
            readings: vec![WaterReading {
                contamination_type: "lead".to_string(),
                index,
                confidence: 1.0,
            }],
        },
    }
}

fn trash_record(lat: f64, lon: f64, at: DateTime<Utc>) -> InferenceRecord {
    InferenceRecord {
        image_id: None,
        lat,
        lon,
        timestamp: at,
        payload: InferencePayload::Trash {
            detections: vec![TrashDetection {
                category: "plastic bottle".to_string(),
                bbox: PixelBox {
                    x1: 10.0,
                    y1: 10.0,
                    x2: 60.0,
                    y2: 90.0,
                },
                confidence: 0.9,
            }],
        },
    }
}

fn water_observation(location: LatLon, severity: f64, at: DateTime<Utc>) -> Observation {
    Observation::new(ObservationKind::Water, location, at, severity, 1.0, BTreeMap::new()).unwrap()
}

fn finest(lat: f64, lon: f64) -> CellKey {
    CellKey::for_location(LatLon::new(lat, lon), 3)
}

#[test]
fn test_ingest_batch_indexes_and_scores() {
    let engine = engine();
    let records = vec![
        water_record(12.9716, 77.5946, 1.0, t0()),
        water_record(12.9716, 77.5946, 1.0, t0()),
    ];

    let report = engine.ingest_batch_at(&records, t0());
    assert_eq!(report.accepted, 2);
    assert!(report.rejected.is_empty());
    // One cell per configured precision
    assert_eq!(report.touched_cells, 4);
    assert_eq!(report.recompute_failures, 0);

    let cell = engine.cell(&finest(12.9716, 77.5946)).unwrap();
    assert_eq!(cell.observations.len(), 2);
    assert!((cell.score.value - (1.0 - (-3.0f64).exp())).abs() < 1e-9);
    assert_eq!(cell.score.trend, Trend::Rising);
    assert_eq!(cell.score.last_updated, t0());
    assert_eq!(engine.observation_count(), 2);
}

#[test]
fn test_invalid_records_rejected_rest_processed() {
    let engine = engine();
    let records = vec![
        water_record(95.0, 77.5946, 0.5, t0()),
        water_record(12.9716, 77.5946, 0.5, t0() + Duration::hours(1)),
        trash_record(12.9716, 77.5946, t0()),
    ];

    let report = engine.ingest_batch_at(&records, t0());
    assert_eq!(report.accepted, 1);
    assert_eq!(report.rejected.len(), 2);
    assert_eq!(report.rejected[0].index, 0);
    assert!(matches!(
        report.rejected[0].error,
        ValidationError::InvalidLocation { .. }
    ));
    assert_eq!(report.rejected[1].index, 1);
    assert!(matches!(
        report.rejected[1].error,
        ValidationError::FutureTimestamp { .. }
    ));

    let json = serde_json::to_value(&report).unwrap();
    assert!(json["rejected"][0]["error"].is_string());
    assert_eq!(json["rejected"][0]["image_id"], "img-95-77.5946");

    let metrics = engine.metrics.snapshot();
    assert_eq!(metrics.records_rejected, 2);
    assert_eq!(metrics.observations_ingested, 1);
}

#[test]
fn test_alerts_returned_and_broadcast() {
    let engine = engine();
    let mut rx = engine.subscribe_alerts();

    let report = engine.ingest_batch_at(
        &[
            water_record(12.9716, 77.5946, 1.0, t0()),
            water_record(12.9716, 77.5946, 1.0, t0()),
        ],
        t0(),
    );

    assert_eq!(report.alerts.len(), 1);
    let event = rx.try_recv().unwrap();
    assert_eq!(event, report.alerts[0]);

    // Raised on the finest level only
    assert_eq!(event.cell_id, finest(12.9716, 77.5946));
    assert_eq!(event.suppressed_until, t0() + Duration::minutes(360));
    assert!(matches!(
        engine.alert_state(&event.cell_id),
        AlertState::Cooldown { .. }
    ));
    let coarse = CellKey::for_location(LatLon::new(12.9716, 77.5946), 1);
    assert_eq!(engine.alert_state(&coarse), AlertState::Normal);
    assert_eq!(engine.metrics.get_alerts_emitted(), 1);
}

#[test]
fn test_cooldown_suppresses_repeat_alerts() {
    let engine = engine();
    let batch = |at| {
        engine.ingest_batch_at(
            &[
                water_record(12.9716, 77.5946, 1.0, at),
                water_record(12.9716, 77.5946, 1.0, at),
            ],
            at,
        )
    };

    assert_eq!(batch(t0()).alerts.len(), 1);
    assert!(batch(t0() + Duration::minutes(10)).alerts.is_empty());
    assert!(batch(t0() + Duration::minutes(300)).alerts.is_empty());
    assert_eq!(batch(t0() + Duration::minutes(361)).alerts.len(), 1);
}

#[test]
fn test_sweep_evicts_and_settles_watch() {
    let engine = engine();
    let key = finest(12.9716, 77.5946);

    // 1 - e^-0.75 ≈ 0.53, above watch only
    let report = engine.ingest_batch_at(&[water_record(12.9716, 77.5946, 0.5, t0())], t0());
    assert!(report.alerts.is_empty());
    assert_eq!(engine.alert_state(&key), AlertState::Watch);

    let report = engine.sweep_at(t0() + Duration::hours(25));
    assert_eq!(report.evicted_observations, 1);
    assert_eq!(report.evicted_cells, 4);
    assert_eq!(report.touched_cells, 0);
    assert!(engine.cell(&key).is_none());
    assert_eq!(engine.alert_state(&key), AlertState::Normal);
    assert_eq!(engine.observation_count(), 0);
    assert_eq!(engine.metrics.snapshot().cells_evicted, 4);
}

#[test]
fn test_sweep_keeps_fresh_observations() {
    let engine = engine();
    engine.ingest_batch_at(&[trash_record(12.9716, 77.5946, t0())], t0());
    let later = t0() + Duration::hours(20);
    engine.ingest_batch_at(&[trash_record(12.9716, 77.5946, later)], later);

    let report = engine.sweep_at(t0() + Duration::hours(25));
    assert_eq!(report.evicted_observations, 1);
    assert_eq!(report.evicted_cells, 0);
    // The surviving cells lost an observation and were rescored
    assert_eq!(report.touched_cells, 4);

    let cell = engine.cell(&finest(12.9716, 77.5946)).unwrap();
    assert_eq!(cell.observations.len(), 1);
    assert_eq!(cell.score.trend, Trend::Falling);
}

#[test]
fn test_refresh_lets_decayed_cell_leave_watch() {
    let engine = engine();
    let key = finest(12.9716, 77.5946);
    engine.ingest_batch_at(&[water_record(12.9716, 77.5946, 0.5, t0())], t0());
    assert_eq!(engine.alert_state(&key), AlertState::Watch);

    // 1 - e^(-0.75·e^-0.1) ≈ 0.49 after ten hours
    let report = engine.refresh_at(t0() + Duration::hours(10));
    assert_eq!(report.touched_cells, 4);
    assert_eq!(engine.alert_state(&key), AlertState::Normal);

    let cell = engine.cell(&key).unwrap();
    assert!(cell.score.value < 0.5);
    assert_eq!(cell.score.trend, Trend::Falling);
    assert_eq!(cell.score.last_updated, t0() + Duration::hours(10));
}

#[test]
fn test_insert_observations_skips_duplicates() {
    let source = engine();
    source.ingest_batch_at(
        &[
            trash_record(12.9716, 77.5946, t0()),
            water_record(40.7128, -74.0060, 0.7, t0()),
        ],
        t0(),
    );
    let observations = source.observations();

    let engine = engine();
    let first = engine.insert_observations_at(observations.clone(), t0());
    assert_eq!(first.accepted, 2);
    let second = engine.insert_observations_at(observations, t0());
    assert_eq!(second.accepted, 0);
    assert_eq!(engine.observation_count(), 2);
    assert_eq!(engine.observations(), source.observations());
}

#[test]
fn test_insert_observations_rejects_malformed() {
    let engine = engine();
    let valid = water_observation(LatLon::new(12.9716, 77.5946), 0.4, t0());

    let mut off_globe = valid.clone();
    off_globe.location = LatLon::new(f64::NAN, 500.0);
    off_globe.image_id = Some("img-nan".to_string());
    let mut overweight = valid.clone();
    overweight.severity = 7.0;
    let mut unsure = valid.clone();
    unsure.source_confidence = -0.5;
    let mut future = valid.clone();
    future.timestamp = t0() + Duration::days(1);

    let report = engine.insert_observations_at(
        vec![off_globe, valid, overweight, unsure, future],
        t0(),
    );

    assert_eq!(report.accepted, 1);
    let indices: Vec<usize> = report.rejected.iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![0, 2, 3, 4]);
    assert!(matches!(report.rejected[0].error, ValidationError::InvalidLocation { .. }));
    assert_eq!(report.rejected[0].image_id.as_deref(), Some("img-nan"));
    assert_eq!(
        report.rejected[1].error,
        ValidationError::OutOfRange { field: "severity", value: 7.0 }
    );
    assert_eq!(
        report.rejected[2].error,
        ValidationError::OutOfRange { field: "source_confidence", value: -0.5 }
    );
    assert!(matches!(report.rejected[3].error, ValidationError::FutureTimestamp { .. }));

    // Nothing lands in the origin cell a NaN coordinate would floor to
    assert_eq!(engine.observation_count(), 1);
    assert!(engine.cell(&CellKey { precision: 3, row: 0, col: 0 }).is_none());
    assert_eq!(engine.metrics.snapshot().records_rejected, 4);
}

#[test]
fn test_failed_recompute_does_not_stop_batch() {
    let engine = engine();
    let a = LatLon::new(12.9716, 77.5946);
    let b = LatLon::new(40.7125, -74.0065);
    engine.ingest_batch_at(&[water_record(a.lat, a.lon, 0.3, t0())], t0());
    let before = engine.cell(&finest(a.lat, a.lon)).unwrap().score;

    // Corrupt cell A directly in the index, behind the validating entry points
    let mut corrupt = water_observation(a, 0.3, t0());
    corrupt.severity = f64::NAN;
    engine.index().insert(Arc::new(corrupt), t0());

    let later = t0() + Duration::minutes(10);
    let report = engine.insert_observations_at(
        vec![water_observation(a, 0.3, later), water_observation(b, 0.3, later)],
        later,
    );

    assert_eq!(report.accepted, 2);
    assert_eq!(report.touched_cells, 8);
    // A fails at every precision; B is scored regardless
    assert_eq!(report.recompute_failures, 4);
    assert_eq!(engine.metrics.snapshot().recompute_failures, 4);

    let cell_a = engine.cell(&finest(a.lat, a.lon)).unwrap();
    assert_eq!(cell_a.observations.len(), 3);
    assert_eq!(cell_a.score, before);

    let cell_b = engine.cell(&finest(b.lat, b.lon)).unwrap();
    assert_eq!(cell_b.score.last_updated, later);
    assert!((cell_b.score.value - (1.0 - (-0.45f64).exp())).abs() < 1e-9);
}

#[test]
fn test_queries_go_through_engine() {
    let engine = engine();
    engine.ingest_batch_at(
        &[
            water_record(12.9716, 77.5946, 0.9, t0()),
            trash_record(12.9726, 77.5946, t0()),
        ],
        t0(),
    );
    let bounds = GeoBounds::new(12.96, 77.58, 12.99, 77.61);

    let hotspots = engine
        .hotspots_at(
            &HotspotQuery {
                region: Region::BBox(bounds),
                zoom_level: 14,
                score_threshold: 0.2,
                limit: None,
                kinds: KindFilter::All,
            },
            t0(),
        )
        .unwrap();
    // Vertically adjacent cells merge
    assert_eq!(hotspots.len(), 1);
    assert_eq!(hotspots[0].cells.len(), 2);

    let heatmap = engine
        .heatmap_at(
            &HeatmapQuery {
                bounds,
                zoom_level: 14,
                kinds: KindFilter::Trash,
            },
            t0(),
        )
        .unwrap();
    let nonzero = heatmap.values.iter().flatten().filter(|v| **v > 0.0).count();
    assert_eq!(nonzero, 1);
}

#[test]
fn test_concurrent_batches() {
    let engine = Arc::new(engine());
    let mut handles = vec![];

    for worker in 0..8 {
        let engine = Arc::clone(&engine);
        handles.push(thread::spawn(move || {
            for i in 0..25 {
                // Shared hot cell plus one private cell per record
                let lat = 10.0 + worker as f64 * 0.1 + i as f64 * 0.002 + 0.0005;
                engine.ingest_batch_at(
                    &[
                        water_record(12.9716, 77.5946, 0.3, t0()),
                        water_record(lat, 20.0005, 0.3, t0()),
                    ],
                    t0(),
                );
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(engine.observation_count(), 400);
    let shared = engine.cell(&finest(12.9716, 77.5946)).unwrap();
    assert_eq!(shared.observations.len(), 200);

    // Cached score reflects the full observation set
    let scorer = RiskScorer::new(ScoringConfig::default());
    let (expected, _) = scorer
        .evaluate(shared.observations.iter().map(|o| o.as_ref()), t0())
        .unwrap();
    assert_eq!(shared.score.value, expected);
    assert_eq!(engine.metrics.snapshot().observations_ingested, 400);
}

#[test]
fn test_invalid_config_rejected() {
    let mut config = RiskConfig::default();
    config.alerts.watch_threshold = 0.9;
    config.alerts.alert_threshold = 0.5;
    assert!(matches!(
        RiskEngine::new(config),
        Err(ConfigError::ThresholdOrder { .. })
    ));
}

#[test]
fn test_out_of_range_durations_rejected() {
    let mut config = RiskConfig::default();
    config.grid.retention_hours = i64::MAX / 2;
    assert!(matches!(
        RiskEngine::new(config),
        Err(ConfigError::TooLarge { name: "grid.retention_hours", .. })
    ));

    let mut config = RiskConfig::default();
    config.normalizer.clock_skew_seconds = i64::MAX;
    assert!(matches!(
        RiskEngine::new(config),
        Err(ConfigError::TooLarge { name: "normalizer.clock_skew_seconds", .. })
    ));
}

#[test]
fn test_shutdown_returns_final_metrics() {
    let engine = engine();
    engine.ingest_batch_at(&[trash_record(12.9716, 77.5946, t0())], t0());
    let metrics = engine.shutdown();
    assert_eq!(metrics.observations_ingested, 1);
    assert_eq!(metrics.alerts_emitted, 0);
}
