// Integration tests for the ingest -> score -> hotspot/heatmap/alert pipeline

use chrono::{DateTime, Duration, TimeZone, Utc};
use satmap::alert::AlertState;
use satmap::config::RiskConfig;
use satmap::grid::{CellKey, GeoBounds, QueryError, Region};
use satmap::hotspot::{HeatmapQuery, HotspotQuery, KindFilter};
use satmap::observation::{InferenceRecord, LatLon};
use satmap::scoring::RiskLevel;
use satmap::state::RiskEngine;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 8, 24, 8, 0, 0).unwrap()
}

/// Records as the upload/inference layer posts them
fn records(value: serde_json::Value) -> Vec<InferenceRecord> {
    serde_json::from_value(value).unwrap()
}

fn lake_batch(at: DateTime<Utc>) -> Vec<InferenceRecord> {
    records(json!([
        {
            "image_id": "img-001",
            "lat": 12.9716, "lon": 77.5946,
            "timestamp": at,
            "kind": "trash",
            "detections": [
                { "category": "plastic", "bbox": { "x1": 0.0, "y1": 0.0, "x2": 40.0, "y2": 40.0 }, "confidence": 0.92 },
                { "category": "metal can", "bbox": { "x1": 50.0, "y1": 10.0, "x2": 70.0, "y2": 30.0 }, "confidence": 0.81 },
                { "category": "glass", "bbox": { "x1": 5.0, "y1": 5.0, "x2": 9.0, "y2": 9.0 }, "confidence": 0.2 }
            ]
        },
        {
            "image_id": "img-002",
            "lat": 12.9717, "lon": 77.5947,
            "timestamp": at,
            "kind": "water",
            "readings": [
                { "contamination_type": "turbidity", "index": 0.7, "confidence": 0.95 },
                { "contamination_type": "algae", "index": 0.9, "confidence": 0.85 }
            ]
        },
        {
            "image_id": "img-003",
            "lat": 12.9726, "lon": 77.5946,
            "timestamp": at,
            "kind": "trash",
            "detections": [
                { "category": "industrial waste", "bbox": { "x1": 0.0, "y1": 0.0, "x2": 90.0, "y2": 90.0 }, "confidence": 0.88 }
            ]
        }
    ]))
}

fn lake_area() -> Region {
    Region::BBox(GeoBounds::new(12.95, 77.57, 13.0, 77.62))
}

#[test]
fn test_ingest_then_query_hotspots() {
    let engine = RiskEngine::new(RiskConfig::default()).unwrap();
    let report = engine.ingest_batch_at(&lake_batch(t0()), t0());
    assert_eq!(report.accepted, 3);
    assert!(report.rejected.is_empty());

    let hotspots = engine
        .hotspots_at(
            &HotspotQuery {
                region: lake_area(),
                zoom_level: 14,
                score_threshold: 0.3,
                limit: None,
                kinds: KindFilter::All,
            },
            t0(),
        )
        .unwrap();

    // The two lake-shore cells share an edge and merge
    assert_eq!(hotspots.len(), 1);
    let hotspot = &hotspots[0];
    assert_eq!(hotspot.rank, 1);
    assert_eq!(hotspot.cells.len(), 2);
    assert_eq!(hotspot.cells[0], CellKey::for_location(LatLon::new(12.9716, 77.5946), 3));
    assert_eq!(hotspot.observation_count, 3);
    // The low-confidence glass detection is dropped
    assert_eq!(hotspot.item_count, 3);
    assert!(hotspot.contamination_types.contains("algae"));
    assert!(hotspot.contamination_types.contains("turbidity"));
    assert_eq!(hotspot.last_updated, t0());
    assert!(hotspot.peak_score >= hotspot.mean_score);
    assert_eq!(hotspot.risk_level, RiskLevel::from_score(hotspot.peak_score));

    let json = serde_json::to_value(hotspot).unwrap();
    assert!(json["risk_level"].is_string());
    assert!(json.get("distance_km").is_none());
}

#[test]
fn test_heatmap_over_ingested_area() {
    let engine = RiskEngine::new(RiskConfig::default()).unwrap();
    engine.ingest_batch_at(&lake_batch(t0()), t0());

    let heatmap = engine
        .heatmap_at(
            &HeatmapQuery {
                bounds: GeoBounds::new(12.95, 77.57, 13.0, 77.62),
                zoom_level: 12,
                kinds: KindFilter::Water,
            },
            t0(),
        )
        .unwrap();

    // Zoom 12 resolves to the 0.01 degree level
    assert_eq!(heatmap.precision, 2);
    assert_eq!(heatmap.values.len(), heatmap.rows);
    assert!(heatmap.values.iter().all(|row| row.len() == heatmap.cols));
    assert!(heatmap.value_at(LatLon::new(12.9717, 77.5947)).unwrap() > 0.0);
    let nonzero = heatmap.values.iter().flatten().filter(|v| **v > 0.0).count();
    assert_eq!(nonzero, 1);
}

#[test]
fn test_alert_lifecycle_through_engine() {
    let engine = RiskEngine::new(RiskConfig::default()).unwrap();
    let mut rx = engine.subscribe_alerts();

    let mut events = Vec::new();
    for minute in (0..300).step_by(30) {
        let at = t0() + Duration::minutes(minute);
        events.extend(engine.ingest_batch_at(&lake_batch(at), at).alerts);
    }

    // Repeated heavy batches inside one cooldown window alert once per cell
    let cells: BTreeSet<CellKey> = events.iter().map(|e| e.cell_id).collect();
    assert_eq!(cells.len(), events.len());
    let event = events[0].clone();
    assert_eq!(event.cell_id, CellKey::for_location(LatLon::new(12.9716, 77.5946), 3));
    assert_eq!(event.triggered_at, t0());
    assert_eq!(event.severity_level, RiskLevel::Critical);
    assert_eq!(event.expected_response_minutes, 15);

    for expected in &events {
        assert_eq!(&rx.try_recv().unwrap(), expected);
    }
    assert!(rx.try_recv().is_err());

    // After the window, a decayed and swept cell settles to Normal
    let later = t0() + Duration::hours(24 * 31);
    let report = engine.refresh_at(later);
    assert!(report.evicted_observations > 0);
    assert_eq!(engine.alert_state(&event.cell_id), AlertState::Normal);
    assert_eq!(engine.observation_count(), 0);
}

#[test]
fn test_query_errors_surface_to_caller() {
    let mut config = RiskConfig::default();
    config.grid.max_query_cells = 1_000;
    let engine = RiskEngine::new(config).unwrap();
    engine.ingest_batch_at(&lake_batch(t0()), t0());

    let too_large = HotspotQuery {
        region: Region::BBox(GeoBounds::new(10.0, 70.0, 20.0, 80.0)),
        zoom_level: 14,
        score_threshold: 0.5,
        limit: None,
        kinds: KindFilter::All,
    };
    assert!(matches!(
        engine.hotspots_at(&too_large, t0()),
        Err(QueryError::RegionTooLarge { max: 1_000, .. })
    ));

    // The same region at a coarse zoom is accepted
    let coarse = HotspotQuery {
        zoom_level: 0,
        ..too_large.clone()
    };
    assert_eq!(engine.hotspots_at(&coarse, t0()).unwrap().len(), 1);

    let inverted = HotspotQuery {
        region: Region::BBox(GeoBounds::new(13.0, 77.0, 12.0, 78.0)),
        ..too_large.clone()
    };
    assert!(matches!(
        engine.hotspots_at(&inverted, t0()),
        Err(QueryError::InvalidRegion(_))
    ));

    let bad_radius = HotspotQuery {
        region: Region::Radius {
            center: LatLon::new(12.97, 77.59),
            radius_km: -1.0,
        },
        ..too_large
    };
    assert!(matches!(
        engine.hotspots_at(&bad_radius, t0()),
        Err(QueryError::InvalidRegion(_))
    ));
}

#[test]
fn test_insertion_order_does_not_change_scores() {
    let batch = lake_batch(t0());
    let forward = RiskEngine::new(RiskConfig::default()).unwrap();
    let backward = RiskEngine::new(RiskConfig::default()).unwrap();

    for record in &batch {
        forward.ingest_batch_at(std::slice::from_ref(record), t0());
    }
    for record in batch.iter().rev() {
        backward.ingest_batch_at(std::slice::from_ref(record), t0());
    }

    let key = CellKey::for_location(LatLon::new(12.9716, 77.5946), 3);
    assert_eq!(
        forward.cell(&key).unwrap().score.value,
        backward.cell(&key).unwrap().score.value
    );
}

#[test]
fn test_concurrent_uploads() {
    let engine = Arc::new(RiskEngine::new(RiskConfig::default()).unwrap());
    let mut handles = vec![];

    for worker in 0..4 {
        let engine = Arc::clone(&engine);
        handles.push(thread::spawn(move || {
            for i in 0..10 {
                let at = t0() + Duration::seconds(worker * 10 + i);
                engine.ingest_batch_at(&lake_batch(at), t0() + Duration::minutes(1));
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(engine.observation_count(), 120);
    assert_eq!(engine.metrics.snapshot().observations_ingested, 120);
    // One alert per hot cell despite concurrent writers
    assert_eq!(engine.metrics.snapshot().alerts_emitted, 2);
}
