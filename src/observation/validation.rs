use super::{
    InferencePayload, InferenceRecord, LatLon, Observation, ObservationKind, TrashDetection,
    WaterReading,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Validation errors for inference records and observations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("location ({lat}, {lon}) is outside valid latitude/longitude ranges")]
    InvalidLocation { lat: f64, lon: f64 },

    #[error("{field} must be within [0, 1], got {value}")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("timestamp {timestamp} is in the future (reference time {now})")]
    FutureTimestamp {
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    #[error("detection {index} has an inverted bounding box")]
    InvalidBoundingBox { index: usize },

    #[error("detection {index} has an empty category")]
    MissingCategory { index: usize },
}

/// Normalizer settings
#[derive(Debug, Clone, Deserialize)]
pub struct NormalizerConfig {
    /// Accepted lead of a record's timestamp over the reference clock (seconds)
    #[serde(default = "default_clock_skew_seconds")]
    pub clock_skew_seconds: i64,

    /// Trash detections below this confidence are dropped
    #[serde(default = "default_min_detection_confidence")]
    pub min_detection_confidence: f64,

    /// Scale of the saturating trash severity curve
    #[serde(default = "default_trash_item_scale")]
    pub trash_item_scale: f64,

    /// Category substring -> hazard multiplier (highest match wins)
    #[serde(default = "default_category_hazard")]
    pub category_hazard: BTreeMap<String, f64>,
}

fn default_clock_skew_seconds() -> i64 {
    300
}

fn default_min_detection_confidence() -> f64 {
    0.5
}

fn default_trash_item_scale() -> f64 {
    0.25
}

fn default_category_hazard() -> BTreeMap<String, f64> {
    [
        ("industrial", 3.0),
        ("electronic", 3.0),
        ("organic", 2.0),
        ("metal", 1.5),
        ("aluminum", 1.5),
        ("plastic", 1.3),
        ("glass", 1.2),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            clock_skew_seconds: default_clock_skew_seconds(),
            min_detection_confidence: default_min_detection_confidence(),
            trash_item_scale: default_trash_item_scale(),
            category_hazard: default_category_hazard(),
        }
    }
}

/// Converts raw inference records into canonical observations.
///
/// Stateless apart from its configuration; normalization has no side effects.
#[derive(Debug, Clone)]
pub struct Normalizer {
    config: NormalizerConfig,
}

impl Normalizer {
    pub fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    /// Validate `record` against the reference time `now` and build an observation.
    ///
    /// Validation rules:
    /// - Location: finite, lat in [-90, 90], lon in [-180, 180]
    /// - Timestamp: not later than `now` plus the configured clock skew
    /// - Confidences and water indices: finite and in [0, 1]
    /// - Trash boxes: x2 >= x1 and y2 >= y1, non-empty category
    pub fn normalize(
        &self,
        record: &InferenceRecord,
        now: DateTime<Utc>,
    ) -> Result<Observation, ValidationError> {
        let location = LatLon::new(record.lat, record.lon);
        check_location(location)?;
        self.check_timestamp(record.timestamp, now)?;

        let (kind, severity, source_confidence, attributes) = match &record.payload {
            InferencePayload::Trash { detections } => {
                let (severity, confidence, attributes) = self.summarize_trash(detections)?;
                (ObservationKind::Trash, severity, confidence, attributes)
            }
            InferencePayload::Water { readings } => {
                let (severity, confidence, attributes) = summarize_water(readings)?;
                (ObservationKind::Water, severity, confidence, attributes)
            }
        };

        Ok(Observation {
            id: Uuid::now_v7(),
            kind,
            location,
            timestamp: record.timestamp,
            severity,
            source_confidence,
            attributes,
            image_id: record.image_id.clone(),
        })
    }

    /// Reject timestamps further in the future than the allowed clock skew.
    pub fn check_timestamp(
        &self,
        timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        let latest = Duration::try_seconds(self.config.clock_skew_seconds)
            .and_then(|skew| now.checked_add_signed(skew));
        match latest {
            Some(latest) if timestamp > latest => {
                Err(ValidationError::FutureTimestamp { timestamp, now })
            }
            _ => Ok(()),
        }
    }

    /// Hazard multiplier for a trash category; the highest matching substring wins.
    pub fn hazard(&self, category: &str) -> f64 {
        let category = category.to_ascii_lowercase();
        self.config
            .category_hazard
            .iter()
            .filter(|(needle, _)| category.contains(needle.as_str()))
            .map(|(_, hazard)| *hazard)
            .reduce(f64::max)
            .unwrap_or(1.0)
    }

    fn summarize_trash(
        &self,
        detections: &[TrashDetection],
    ) -> Result<(f64, f64, BTreeMap<String, f64>), ValidationError> {
        let mut hazard_sum = 0.0;
        let mut confidence_sum = 0.0;
        let mut kept = 0usize;
        let mut counts: BTreeMap<String, f64> = BTreeMap::new();

        for (index, detection) in detections.iter().enumerate() {
            check_unit("detection confidence", detection.confidence)?;

            let category = detection.category.trim();
            if category.is_empty() {
                return Err(ValidationError::MissingCategory { index });
            }

            let bbox = &detection.bbox;
            if !(bbox.x1.is_finite() && bbox.y1.is_finite() && bbox.x2.is_finite() && bbox.y2.is_finite())
                || bbox.x2 < bbox.x1
                || bbox.y2 < bbox.y1
            {
                return Err(ValidationError::InvalidBoundingBox { index });
            }

            if detection.confidence < self.config.min_detection_confidence {
                continue;
            }

            hazard_sum += self.hazard(category);
            confidence_sum += detection.confidence;
            kept += 1;
            *counts.entry(category.to_string()).or_insert(0.0) += 1.0;
        }

        if kept == 0 {
            return Ok((0.0, 0.0, counts));
        }

        let severity = 1.0 - (-self.config.trash_item_scale * hazard_sum).exp();
        Ok((severity.clamp(0.0, 1.0), confidence_sum / kept as f64, counts))
    }
}

fn summarize_water(
    readings: &[WaterReading],
) -> Result<(f64, f64, BTreeMap<String, f64>), ValidationError> {
    let mut worst: f64 = 0.0;
    let mut confidence_sum = 0.0;
    let mut indices: BTreeMap<String, f64> = BTreeMap::new();

    for reading in readings {
        check_unit("reading confidence", reading.confidence)?;
        check_unit("contamination index", reading.index)?;

        worst = worst.max(reading.index);
        confidence_sum += reading.confidence;
        let entry = indices
            .entry(reading.contamination_type.trim().to_string())
            .or_insert(0.0);
        *entry = entry.max(reading.index);
    }

    if readings.is_empty() {
        return Ok((0.0, 0.0, indices));
    }
    Ok((worst, confidence_sum / readings.len() as f64, indices))
}

pub(crate) fn check_location(location: LatLon) -> Result<(), ValidationError> {
    if location.is_valid() {
        Ok(())
    } else {
        Err(ValidationError::InvalidLocation {
            lat: location.lat,
            lon: location.lon,
        })
    }
}

pub(crate) fn check_unit(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange { field, value })
    }
}
