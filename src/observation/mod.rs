use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

mod validation;

pub use validation::{Normalizer, NormalizerConfig, ValidationError};

/// Kind of environmental signal an observation carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationKind {
    Trash,
    Water,
}

impl fmt::Display for ObservationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObservationKind::Trash => write!(f, "trash"),
            ObservationKind::Water => write!(f, "water"),
        }
    }
}

/// WGS84 coordinate in decimal degrees.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// True when both components are finite and inside the WGS84 ranges.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// A normalized detection or measurement.
///
/// Observations are immutable once constructed. After insertion the spatial
/// index holds them behind `Arc`, shared between grid levels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// UUIDv7 identifier (time-ordered)
    pub id: Uuid,

    pub kind: ObservationKind,

    pub location: LatLon,

    /// Capture time reported by the upload layer
    pub timestamp: DateTime<Utc>,

    /// Normalized hazard in [0,1]
    pub severity: f64,

    /// Confidence of the upstream model in [0,1]
    pub source_confidence: f64,

    /// Item-category counts (trash) or contamination indices (water)
    pub attributes: BTreeMap<String, f64>,

    /// Upstream image identifier, if the upload layer supplied one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
}

impl Observation {
    /// Build an observation from already-normalized values.
    ///
    /// Applies the same range checks as the normalizer except the clock-skew
    /// check, which needs a reference time (see [`Normalizer::check_timestamp`]).
    pub fn new(
        kind: ObservationKind,
        location: LatLon,
        timestamp: DateTime<Utc>,
        severity: f64,
        source_confidence: f64,
        attributes: BTreeMap<String, f64>,
    ) -> Result<Self, ValidationError> {
        let observation = Self {
            id: Uuid::now_v7(),
            kind,
            location,
            timestamp,
            severity,
            source_confidence,
            attributes,
            image_id: None,
        };
        observation.validate()?;
        Ok(observation)
    }

    /// Range checks on location, severity and confidence.
    ///
    /// Observations that did not come through the normalizer (snapshots,
    /// replays) must pass this before they are indexed.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validation::check_location(self.location)?;
        validation::check_unit("severity", self.severity)?;
        validation::check_unit("source_confidence", self.source_confidence)
    }

    /// Sum of trash item counts recorded in the attributes.
    pub fn item_count(&self) -> u64 {
        match self.kind {
            ObservationKind::Trash => self.attributes.values().map(|c| c.max(0.0) as u64).sum(),
            ObservationKind::Water => 0,
        }
    }
}

/// Pixel-space bounding box reported by the object detector.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PixelBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

/// One trash detection from the object-detection model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrashDetection {
    pub category: String,
    pub bbox: PixelBox,
    pub confidence: f64,
}

/// One contamination reading from the water-quality model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WaterReading {
    pub contamination_type: String,
    /// Contamination index in [0,1]
    pub index: f64,
    pub confidence: f64,
}

/// Model output for a single image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InferencePayload {
    Trash { detections: Vec<TrashDetection> },
    Water { readings: Vec<WaterReading> },
}

/// Raw record handed over by the upload/inference layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferenceRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: InferencePayload,
}
