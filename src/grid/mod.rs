// Multi-resolution lat/lon grid and spatial index

mod index;

pub use index::{Cell, CellSnapshot, GridSpan, SpatialIndex, SweepOutcome};

use crate::observation::LatLon;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Finest supported truncation precision (decimal digits, ~0.1 m cells)
pub const MAX_PRECISION: u8 = 6;

/// Kilometres per degree of latitude
pub const KM_PER_DEGREE: f64 = 111.0;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Coordinates this close to a cell edge (degrees) are snapped onto it
const EDGE_TOLERANCE_DEG: f64 = 1e-9;

/// One resolution of the grid pyramid.
///
/// A location maps to a cell by truncating latitude and longitude to
/// `precision` decimal digits, giving cells of `10^-precision` degrees.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridLevel {
    pub zoom: u8,
    pub precision: u8,
}

impl GridLevel {
    pub fn cell_size_deg(&self) -> f64 {
        1.0 / scale(self.precision)
    }
}

/// Grid configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Resolutions maintained by the index (query zoom -> precision)
    #[serde(default = "default_levels")]
    pub levels: Vec<GridLevel>,

    /// Observations older than this are evicted by the sweep (hours)
    #[serde(default = "default_retention_hours")]
    pub retention_hours: i64,

    /// Largest number of grid positions a single query may span
    #[serde(default = "default_max_query_cells")]
    pub max_query_cells: usize,
}

fn default_levels() -> Vec<GridLevel> {
    vec![
        GridLevel { zoom: 0, precision: 0 },
        GridLevel { zoom: 8, precision: 1 },
        GridLevel { zoom: 11, precision: 2 },
        GridLevel { zoom: 14, precision: 3 },
    ]
}

fn default_retention_hours() -> i64 {
    720
}

fn default_max_query_cells() -> usize {
    65_536
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            levels: default_levels(),
            retention_hours: default_retention_hours(),
            max_query_cells: default_max_query_cells(),
        }
    }
}

fn scale(precision: u8) -> f64 {
    10f64.powi(precision as i32)
}

/// Row or column holding `value` at `precision`.
///
/// `floor(value * 10^p)`, except that a value within `EDGE_TOLERANCE_DEG` of
/// a cell edge belongs to the cell starting at that edge. Decimal edges such
/// as 0.29 are not exact in binary, and a plain floor would file them one
/// cell low, outside the bounds reported for their own key.
pub(crate) fn grid_index(value: f64, precision: u8) -> i64 {
    let s = scale(precision);
    let scaled = value * s;
    let edge = scaled.round();
    if (scaled - edge).abs() <= EDGE_TOLERANCE_DEG * s {
        edge as i64
    } else {
        scaled.floor() as i64
    }
}

/// Last row or column covered by an exclusive upper bound at `precision`.
pub(crate) fn grid_index_below(value: f64, precision: u8) -> i64 {
    let s = scale(precision);
    let scaled = value * s;
    let edge = scaled.round();
    if (scaled - edge).abs() <= EDGE_TOLERANCE_DEG * s {
        edge as i64 - 1
    } else {
        scaled.floor() as i64
    }
}

/// Address of a grid cell: truncated latitude row and longitude column at a precision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellKey {
    pub precision: u8,
    pub row: i64,
    pub col: i64,
}

impl CellKey {
    /// Fixed-precision truncation used for both insertion and queries.
    pub fn for_location(location: LatLon, precision: u8) -> Self {
        Self {
            precision,
            row: grid_index(location.lat, precision),
            col: grid_index(location.lon, precision),
        }
    }

    pub fn bounds(&self) -> GeoBounds {
        let s = scale(self.precision);
        GeoBounds {
            min_lat: self.row as f64 / s,
            min_lon: self.col as f64 / s,
            max_lat: (self.row + 1) as f64 / s,
            max_lon: (self.col + 1) as f64 / s,
        }
    }

    pub fn center(&self) -> LatLon {
        self.bounds().center()
    }

    /// Edge neighbours (north, south, east, west)
    pub fn neighbors(&self) -> [CellKey; 4] {
        let at = |row, col| CellKey {
            precision: self.precision,
            row,
            col,
        };
        [
            at(self.row + 1, self.col),
            at(self.row - 1, self.col),
            at(self.row, self.col + 1),
            at(self.row, self.col - 1),
        ]
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}/{}/{}", self.precision, self.row, self.col)
    }
}

/// Axis-aligned lat/lon rectangle.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl GeoBounds {
    pub fn new(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> Self {
        Self {
            min_lat,
            min_lon,
            max_lat,
            max_lon,
        }
    }

    pub fn validate(&self) -> Result<(), QueryError> {
        let corners = [
            LatLon::new(self.min_lat, self.min_lon),
            LatLon::new(self.max_lat, self.max_lon),
        ];
        if corners.iter().any(|c| !c.is_valid()) {
            return Err(QueryError::InvalidRegion(format!(
                "bounds {:?} outside valid latitude/longitude ranges",
                self
            )));
        }
        if self.min_lat >= self.max_lat || self.min_lon >= self.max_lon {
            return Err(QueryError::InvalidRegion(format!(
                "bounds {:?} must have min < max on both axes",
                self
            )));
        }
        Ok(())
    }

    pub fn center(&self) -> LatLon {
        LatLon::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lon + self.max_lon) / 2.0,
        )
    }

    pub fn union(&self, other: &GeoBounds) -> GeoBounds {
        GeoBounds {
            min_lat: self.min_lat.min(other.min_lat),
            min_lon: self.min_lon.min(other.min_lon),
            max_lat: self.max_lat.max(other.max_lat),
            max_lon: self.max_lon.max(other.max_lon),
        }
    }

    /// Point of the rectangle closest to `p` (per-axis clamp)
    fn closest_point(&self, p: LatLon) -> LatLon {
        LatLon::new(
            p.lat.clamp(self.min_lat, self.max_lat),
            p.lon.clamp(self.min_lon, self.max_lon),
        )
    }
}

/// Great-circle distance in kilometres
pub fn distance_km(a: LatLon, b: LatLon) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

/// Area of interest for range queries
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Region {
    BBox(GeoBounds),
    Radius { center: LatLon, radius_km: f64 },
}

impl Region {
    pub fn validate(&self) -> Result<(), QueryError> {
        match self {
            Region::BBox(bounds) => bounds.validate(),
            Region::Radius { center, radius_km } => {
                if !center.is_valid() {
                    return Err(QueryError::InvalidRegion(format!(
                        "center ({}, {}) outside valid latitude/longitude ranges",
                        center.lat, center.lon
                    )));
                }
                if !radius_km.is_finite() || *radius_km <= 0.0 {
                    return Err(QueryError::InvalidRegion(format!(
                        "radius must be positive, got {radius_km}"
                    )));
                }
                Ok(())
            }
        }
    }

    /// Bounding rectangles covering the region.
    ///
    /// A radius region reaching past ±180° longitude is split in two at the
    /// antimeridian, so the parts never overlap.
    pub fn bounds(&self) -> Vec<GeoBounds> {
        let (center, radius_km) = match self {
            Region::BBox(bounds) => return vec![*bounds],
            Region::Radius { center, radius_km } => (center, radius_km),
        };

        let dlat = radius_km / KM_PER_DEGREE;
        let dlon = dlat / center.lat.to_radians().cos().max(1e-4);
        let min_lat = (center.lat - dlat).max(-90.0);
        let max_lat = (center.lat + dlat).min(90.0);
        let (west, east) = (center.lon - dlon, center.lon + dlon);

        if east - west >= 360.0 {
            vec![GeoBounds::new(min_lat, -180.0, max_lat, 180.0)]
        } else if west < -180.0 {
            vec![
                GeoBounds::new(min_lat, -180.0, max_lat, east),
                GeoBounds::new(min_lat, west + 360.0, max_lat, 180.0),
            ]
        } else if east > 180.0 {
            vec![
                GeoBounds::new(min_lat, -180.0, max_lat, east - 360.0),
                GeoBounds::new(min_lat, west, max_lat, 180.0),
            ]
        } else {
            vec![GeoBounds::new(min_lat, west, max_lat, east)]
        }
    }

    /// Whether a cell inside the region's grid span belongs to the region.
    ///
    /// A bounding box is exactly its span, so only radius regions test the
    /// cell's geometry.
    pub fn admits_cell(&self, cell: &CellKey) -> bool {
        match self {
            Region::BBox(_) => true,
            Region::Radius { center, radius_km } => {
                let bounds = cell.bounds();
                // Measure towards the copy of the centre on the cell's side of the antimeridian
                let offset = bounds.center().lon - center.lon;
                let lon = if offset > 180.0 {
                    center.lon + 360.0
                } else if offset < -180.0 {
                    center.lon - 360.0
                } else {
                    center.lon
                };
                let near = LatLon::new(center.lat, lon);
                distance_km(*center, bounds.closest_point(near)) <= *radius_km
            }
        }
    }

    pub fn center(&self) -> Option<LatLon> {
        match self {
            Region::BBox(_) => None,
            Region::Radius { center, .. } => Some(*center),
        }
    }
}

/// Query failures returned to the caller
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    #[error("invalid region: {0}")]
    InvalidRegion(String),

    #[error("score threshold must be within [0, 1], got {0}")]
    InvalidThreshold(f64),

    #[error("region spans {requested} cells, above the maximum of {max}; retry at a lower zoom")]
    RegionTooLarge { requested: u64, max: usize },
}
