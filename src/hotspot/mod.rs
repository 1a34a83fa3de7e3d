// Hotspot ranking/merging and heatmap rasterization over the spatial index

use crate::grid::{distance_km, CellKey, CellSnapshot, GeoBounds, QueryError, Region, SpatialIndex};
use crate::observation::{LatLon, Observation, ObservationKind};
use crate::scoring::{priority, RiskLevel, RiskScorer, Trend};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::warn;


/// Which observation kinds a query scores
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KindFilter {
    #[default]
    All,
    Trash,
    Water,
}

impl KindFilter {
    pub fn admits(&self, kind: ObservationKind) -> bool {
        match self {
            KindFilter::All => true,
            KindFilter::Trash => kind == ObservationKind::Trash,
            KindFilter::Water => kind == ObservationKind::Water,
        }
    }
}

impl std::str::FromStr for KindFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(KindFilter::All),
            "trash" => Ok(KindFilter::Trash),
            "water" => Ok(KindFilter::Water),
            other => Err(format!("unknown kind filter '{other}', expected trash, water or all")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HotspotQuery {
    pub region: Region,
    pub zoom_level: u8,
    /// Minimum cell score to qualify
    pub score_threshold: f64,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub kinds: KindFilter,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeatmapQuery {
    pub bounds: GeoBounds,
    pub zoom_level: u8,
    #[serde(default)]
    pub kinds: KindFilter,
}

/// Group of edge-adjacent cells above the threshold, reported as one hazard.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Hotspot {
    /// Derived from the highest-ranked member cell
    pub id: String,
    /// 1-based position in the result
    pub rank: usize,
    /// Score-weighted average of member cell centres
    pub centroid: LatLon,
    /// Union of member cell bounds
    pub extent: GeoBounds,
    pub peak_score: f64,
    pub mean_score: f64,
    pub risk_level: RiskLevel,
    pub priority: u8,
    /// Member cells in rank order
    pub cells: Vec<CellKey>,
    pub observation_count: usize,
    pub item_count: u64,
    pub contamination_types: BTreeSet<String>,
    pub contributing_kinds: BTreeSet<ObservationKind>,
    pub last_updated: DateTime<Utc>,
    /// Trend of the highest-ranked member cell
    pub trend: Trend,
    /// Centroid distance from the query centre (radius queries only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
}

/// Dense score grid for tile rendering.
///
/// `values[i][j]` is the cell at row `origin_row + i` (south to north) and
/// column `origin_col + j` (west to east). Positions without data are 0.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Heatmap {
    /// Requested bounds snapped outward to cell borders
    pub bounds: GeoBounds,
    pub zoom_level: u8,
    pub precision: u8,
    pub cell_size_deg: f64,
    pub rows: usize,
    pub cols: usize,
    pub origin_row: i64,
    pub origin_col: i64,
    pub values: Vec<Vec<f64>>,
    pub max_value: f64,
}

impl Heatmap {
    /// Score of the grid position covering `location`, if inside the grid.
    pub fn value_at(&self, location: LatLon) -> Option<f64> {
        let key = CellKey::for_location(location, self.precision);
        let i = usize::try_from(key.row - self.origin_row).ok()?;
        let j = usize::try_from(key.col - self.origin_col).ok()?;
        self.values.get(i)?.get(j).copied()
    }
}

/// A cell snapshot scored at the query's reference time
struct ScoredCell {
    snapshot: CellSnapshot,
    value: f64,
    kinds: BTreeSet<ObservationKind>,
}

impl ScoredCell {
    fn admitted<'a>(&'a self, filter: KindFilter) -> impl Iterator<Item = &'a Observation> + 'a {
        self.snapshot
            .observations
            .iter()
            .map(|o| o.as_ref())
            .filter(move |o| filter.admits(o.kind))
    }
}

/// Value descending, then most recently updated, then cell key.
fn rank_order(a: &ScoredCell, b: &ScoredCell) -> Ordering {
    b.value
        .total_cmp(&a.value)
        .then_with(|| b.snapshot.score.last_updated.cmp(&a.snapshot.score.last_updated))
        .then_with(|| a.snapshot.key.cmp(&b.snapshot.key))
}

/// Read-side view combining the index with the scorer.
pub struct HotspotAggregator<'a> {
    index: &'a SpatialIndex,
    scorer: &'a RiskScorer,
}

impl<'a> HotspotAggregator<'a> {
    pub fn new(index: &'a SpatialIndex, scorer: &'a RiskScorer) -> Self {
        Self { index, scorer }
    }

    /// Score snapshots at `now`. A cell that fails to score is logged and skipped.
    fn score_cells(
        &self,
        cells: Vec<CellSnapshot>,
        filter: KindFilter,
        now: DateTime<Utc>,
    ) -> Vec<ScoredCell> {
        cells
            .into_iter()
            .filter_map(|snapshot| {
                let admitted = snapshot
                    .observations
                    .iter()
                    .map(|o| o.as_ref())
                    .filter(|o| filter.admits(o.kind));
                match self.scorer.evaluate(admitted, now) {
                    Ok((value, kinds)) => Some(ScoredCell {
                        snapshot,
                        value,
                        kinds,
                    }),
                    Err(e) => {
                        warn!(cell = %snapshot.key, error = %e, "Skipping cell that failed to score");
                        None
                    }
                }
            })
            .collect()
    }

    /// Ranked, merged hotspots inside the query region.
    pub fn hotspots(
        &self,
        query: &HotspotQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<Hotspot>, QueryError> {
        if !(0.0..=1.0).contains(&query.score_threshold) {
            return Err(QueryError::InvalidThreshold(query.score_threshold));
        }

        let cells = self.index.query_range(&query.region, query.zoom_level)?;
        let mut qualifying: Vec<ScoredCell> = self
            .score_cells(cells, query.kinds, now)
            .into_iter()
            .filter(|c| c.value > 0.0 && c.value >= query.score_threshold)
            .collect();
        qualifying.sort_by(rank_order);

        let mut hotspots: Vec<Hotspot> = merge_adjacent(&qualifying)
            .into_iter()
            .enumerate()
            .map(|(i, members)| build_hotspot(i + 1, &members, query))
            .collect();

        if let Some(limit) = query.limit {
            hotspots.truncate(limit);
        }
        Ok(hotspots)
    }

    /// Dense score grid over the query bounds.
    pub fn heatmap(&self, query: &HeatmapQuery, now: DateTime<Utc>) -> Result<Heatmap, QueryError> {
        query.bounds.validate()?;
        let level = self.index.resolve_zoom(query.zoom_level);
        let span = self.index.span(&query.bounds, level)?;

        let cells = self
            .index
            .query_range(&Region::BBox(query.bounds), query.zoom_level)?;

        let mut values = vec![vec![0.0; span.cols()]; span.rows()];
        let mut max_value: f64 = 0.0;
        for cell in self.score_cells(cells, query.kinds, now) {
            if !span.contains(&cell.snapshot.key) {
                continue;
            }
            let i = (cell.snapshot.key.row - span.row_min) as usize;
            let j = (cell.snapshot.key.col - span.col_min) as usize;
            values[i][j] = cell.value;
            max_value = max_value.max(cell.value);
        }

        let south_west = CellKey {
            precision: level.precision,
            row: span.row_min,
            col: span.col_min,
        };
        let north_east = CellKey {
            precision: level.precision,
            row: span.row_max,
            col: span.col_max,
        };

        Ok(Heatmap {
            bounds: south_west.bounds().union(&north_east.bounds()),
            zoom_level: query.zoom_level,
            precision: level.precision,
            cell_size_deg: level.cell_size_deg(),
            rows: span.rows(),
            cols: span.cols(),
            origin_row: span.row_min,
            origin_col: span.col_min,
            values,
            max_value,
        })
    }
}

/// Group ranked cells into edge-connected components.
///
/// Components come out ordered by their best cell, members in rank order.
fn merge_adjacent(ranked: &[ScoredCell]) -> Vec<Vec<&ScoredCell>> {
    let position: HashMap<CellKey, usize> = ranked
        .iter()
        .enumerate()
        .map(|(i, c)| (c.snapshot.key, i))
        .collect();
    let mut visited = vec![false; ranked.len()];
    let mut components = Vec::new();

    for start in 0..ranked.len() {
        if visited[start] {
            continue;
        }
        visited[start] = true;
        let mut members = vec![start];
        let mut queue = VecDeque::from([start]);

        while let Some(i) = queue.pop_front() {
            for neighbor in ranked[i].snapshot.key.neighbors() {
                if let Some(&j) = position.get(&neighbor) {
                    if !visited[j] {
                        visited[j] = true;
                        members.push(j);
                        queue.push_back(j);
                    }
                }
            }
        }

        members.sort_unstable();
        components.push(members.into_iter().map(|i| &ranked[i]).collect());
    }

    components
}

fn build_hotspot(rank: usize, members: &[&ScoredCell], query: &HotspotQuery) -> Hotspot {
    let lead = members[0];

    let total: f64 = members.iter().map(|c| c.value).sum();
    let (lat_sum, lon_sum) = members.iter().fold((0.0, 0.0), |(lat, lon), c| {
        let center = c.snapshot.key.center();
        (lat + c.value * center.lat, lon + c.value * center.lon)
    });
    let centroid = LatLon::new(lat_sum / total, lon_sum / total);

    let extent = members
        .iter()
        .skip(1)
        .fold(lead.snapshot.bounds, |acc, c| acc.union(&c.snapshot.bounds));

    let mut observation_count = 0;
    let mut item_count = 0;
    let mut contamination_types = BTreeSet::new();
    let mut contributing_kinds = BTreeSet::new();
    for member in members {
        contributing_kinds.extend(member.kinds.iter().copied());
        for observation in member.admitted(query.kinds) {
            observation_count += 1;
            item_count += observation.item_count();
            if observation.kind == ObservationKind::Water {
                contamination_types.extend(observation.attributes.keys().cloned());
            }
        }
    }

    let last_updated = members
        .iter()
        .map(|c| c.snapshot.score.last_updated)
        .max()
        .unwrap_or(lead.snapshot.score.last_updated);

    Hotspot {
        id: format!("hs-{}", lead.snapshot.key),
        rank,
        centroid,
        extent,
        peak_score: lead.value,
        mean_score: total / members.len() as f64,
        risk_level: RiskLevel::from_score(lead.value),
        priority: priority(lead.value),
        cells: members.iter().map(|c| c.snapshot.key).collect(),
        observation_count,
        item_count,
        contamination_types,
        contributing_kinds,
        last_updated,
        trend: lead.snapshot.score.trend,
        distance_km: query.region.center().map(|c| distance_km(c, centroid)),
    }
}
