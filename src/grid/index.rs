use super::{grid_index, grid_index_below, CellKey, GeoBounds, GridConfig, GridLevel, QueryError, Region};
use crate::observation::{LatLon, Observation};
use crate::scoring::RiskScore;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;
use uuid::Uuid;

/// Spatial bucket holding observations and a cached score
#[derive(Debug)]
pub struct Cell {
    key: CellKey,

    /// Ordered by (timestamp, id)
    observations: Vec<Arc<Observation>>,

    score: RiskScore,
}

impl Cell {
    fn new(key: CellKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            observations: Vec::new(),
            score: RiskScore::zero(now),
        }
    }

    pub fn key(&self) -> CellKey {
        self.key
    }

    pub fn observations(&self) -> &[Arc<Observation>] {
        &self.observations
    }

    pub fn score(&self) -> &RiskScore {
        &self.score
    }

    /// Insert keeping time order. Returns false if the observation is already present.
    fn insert(&mut self, observation: Arc<Observation>) -> bool {
        let sort_key = (observation.timestamp, observation.id);
        match self
            .observations
            .binary_search_by(|o| (o.timestamp, o.id).cmp(&sort_key))
        {
            Ok(_) => false,
            Err(pos) => {
                self.observations.insert(pos, observation);
                true
            }
        }
    }

    /// Drop observations stamped before `cutoff`, returning how many were removed.
    fn evict_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let expired = self.observations.partition_point(|o| o.timestamp < cutoff);
        self.observations.drain(..expired);
        expired
    }

    fn snapshot(&self) -> CellSnapshot {
        CellSnapshot {
            key: self.key,
            bounds: self.key.bounds(),
            observations: self.observations.clone(),
            score: self.score.clone(),
        }
    }
}

/// Read-only copy of a cell taken at query time
#[derive(Clone, Debug)]
pub struct CellSnapshot {
    pub key: CellKey,
    pub bounds: GeoBounds,
    pub observations: Vec<Arc<Observation>>,
    pub score: RiskScore,
}

/// Inclusive row/column range of a query at one grid level
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GridSpan {
    pub level: GridLevel,
    pub row_min: i64,
    pub row_max: i64,
    pub col_min: i64,
    pub col_max: i64,
}

impl GridSpan {
    pub fn rows(&self) -> usize {
        (self.row_max - self.row_min + 1) as usize
    }

    pub fn cols(&self) -> usize {
        (self.col_max - self.col_min + 1) as usize
    }

    pub fn cell_count(&self) -> u64 {
        (self.row_max - self.row_min + 1) as u64 * (self.col_max - self.col_min + 1) as u64
    }

    pub fn contains(&self, key: &CellKey) -> bool {
        key.precision == self.level.precision
            && (self.row_min..=self.row_max).contains(&key.row)
            && (self.col_min..=self.col_max).contains(&key.col)
    }

    /// Keys in row-major order, south to north then west to east
    pub fn keys(&self) -> impl Iterator<Item = CellKey> + '_ {
        (self.row_min..=self.row_max).flat_map(move |row| {
            (self.col_min..=self.col_max).map(move |col| CellKey {
                precision: self.level.precision,
                row,
                col,
            })
        })
    }
}

/// Result of an eviction sweep
#[derive(Clone, Debug, Default)]
pub struct SweepOutcome {
    /// Cells that lost observations but still hold some
    pub touched: Vec<CellKey>,

    /// Cells deleted because they became empty
    pub removed: Vec<CellKey>,

    /// Observations evicted (counted once, not per level)
    pub evicted_observations: usize,
}

struct LevelCells {
    precision: u8,
    cells: DashMap<CellKey, Cell>,
}

/// Multi-resolution spatial index.
///
/// Every observation is stored once per distinct precision, in exactly one
/// cell of that precision. Writers to the same cell are serialized by the
/// map's shard lock; readers copy out snapshots.
pub struct SpatialIndex {
    /// Zoom levels sorted ascending
    zooms: Vec<GridLevel>,

    /// One map per distinct precision, coarse to fine
    levels: Vec<LevelCells>,

    retention: Duration,

    /// Indexed observations by (timestamp, id), so a sweep visits only
    /// the cells holding expired data
    expiry: Mutex<BTreeMap<(DateTime<Utc>, Uuid), LatLon>>,

    max_query_cells: usize,
}

impl SpatialIndex {
    pub fn new(config: &GridConfig) -> Self {
        let mut zooms = config.levels.clone();
        zooms.sort_by_key(|l| l.zoom);

        let mut precisions: Vec<u8> = zooms.iter().map(|l| l.precision).collect();
        precisions.sort_unstable();
        precisions.dedup();

        Self {
            zooms,
            levels: precisions
                .into_iter()
                .map(|precision| LevelCells {
                    precision,
                    cells: DashMap::new(),
                })
                .collect(),
            retention: Duration::try_hours(config.retention_hours).unwrap_or(Duration::MAX),
            expiry: Mutex::new(BTreeMap::new()),
            max_query_cells: config.max_query_cells,
        }
    }

    /// Configured zoom levels, ascending
    pub fn levels(&self) -> &[GridLevel] {
        &self.zooms
    }

    /// Level used for a query zoom: the highest configured zoom not above
    /// `zoom`, or the coarsest level when `zoom` is below all of them.
    pub fn resolve_zoom(&self, zoom: u8) -> GridLevel {
        self.zooms
            .iter()
            .rev()
            .find(|l| l.zoom <= zoom)
            .or_else(|| self.zooms.first())
            .copied()
            .unwrap_or(GridLevel { zoom, precision: 0 })
    }

    /// Distinct precisions maintained, coarse to fine
    pub fn precisions(&self) -> Vec<u8> {
        self.levels.iter().map(|l| l.precision).collect()
    }

    /// Finest precision maintained by the index
    pub fn finest_precision(&self) -> u8 {
        self.levels.last().map(|l| l.precision).unwrap_or(0)
    }

    fn cells(&self, precision: u8) -> Option<&DashMap<CellKey, Cell>> {
        self.levels
            .iter()
            .find(|l| l.precision == precision)
            .map(|l| &l.cells)
    }

    fn finest(&self) -> Option<&DashMap<CellKey, Cell>> {
        self.levels.last().map(|l| &l.cells)
    }

    /// Insert an observation into its cell at every precision.
    ///
    /// Returns the affected cell keys, coarse to fine. Re-inserting an
    /// observation that is already indexed changes nothing and returns no keys.
    pub fn insert(&self, observation: Arc<Observation>, now: DateTime<Utc>) -> Vec<CellKey> {
        let mut affected = Vec::with_capacity(self.levels.len());

        for level in &self.levels {
            let key = CellKey::for_location(observation.location, level.precision);
            let inserted = level
                .cells
                .entry(key)
                .or_insert_with(|| Cell::new(key, now))
                .insert(Arc::clone(&observation));
            if inserted {
                affected.push(key);
            }
        }

        if !affected.is_empty() {
            self.expiry_queue()
                .insert((observation.timestamp, observation.id), observation.location);
        }
        affected
    }

    fn expiry_queue(&self) -> MutexGuard<'_, BTreeMap<(DateTime<Utc>, Uuid), LatLon>> {
        self.expiry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Observations waiting to expire
    pub fn pending_expiry(&self) -> usize {
        self.expiry_queue().len()
    }

    /// Remove and return the locations of observations stamped before `cutoff`.
    fn take_expired(&self, cutoff: DateTime<Utc>) -> Vec<LatLon> {
        let mut queue = self.expiry_queue();
        let live = queue.split_off(&(cutoff, Uuid::nil()));
        std::mem::replace(&mut *queue, live).into_values().collect()
    }

    /// Replace a cell's cached score with the result of `f`.
    ///
    /// `f` sees the current observation list and previous score under the
    /// cell's write lock. On error the previous score is kept. Returns `None`
    /// if the cell does not exist.
    pub fn recompute<F, E>(&self, key: &CellKey, f: F) -> Option<Result<RiskScore, E>>
    where
        F: FnOnce(&[Arc<Observation>], &RiskScore) -> Result<RiskScore, E>,
    {
        let cells = self.cells(key.precision)?;
        let mut cell = cells.get_mut(key)?;
        let result = f(&cell.observations, &cell.score);
        if let Ok(score) = &result {
            cell.score = score.clone();
        }
        Some(result)
    }

    /// Evict observations older than the retention window and delete empty cells.
    ///
    /// Only cells holding expired observations are visited.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        // Nothing can be older than a window reaching past the calendar
        let Some(cutoff) = now.checked_sub_signed(self.retention) else {
            return outcome;
        };
        let expired = self.take_expired(cutoff);
        if expired.is_empty() {
            return outcome;
        }
        let finest_precision = self.finest_precision();

        for level in &self.levels {
            let keys: BTreeSet<CellKey> = expired
                .iter()
                .map(|location| CellKey::for_location(*location, level.precision))
                .collect();
            let mut emptied = Vec::new();

            for key in keys {
                // Already emptied and removed by an earlier sweep
                let Some(mut cell) = level.cells.get_mut(&key) else {
                    continue;
                };
                let evicted = cell.evict_before(cutoff);
                if evicted == 0 {
                    continue;
                }
                if level.precision == finest_precision {
                    outcome.evicted_observations += evicted;
                }
                if cell.observations.is_empty() {
                    emptied.push(cell.key);
                } else {
                    outcome.touched.push(cell.key);
                }
            }

            // A concurrent insert may have refilled the cell since the scan
            for key in emptied {
                match level.cells.remove_if(&key, |_, c| c.observations.is_empty()) {
                    Some(_) => outcome.removed.push(key),
                    None => outcome.touched.push(key),
                }
            }
        }

        if outcome.evicted_observations > 0 {
            debug!(
                evicted = outcome.evicted_observations,
                removed_cells = outcome.removed.len(),
                cutoff = %cutoff,
                "Sweep evicted expired observations"
            );
        }

        outcome
    }

    /// Grid positions covering `bounds` at `level`, checked against the query budget.
    pub fn span(&self, bounds: &GeoBounds, level: GridLevel) -> Result<GridSpan, QueryError> {
        let p = level.precision;
        let row_min = grid_index(bounds.min_lat, p);
        let col_min = grid_index(bounds.min_lon, p);
        // Upper edges are exclusive so a bound on a cell border adds no extra row/column
        let row_max = grid_index_below(bounds.max_lat, p).max(row_min);
        let col_max = grid_index_below(bounds.max_lon, p).max(col_min);

        let span = GridSpan {
            level,
            row_min,
            row_max,
            col_min,
            col_max,
        };

        let requested = span.cell_count();
        if requested > self.max_query_cells as u64 {
            return Err(QueryError::RegionTooLarge {
                requested,
                max: self.max_query_cells,
            });
        }
        Ok(span)
    }

    /// Snapshot every populated cell intersecting `region` at the level for `zoom`.
    ///
    /// Cost is bounded by the smaller of the region's cell span and the number
    /// of populated cells at that level, never by the observation count.
    pub fn query_range(&self, region: &Region, zoom: u8) -> Result<Vec<CellSnapshot>, QueryError> {
        region.validate()?;
        let level = self.resolve_zoom(zoom);
        let spans = region
            .bounds()
            .iter()
            .map(|bounds| self.span(bounds, level))
            .collect::<Result<Vec<GridSpan>, QueryError>>()?;

        let requested: u64 = spans.iter().map(GridSpan::cell_count).sum();
        if requested > self.max_query_cells as u64 {
            return Err(QueryError::RegionTooLarge {
                requested,
                max: self.max_query_cells,
            });
        }

        let Some(cells) = self.cells(level.precision) else {
            return Ok(Vec::new());
        };

        let mut snapshots: Vec<CellSnapshot> = if requested > cells.len() as u64 {
            cells
                .iter()
                .filter(|c| spans.iter().any(|span| span.contains(&c.key)))
                .filter(|c| region.admits_cell(&c.key))
                .map(|c| c.snapshot())
                .collect()
        } else {
            spans
                .iter()
                .flat_map(|span| span.keys())
                .filter(|key| region.admits_cell(key))
                .filter_map(|key| cells.get(&key).map(|c| c.snapshot()))
                .collect()
        };

        snapshots.sort_by_key(|s| s.key);
        snapshots.dedup_by_key(|s| s.key);
        Ok(snapshots)
    }

    pub fn get(&self, key: &CellKey) -> Option<CellSnapshot> {
        self.cells(key.precision)?.get(key).map(|c| c.snapshot())
    }

    /// Keys of all populated cells at `precision`, sorted
    pub fn cell_keys(&self, precision: u8) -> Vec<CellKey> {
        let mut keys: Vec<CellKey> = self
            .cells(precision)
            .map(|cells| cells.iter().map(|c| c.key).collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Populated cells across all levels
    pub fn cell_count(&self) -> usize {
        self.levels.iter().map(|l| l.cells.len()).sum()
    }

    pub fn observation_count(&self) -> usize {
        self.finest()
            .map(|cells| cells.iter().map(|c| c.observations.len()).sum())
            .unwrap_or(0)
    }

    /// All indexed observations ordered by (timestamp, id)
    pub fn observations(&self) -> Vec<Observation> {
        let mut all: Vec<Arc<Observation>> = self
            .finest()
            .map(|cells| {
                cells
                    .iter()
                    .flat_map(|c| c.observations.clone())
                    .collect()
            })
            .unwrap_or_default();
        all.sort_by_key(|o| (o.timestamp, o.id));
        all.into_iter().map(|o| (*o).clone()).collect()
    }
}
