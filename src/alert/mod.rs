// Alert evaluation: per-cell threshold state machine with cooldown suppression

use crate::grid::CellKey;
use crate::observation::LatLon;
use crate::scoring::RiskLevel;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;


/// Alert thresholds and suppression window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Score at which a cell enters Watch
    #[serde(default = "default_watch_threshold")]
    pub watch_threshold: f64,

    /// Score at which a watched cell raises an alert
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,

    /// Suppression window after an alert (minutes)
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: i64,
}

fn default_watch_threshold() -> f64 {
    0.5
}

fn default_alert_threshold() -> f64 {
    0.8
}

fn default_cooldown_minutes() -> i64 {
    360
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            watch_threshold: default_watch_threshold(),
            alert_threshold: default_alert_threshold(),
            cooldown_minutes: default_cooldown_minutes(),
        }
    }
}

/// Per-cell alert state.
///
/// `Alert` is transient: it is entered when an event is emitted and left on
/// the very next step, so it is never the resting state of a cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AlertState {
    Normal,
    Watch,
    Alert,
    Cooldown { until: DateTime<Utc> },
}

/// Alert handed to the delivery layer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    /// UUIDv7 identifier
    pub id: Uuid,
    pub cell_id: CellKey,
    /// Centre of the alerting cell
    pub location: LatLon,
    pub score: f64,
    pub severity_level: RiskLevel,
    pub triggered_at: DateTime<Utc>,
    /// No further alert for this cell before this time
    pub suppressed_until: DateTime<Utc>,
    pub expected_response_minutes: i64,
}

/// Tracks alert state per cell and emits de-duplicated events.
pub struct AlertEvaluator {
    config: AlertConfig,
    states: DashMap<CellKey, AlertState>,
}

impl AlertEvaluator {
    pub fn new(config: AlertConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
        }
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    /// End of the suppression window opened at `now`, saturating at the calendar's end.
    fn cooldown_end(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        Duration::try_minutes(self.config.cooldown_minutes)
            .and_then(|cooldown| now.checked_add_signed(cooldown))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Single transition of the state machine.
    ///
    /// - Normal -> Watch when `score >= watch_threshold`
    /// - Watch -> Alert when `score >= alert_threshold`, -> Normal below watch
    /// - Alert -> Cooldown unconditionally
    /// - Cooldown -> Normal once the window has elapsed, regardless of score
    pub fn next_state(&self, state: AlertState, score: f64, now: DateTime<Utc>) -> AlertState {
        match state {
            AlertState::Normal if score >= self.config.watch_threshold => AlertState::Watch,
            AlertState::Normal => AlertState::Normal,
            AlertState::Watch if score >= self.config.alert_threshold => AlertState::Alert,
            AlertState::Watch if score < self.config.watch_threshold => AlertState::Normal,
            AlertState::Watch => AlertState::Watch,
            AlertState::Alert => AlertState::Cooldown {
                until: self.cooldown_end(now),
            },
            AlertState::Cooldown { until } if now >= until => AlertState::Normal,
            AlertState::Cooldown { until } => AlertState::Cooldown { until },
        }
    }

    /// Feed the latest score of `cell` and return an event if one fires.
    ///
    /// Steps the machine until it settles, so a jump straight past the alert
    /// threshold passes through Watch and Alert in one call. Evaluating the
    /// same score again in the resulting state is a no-op.
    pub fn evaluate(&self, cell: CellKey, score: f64, now: DateTime<Utc>) -> Option<AlertEvent> {
        let mut event = None;
        let settled = {
            let mut state = self.states.entry(cell).or_insert(AlertState::Normal);
            let mut current = *state;

            // Normal -> Watch -> Alert -> Cooldown is the longest chain
            for _ in 0..5 {
                let next = self.next_state(current, score, now);
                if next == current {
                    break;
                }
                debug!(cell = %cell, from = ?current, to = ?next, score = score, "Alert state transition");
                if next == AlertState::Alert {
                    event = Some(self.build_event(cell, score, now));
                }
                current = next;
            }

            *state = current;
            current
        };

        if settled == AlertState::Normal {
            self.states.remove_if(&cell, |_, s| *s == AlertState::Normal);
        }

        event
    }

    fn build_event(&self, cell: CellKey, score: f64, now: DateTime<Utc>) -> AlertEvent {
        let severity_level = RiskLevel::from_score(score);
        AlertEvent {
            id: Uuid::now_v7(),
            cell_id: cell,
            location: cell.center(),
            score,
            severity_level,
            triggered_at: now,
            suppressed_until: self.cooldown_end(now),
            expected_response_minutes: severity_level.expected_response().num_minutes(),
        }
    }

    /// Current state of `cell`; untracked cells are Normal.
    pub fn state(&self, cell: &CellKey) -> AlertState {
        self.states
            .get(cell)
            .map(|s| *s)
            .unwrap_or(AlertState::Normal)
    }

    /// Cells currently outside Normal
    pub fn tracked_cells(&self) -> usize {
        self.states.len()
    }
}
