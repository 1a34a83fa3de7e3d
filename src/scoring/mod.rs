// Risk scoring: decayed, weighted, saturating composite per cell

use crate::observation::{Observation, ObservationKind};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;


/// Scores closer than this are treated as unchanged when deriving a trend.
const TREND_EPSILON: f64 = 1e-9;

/// Scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Exponential decay constant λ applied to observation age in hours.
    /// The default of 0.01 gives a half-life of roughly 69 hours.
    #[serde(default = "default_decay_lambda")]
    pub decay_lambda_per_hour: f64,

    #[serde(default = "default_trash_coefficient")]
    pub trash_coefficient: f64,

    /// Water contamination outweighs litter (SDG-6 priority)
    #[serde(default = "default_water_coefficient")]
    pub water_coefficient: f64,
}

fn default_decay_lambda() -> f64 {
    0.01
}

fn default_trash_coefficient() -> f64 {
    1.0
}

fn default_water_coefficient() -> f64 {
    1.5
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            decay_lambda_per_hour: default_decay_lambda(),
            trash_coefficient: default_trash_coefficient(),
            water_coefficient: default_water_coefficient(),
        }
    }
}

/// Direction of a cell's score between two recomputations
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Rising,
    Falling,
    Stable,
}

impl Trend {
    pub fn between(previous: Option<f64>, current: f64) -> Self {
        let previous = previous.unwrap_or(0.0);
        let delta = current - previous;
        if delta > TREND_EPSILON {
            Trend::Rising
        } else if delta < -TREND_EPSILON {
            Trend::Falling
        } else {
            Trend::Stable
        }
    }
}

/// Cached risk score of a cell.
///
/// Derived data: only the scorer produces it, consumers get copies.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RiskScore {
    /// Composite risk in [0,1]
    pub value: f64,

    /// Reference time of the computation that produced this score
    pub last_updated: DateTime<Utc>,

    /// Kinds with a non-zero weight in the composite
    pub contributing_kinds: BTreeSet<ObservationKind>,

    pub trend: Trend,
}

impl RiskScore {
    pub fn zero(at: DateTime<Utc>) -> Self {
        Self {
            value: 0.0,
            last_updated: at,
            contributing_kinds: BTreeSet::new(),
            trend: Trend::Stable,
        }
    }

    pub fn level(&self) -> RiskLevel {
        RiskLevel::from_score(self.value)
    }
}

/// Coarse risk band used for reporting and alert severity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(value: f64) -> Self {
        match value {
            v if v >= 0.8 => RiskLevel::Critical,
            v if v >= 0.6 => RiskLevel::High,
            v if v >= 0.4 => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }

    /// Target response time handed to the alert delivery layer.
    pub fn expected_response(&self) -> Duration {
        match self {
            RiskLevel::Critical => Duration::minutes(15),
            RiskLevel::High => Duration::hours(2),
            RiskLevel::Medium => Duration::hours(24),
            RiskLevel::Low => Duration::hours(72),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }
}

/// Cleanup priority on a 1..=10 scale.
pub fn priority(value: f64) -> u8 {
    (value * 10.0).round().clamp(1.0, 10.0) as u8
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScoreError {
    #[error("observation {0} produced a non-finite weight")]
    NonFiniteWeight(Uuid),
}

/// Computes cell scores from observation sets.
#[derive(Debug, Clone)]
pub struct RiskScorer {
    config: ScoringConfig,
}

impl RiskScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn coefficient(&self, kind: ObservationKind) -> f64 {
        match kind {
            ObservationKind::Trash => self.config.trash_coefficient,
            ObservationKind::Water => self.config.water_coefficient,
        }
    }

    /// `severity × source_confidence × exp(-λ·age)`, age in hours.
    ///
    /// Observations stamped slightly ahead of `now` (clock skew) count as age 0.
    pub fn weight(&self, observation: &Observation, now: DateTime<Utc>) -> f64 {
        let age_hours = ((now - observation.timestamp).num_milliseconds() as f64 / 3_600_000.0).max(0.0);
        observation.severity
            * observation.source_confidence
            * (-self.config.decay_lambda_per_hour * age_hours).exp()
    }

    /// Composite value at `now` plus the kinds that contributed to it.
    ///
    /// Weighted terms are summed in sorted order so the result does not depend
    /// on the iteration order of `observations`.
    pub fn evaluate<'a, I>(
        &self,
        observations: I,
        now: DateTime<Utc>,
    ) -> Result<(f64, BTreeSet<ObservationKind>), ScoreError>
    where
        I: IntoIterator<Item = &'a Observation>,
    {
        let mut terms = Vec::new();
        let mut kinds = BTreeSet::new();

        for observation in observations {
            let term = self.coefficient(observation.kind) * self.weight(observation, now);
            if !term.is_finite() {
                return Err(ScoreError::NonFiniteWeight(observation.id));
            }
            if term > 0.0 {
                kinds.insert(observation.kind);
                terms.push(term);
            }
        }

        terms.sort_by(f64::total_cmp);
        let total: f64 = terms.iter().sum();
        let value = (1.0 - (-total).exp()).clamp(0.0, 1.0);
        Ok((value, kinds))
    }

    /// Recompute a cell's score; the trend compares against `previous`.
    pub fn score(
        &self,
        observations: &[Arc<Observation>],
        previous: Option<&RiskScore>,
        now: DateTime<Utc>,
    ) -> Result<RiskScore, ScoreError> {
        let (value, contributing_kinds) =
            self.evaluate(observations.iter().map(|o| o.as_ref()), now)?;

        Ok(RiskScore {
            value,
            last_updated: now,
            contributing_kinds,
            trend: Trend::between(previous.map(|p| p.value), value),
        })
    }
}
