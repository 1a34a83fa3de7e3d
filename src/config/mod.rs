pub mod env;
pub use env::apply_env_overrides;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

// Re-export per-component config types
pub use crate::alert::AlertConfig;
pub use crate::grid::{GridConfig, GridLevel, MAX_PRECISION};
pub use crate::observation::NormalizerConfig;
pub use crate::scoring::ScoringConfig;
pub use crate::snapshot::config::SnapshotConfig;

/// Longest accepted retention window (100 years)
pub const MAX_RETENTION_HOURS: i64 = 100 * 365 * 24;

/// Longest accepted alert cooldown (one year)
pub const MAX_COOLDOWN_MINUTES: i64 = 365 * 24 * 60;

/// Largest accepted clock skew (one week)
pub const MAX_CLOCK_SKEW_SECONDS: i64 = 7 * 24 * 3600;

/// Complete engine configuration.
///
/// Every section is optional in TOML; missing sections take the documented
/// defaults of their component.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RiskConfig {
    #[serde(default)]
    pub grid: GridConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

/// Inconsistent configuration values
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("grid must define at least one level")]
    NoGridLevels,
    #[error("zoom level {0} is defined more than once")]
    DuplicateZoom(u8),
    #[error("precision {precision} for zoom {zoom} exceeds the maximum of {max}")]
    PrecisionTooFine { zoom: u8, precision: u8, max: u8 },
    #[error("{0} must be positive")]
    NotPositive(&'static str),
    #[error("{name} must be within (0, 1], got {value}")]
    ThresholdOutOfRange { name: &'static str, value: f64 },
    #[error("watch threshold {watch} must be below alert threshold {alert}")]
    ThresholdOrder { watch: f64, alert: f64 },
    #[error("{name} must be finite and non-negative, got {value}")]
    Negative { name: &'static str, value: f64 },
    #[error("{name} must be at most {max}, got {value}")]
    TooLarge { name: &'static str, value: i64, max: i64 },
}

impl RiskConfig {
    /// Check cross-field consistency. Called by `RiskEngine::new`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grid.levels.is_empty() {
            return Err(ConfigError::NoGridLevels);
        }
        let mut seen = HashSet::new();
        for level in &self.grid.levels {
            if !seen.insert(level.zoom) {
                return Err(ConfigError::DuplicateZoom(level.zoom));
            }
            if level.precision > MAX_PRECISION {
                return Err(ConfigError::PrecisionTooFine {
                    zoom: level.zoom,
                    precision: level.precision,
                    max: MAX_PRECISION,
                });
            }
        }
        if self.grid.retention_hours <= 0 {
            return Err(ConfigError::NotPositive("grid.retention_hours"));
        }
        at_most("grid.retention_hours", self.grid.retention_hours, MAX_RETENTION_HOURS)?;
        if self.grid.max_query_cells == 0 {
            return Err(ConfigError::NotPositive("grid.max_query_cells"));
        }

        non_negative("scoring.decay_lambda_per_hour", self.scoring.decay_lambda_per_hour)?;
        non_negative("scoring.trash_coefficient", self.scoring.trash_coefficient)?;
        non_negative("scoring.water_coefficient", self.scoring.water_coefficient)?;

        unit_threshold("alerts.watch_threshold", self.alerts.watch_threshold)?;
        unit_threshold("alerts.alert_threshold", self.alerts.alert_threshold)?;
        if self.alerts.watch_threshold >= self.alerts.alert_threshold {
            return Err(ConfigError::ThresholdOrder {
                watch: self.alerts.watch_threshold,
                alert: self.alerts.alert_threshold,
            });
        }
        if self.alerts.cooldown_minutes <= 0 {
            return Err(ConfigError::NotPositive("alerts.cooldown_minutes"));
        }
        at_most("alerts.cooldown_minutes", self.alerts.cooldown_minutes, MAX_COOLDOWN_MINUTES)?;

        non_negative("normalizer.clock_skew_seconds", self.normalizer.clock_skew_seconds as f64)?;
        at_most(
            "normalizer.clock_skew_seconds",
            self.normalizer.clock_skew_seconds,
            MAX_CLOCK_SKEW_SECONDS,
        )?;
        non_negative("normalizer.min_detection_confidence", self.normalizer.min_detection_confidence)?;
        non_negative("normalizer.trash_item_scale", self.normalizer.trash_item_scale)?;
        for hazard in self.normalizer.category_hazard.values() {
            non_negative("normalizer.category_hazard", *hazard)?;
        }

        Ok(())
    }
}

fn non_negative(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Negative { name, value })
    }
}

fn at_most(name: &'static str, value: i64, max: i64) -> Result<(), ConfigError> {
    if value <= max {
        Ok(())
    } else {
        Err(ConfigError::TooLarge { name, value, max })
    }
}

fn unit_threshold(name: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ConfigError::ThresholdOutOfRange { name, value })
    }
}

/// Load configuration from TOML file
pub fn load_config(path: impl AsRef<Path>) -> Result<RiskConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: RiskConfig =
        toml::from_str(&contents).context("Failed to parse config TOML")?;
    Ok(config)
}
