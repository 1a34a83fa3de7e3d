use super::RiskConfig;
use std::str::FromStr;

/// Apply `SATMAP_*` environment overrides on top of file/default values.
///
/// Unset variables and values that fail to parse leave the field untouched.
pub fn apply_env_overrides(config: &mut RiskConfig) {
    apply_overrides(config, |key| std::env::var(key).ok());
}

/// Same as [`apply_env_overrides`] with an injectable lookup.
pub(crate) fn apply_overrides<F>(config: &mut RiskConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = parsed(&lookup, "SATMAP_DECAY_LAMBDA_PER_HOUR") {
        config.scoring.decay_lambda_per_hour = v;
    }
    if let Some(v) = parsed(&lookup, "SATMAP_WATCH_THRESHOLD") {
        config.alerts.watch_threshold = v;
    }
    if let Some(v) = parsed(&lookup, "SATMAP_ALERT_THRESHOLD") {
        config.alerts.alert_threshold = v;
    }
    if let Some(v) = parsed(&lookup, "SATMAP_COOLDOWN_MINUTES") {
        config.alerts.cooldown_minutes = v;
    }
    if let Some(v) = parsed(&lookup, "SATMAP_RETENTION_HOURS") {
        config.grid.retention_hours = v;
    }
    if let Some(v) = parsed(&lookup, "SATMAP_MAX_QUERY_CELLS") {
        config.grid.max_query_cells = v;
    }
}

fn parsed<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|v| v.trim().parse::<T>().ok())
}
