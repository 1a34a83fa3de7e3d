use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Snapshot persistence settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Write a snapshot after each ingested batch
    #[serde(default)]
    pub enabled: bool,

    /// Snapshot file (gzip-compressed JSON)
    #[serde(default = "default_path")]
    pub path: PathBuf,
}

fn default_path() -> PathBuf {
    PathBuf::from("satmap-snapshot.json.gz")
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_path(),
        }
    }
}
