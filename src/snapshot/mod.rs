use crate::observation::Observation;
use crate::state::{BatchReport, RiskEngine};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use tracing::info;

pub mod config;


/// Current on-disk format
pub const SNAPSHOT_VERSION: &str = "1";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Observation set of an engine at a point in time.
///
/// Cached scores and alert state are derived and not stored; restoring
/// rescores every cell from the observations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot format version (for future schema evolution)
    pub snapshot_version: String,

    /// Timestamp when snapshot was created
    pub created_at: DateTime<Utc>,

    /// Ordered by (timestamp, id)
    pub observations: Vec<Observation>,
}

impl Snapshot {
    pub fn from_engine(engine: &RiskEngine) -> Self {
        Self {
            snapshot_version: SNAPSHOT_VERSION.to_string(),
            created_at: Utc::now(),
            observations: engine.observations(),
        }
    }

    /// Save snapshot to filesystem as compressed JSON (gzip)
    ///
    /// Uses atomic write: writes to .tmp file, fsyncs, then renames.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec(self).context("Failed to serialize snapshot to JSON")?;

        let tmp_path = path.with_extension("tmp");
        {
            let tmp_file = File::create(&tmp_path).with_context(|| {
                format!("Failed to create temporary snapshot file {}", tmp_path.display())
            })?;

            let mut encoder = GzEncoder::new(tmp_file, Compression::default());
            encoder
                .write_all(&json)
                .context("Failed to write compressed snapshot data")?;
            let file = encoder.finish().context("Failed to finish compression")?;
            file.sync_all()
                .context("Failed to sync snapshot file to disk")?;
        }

        fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to move snapshot into place at {}", path.display()))?;

        info!(
            path = %path.display(),
            observations = self.observations.len(),
            "Snapshot saved"
        );
        Ok(())
    }

    /// Load a snapshot, gzip-compressed or plain JSON.
    ///
    /// The format is detected from the gzip magic bytes, not the file name.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("Failed to read snapshot file {}", path.display()))?;

        let mut json = String::new();
        if bytes.starts_with(&GZIP_MAGIC) {
            GzDecoder::new(bytes.as_slice())
                .read_to_string(&mut json)
                .context("Failed to decompress snapshot file")?;
        } else {
            json = String::from_utf8(bytes).context("Snapshot file is not valid UTF-8")?;
        }

        let snapshot: Snapshot =
            serde_json::from_str(&json).context("Failed to deserialize snapshot JSON")?;
        if snapshot.snapshot_version != SNAPSHOT_VERSION {
            bail!(
                "Unsupported snapshot version '{}' (expected '{}')",
                snapshot.snapshot_version,
                SNAPSHOT_VERSION
            );
        }

        Ok(snapshot)
    }

    /// Re-insert the observations into `engine` as of `now`.
    ///
    /// Observations past the engine's retention window are swept as part of
    /// the same pass.
    pub fn restore(self, engine: &RiskEngine, now: DateTime<Utc>) -> BatchReport {
        let count = self.observations.len();
        let report = engine.insert_observations_at(self.observations, now);

        info!(
            created_at = %self.created_at,
            observations = count,
            restored = report.accepted,
            rejected = report.rejected.len(),
            evicted = report.evicted_observations,
            "Restored engine from snapshot"
        );
        report
    }

    pub fn observation_count(&self) -> usize {
        self.observations.len()
    }
}
