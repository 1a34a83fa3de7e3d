mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use satmap::config::{apply_env_overrides, load_config, RiskConfig};
use satmap::hotspot::{HeatmapQuery, HotspotQuery};
use satmap::observation::InferenceRecord;
use satmap::snapshot::Snapshot;
use satmap::state::RiskEngine;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries JSON results
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "satmap=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => RiskConfig::default(),
    };
    apply_env_overrides(&mut config);
    let default_snapshot = config.snapshot.enabled.then(|| config.snapshot.path.clone());

    let engine = RiskEngine::new(config).context("Invalid configuration")?;

    // Stand-in for the delivery layer: drain alerts as they are raised
    let mut alerts = engine.subscribe_alerts();
    let alert_logger = tokio::spawn(async move {
        loop {
            match alerts.recv().await {
                Ok(event) => info!(
                    alert_id = %event.id,
                    cell = %event.cell_id,
                    lat = event.location.lat,
                    lon = event.location.lon,
                    severity = event.severity_level.as_str(),
                    respond_within_minutes = event.expected_response_minutes,
                    "Alert handed to delivery"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Alert subscriber lagged")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let result = run(&engine, cli.command, default_snapshot);

    let metrics = engine.shutdown();
    if let Err(e) = alert_logger.await {
        warn!(error = %e, "Alert logger task failed");
    }
    info!(
        ingested = metrics.observations_ingested,
        alerts = metrics.alerts_emitted,
        "satmap finished"
    );

    result
}

fn run(engine: &RiskEngine, command: Command, default_snapshot: Option<PathBuf>) -> Result<()> {
    match command {
        Command::Ingest { input, snapshot } => {
            let json = fs::read_to_string(&input)
                .with_context(|| format!("Failed to read input file {}", input.display()))?;
            let records: Vec<InferenceRecord> =
                serde_json::from_str(&json).context("Failed to parse inference records")?;

            let snapshot_path = snapshot.or(default_snapshot);
            if let Some(path) = snapshot_path.as_deref().filter(|p| p.exists()) {
                restore(engine, path)?;
            }

            let report = engine.ingest_batch(&records);

            if let Some(path) = snapshot_path {
                Snapshot::from_engine(engine).save_to_file(&path)?;
            }
            print_json(&report)
        }

        Command::Hotspots {
            snapshot,
            area,
            zoom,
            threshold,
            limit,
            kind,
        } => {
            restore(engine, &snapshot)?;
            let hotspots = engine.hotspots(&HotspotQuery {
                region: area.region()?,
                zoom_level: zoom,
                score_threshold: threshold,
                limit,
                kinds: kind,
            })?;
            print_json(&hotspots)
        }

        Command::Heatmap {
            snapshot,
            bbox,
            zoom,
            kind,
        } => {
            restore(engine, &snapshot)?;
            let heatmap = engine.heatmap(&HeatmapQuery {
                bounds: bbox,
                zoom_level: zoom,
                kinds: kind,
            })?;
            print_json(&heatmap)
        }
    }
}

fn restore(engine: &RiskEngine, path: &Path) -> Result<()> {
    let snapshot = Snapshot::load_from_file(path)?;
    snapshot.restore(engine, chrono::Utc::now());
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{json}");
    Ok(())
}
