use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use satmap::grid::{GeoBounds, Region};
use satmap::hotspot::KindFilter;
use satmap::observation::LatLon;
use std::path::PathBuf;

/// Environmental risk aggregation over geotagged inference results
#[derive(Parser, Debug)]
#[command(name = "satmap", author, version, about, long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Ingest a JSON array of inference records and print the batch report
    Ingest {
        #[arg(long, value_name = "FILE")]
        input: PathBuf,

        /// Snapshot to extend (restored first if present, then rewritten)
        #[arg(long, value_name = "FILE")]
        snapshot: Option<PathBuf>,
    },

    /// Print ranked hotspots for a region
    Hotspots {
        #[arg(long, value_name = "FILE")]
        snapshot: PathBuf,

        #[command(flatten)]
        area: AreaArgs,

        #[arg(long, default_value_t = 14)]
        zoom: u8,

        /// Minimum cell score (0.0 - 1.0)
        #[arg(long, default_value_t = 0.5, value_name = "SCORE")]
        threshold: f64,

        #[arg(long, value_name = "COUNT")]
        limit: Option<usize>,

        /// trash, water or all
        #[arg(long, default_value = "all")]
        kind: KindFilter,
    },

    /// Print a dense heatmap grid for a bounding box
    Heatmap {
        #[arg(long, value_name = "FILE")]
        snapshot: PathBuf,

        /// south,west,north,east
        #[arg(long, value_parser = parse_bbox, allow_hyphen_values = true, value_name = "S,W,N,E")]
        bbox: GeoBounds,

        #[arg(long, default_value_t = 14)]
        zoom: u8,

        #[arg(long, default_value = "all")]
        kind: KindFilter,
    },
}

/// Query region: a bounding box, or a centre with a radius
#[derive(Args, Debug)]
pub struct AreaArgs {
    /// south,west,north,east
    #[arg(long, value_parser = parse_bbox, allow_hyphen_values = true, value_name = "S,W,N,E", conflicts_with = "center")]
    pub bbox: Option<GeoBounds>,

    /// lat,lon
    #[arg(long, value_parser = parse_center, allow_hyphen_values = true, value_name = "LAT,LON", requires = "radius_km")]
    pub center: Option<LatLon>,

    #[arg(long, value_name = "KM")]
    pub radius_km: Option<f64>,
}

impl AreaArgs {
    pub fn region(&self) -> Result<Region> {
        match (self.bbox, self.center, self.radius_km) {
            (Some(bounds), None, _) => Ok(Region::BBox(bounds)),
            (None, Some(center), Some(radius_km)) => Ok(Region::Radius { center, radius_km }),
            _ => bail!("either --bbox or --center with --radius-km is required"),
        }
    }
}

fn parse_numbers<const N: usize>(s: &str) -> Result<[f64; N], String> {
    let values = s
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<f64>()
                .map_err(|e| format!("invalid number '{}': {e}", part.trim()))
        })
        .collect::<Result<Vec<f64>, String>>()?;

    values
        .try_into()
        .map_err(|v: Vec<f64>| format!("expected {N} comma-separated numbers, got {}", v.len()))
}

fn parse_bbox(s: &str) -> Result<GeoBounds, String> {
    let [south, west, north, east] = parse_numbers::<4>(s)?;
    Ok(GeoBounds::new(south, west, north, east))
}

fn parse_center(s: &str) -> Result<LatLon, String> {
    let [lat, lon] = parse_numbers::<2>(s)?;
    Ok(LatLon::new(lat, lon))
}
