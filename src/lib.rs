// Canonical observations and the inference-record normalizer
pub mod observation;

// Multi-resolution grid and spatial index
pub mod grid;

// Decayed per-cell risk scoring
pub mod scoring;

// Hotspot ranking and heatmap rasterization
pub mod hotspot;

// Per-cell alert state machine
pub mod alert;

// Risk engine and metrics
pub mod state;

// Gzip JSON snapshots of the observation set
pub mod snapshot;

// Configuration loading and validation
pub mod config;
