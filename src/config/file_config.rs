use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub artifacts_dir: Option<String>,
    pub metrics_port: Option<u16>,

    // Feature configs
    pub pipeline: Option<PipelineConfig>,
    pub fingerprint: Option<FingerprintFileConfig>,
    pub models: Option<ModelsConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    pub workers: Option<usize>,
    pub max_attempts: Option<u32>,
    pub initial_backoff_secs: Option<u64>,
    pub max_backoff_secs: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub idle_poll_interval_secs: Option<u64>,
    // Per-stage timeouts
    pub separation_timeout_secs: Option<u64>,
    pub tagging_timeout_secs: Option<u64>,
    pub tempo_key_timeout_secs: Option<u64>,
    pub fingerprint_timeout_secs: Option<u64>,
    pub report_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct FingerprintFileConfig {
    pub analysis_sample_rate: Option<u32>,
    pub frame_size: Option<usize>,
    pub hop_size: Option<usize>,
    pub min_duration_secs: Option<f32>,
    pub silence_rms: Option<f32>,
    pub peak_floor: Option<f32>,
    pub envelope_decay: Option<f32>,
    pub envelope_spread_bins: Option<f32>,
    pub max_peaks_per_frame: Option<usize>,
    // Target zone
    pub target_dt_min: Option<u32>,
    pub target_dt_max: Option<u32>,
    pub target_df_max: Option<u32>,
    pub fan_out: Option<usize>,
    // Matching
    pub offset_tolerance_frames: Option<i64>,
    pub min_votes: Option<usize>,
    pub max_candidates: Option<usize>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ModelsConfig {
    /// Base URL of the model service, e.g. "http://models:8500"
    pub base_url: Option<String>,
    pub request_timeout_secs: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
