mod file_config;

pub use file_config::{FileConfig, FingerprintFileConfig, ModelsConfig, PipelineConfig};

use crate::audio::{MAX_SAMPLE_RATE, MIN_SAMPLE_RATE};
use crate::fingerprint::{FingerprintConfig, MatchConfig, MAX_TARGET_DT};
use crate::pipeline::Stage;
use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub artifacts_dir: Option<PathBuf>,
    pub metrics_port: u16,
    pub workers: Option<usize>,
    pub models_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub db_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub metrics_port: u16,

    // Feature configs (with defaults)
    pub pipeline: PipelineSettings,
    pub fingerprint: FingerprintConfig,
    pub matching: MatchConfig,
    pub models: ModelSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        // TOML overrides CLI for each field
        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        // Validate db_dir exists
        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let artifacts_dir = file
            .artifacts_dir
            .map(PathBuf::from)
            .or_else(|| cli.artifacts_dir.clone())
            .unwrap_or_else(|| db_dir.join("artifacts"));

        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);

        // Pipeline settings - merge file config with defaults
        let defaults = PipelineSettings::default();
        let p_file = file.pipeline.unwrap_or_default();
        let pipeline = PipelineSettings {
            workers: p_file.workers.or(cli.workers).unwrap_or(defaults.workers),
            max_attempts: p_file.max_attempts.unwrap_or(defaults.max_attempts),
            initial_backoff_secs: p_file
                .initial_backoff_secs
                .unwrap_or(defaults.initial_backoff_secs),
            max_backoff_secs: p_file.max_backoff_secs.unwrap_or(defaults.max_backoff_secs),
            backoff_multiplier: p_file
                .backoff_multiplier
                .unwrap_or(defaults.backoff_multiplier),
            idle_poll_interval_secs: p_file
                .idle_poll_interval_secs
                .unwrap_or(defaults.idle_poll_interval_secs),
            stage_timeouts: StageTimeouts {
                separation: secs_or(p_file.separation_timeout_secs, defaults.stage_timeouts.separation),
                tagging: secs_or(p_file.tagging_timeout_secs, defaults.stage_timeouts.tagging),
                tempo_key: secs_or(p_file.tempo_key_timeout_secs, defaults.stage_timeouts.tempo_key),
                fingerprint: secs_or(
                    p_file.fingerprint_timeout_secs,
                    defaults.stage_timeouts.fingerprint,
                ),
                report: secs_or(p_file.report_timeout_secs, defaults.stage_timeouts.report),
            },
        };
        pipeline.validate()?;

        // Fingerprint settings
        let fp_file = file.fingerprint.unwrap_or_default();
        let fp_defaults = FingerprintConfig::default();
        let fingerprint = FingerprintConfig {
            analysis_sample_rate: fp_file
                .analysis_sample_rate
                .unwrap_or(fp_defaults.analysis_sample_rate),
            frame_size: fp_file.frame_size.unwrap_or(fp_defaults.frame_size),
            hop_size: fp_file.hop_size.unwrap_or(fp_defaults.hop_size),
            min_duration_secs: fp_file
                .min_duration_secs
                .unwrap_or(fp_defaults.min_duration_secs),
            silence_rms: fp_file.silence_rms.unwrap_or(fp_defaults.silence_rms),
            peak_floor: fp_file.peak_floor.unwrap_or(fp_defaults.peak_floor),
            envelope_decay: fp_file.envelope_decay.unwrap_or(fp_defaults.envelope_decay),
            envelope_spread_bins: fp_file
                .envelope_spread_bins
                .unwrap_or(fp_defaults.envelope_spread_bins),
            max_peaks_per_frame: fp_file
                .max_peaks_per_frame
                .unwrap_or(fp_defaults.max_peaks_per_frame),
            target_dt_min: fp_file.target_dt_min.unwrap_or(fp_defaults.target_dt_min),
            target_dt_max: fp_file.target_dt_max.unwrap_or(fp_defaults.target_dt_max),
            target_df_max: fp_file.target_df_max.unwrap_or(fp_defaults.target_df_max),
            fan_out: fp_file.fan_out.unwrap_or(fp_defaults.fan_out),
        };
        validate_fingerprint(&fingerprint)?;

        let m_defaults = MatchConfig::default();
        let matching = MatchConfig {
            offset_tolerance_frames: fp_file
                .offset_tolerance_frames
                .unwrap_or(m_defaults.offset_tolerance_frames),
            min_votes: fp_file.min_votes.unwrap_or(m_defaults.min_votes),
            max_candidates: fp_file.max_candidates.unwrap_or(m_defaults.max_candidates),
        };
        if matching.offset_tolerance_frames < 0 {
            bail!("offset_tolerance_frames must not be negative");
        }

        // Model service - TOML [models] section takes precedence over CLI args
        let models_file = file.models.unwrap_or_default();
        let models = ModelSettings {
            base_url: models_file.base_url.or_else(|| cli.models_url.clone()),
            request_timeout_secs: models_file.request_timeout_secs.unwrap_or(600),
        };

        Ok(Self {
            db_dir,
            artifacts_dir,
            metrics_port,
            pipeline,
            fingerprint,
            matching,
            models,
        })
    }

    pub fn pipeline_db_path(&self) -> PathBuf {
        self.db_dir.join("pipeline.db")
    }

    pub fn fingerprint_db_path(&self) -> PathBuf {
        self.db_dir.join("fingerprints.db")
    }
}

fn secs_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_secs).unwrap_or(default)
}

fn validate_fingerprint(config: &FingerprintConfig) -> Result<()> {
    if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&config.analysis_sample_rate) {
        bail!(
            "analysis_sample_rate must be between {} and {} Hz, got {}",
            MIN_SAMPLE_RATE,
            MAX_SAMPLE_RATE,
            config.analysis_sample_rate
        );
    }
    if !config.min_duration_secs.is_finite() || config.min_duration_secs <= 0.0 {
        bail!(
            "min_duration_secs must be positive, got {}",
            config.min_duration_secs
        );
    }
    if config.hop_size == 0 || config.hop_size > config.frame_size {
        bail!(
            "hop_size must be between 1 and frame_size ({}), got {}",
            config.frame_size,
            config.hop_size
        );
    }
    if !config.frame_size.is_power_of_two() {
        bail!("frame_size must be a power of two, got {}", config.frame_size);
    }
    // Frequency bins are packed into 9 bits of the landmark hash
    if config.bin_count() > 512 {
        bail!(
            "frame_size {} yields more than 512 frequency bins",
            config.frame_size
        );
    }
    if config.fan_out == 0 || config.max_peaks_per_frame == 0 {
        bail!("fan_out and max_peaks_per_frame must be at least 1");
    }
    if config.target_dt_min == 0
        || config.target_dt_min > config.target_dt_max
        || config.target_dt_max > MAX_TARGET_DT
    {
        bail!(
            "target zone must satisfy 1 <= target_dt_min <= target_dt_max <= {}, got {}..={}",
            MAX_TARGET_DT,
            config.target_dt_min,
            config.target_dt_max
        );
    }
    if !(config.envelope_decay > 0.0 && config.envelope_decay < 1.0) {
        bail!(
            "envelope_decay must be between 0 and 1, got {}",
            config.envelope_decay
        );
    }
    if !(config.envelope_spread_bins > 0.0 && config.envelope_spread_bins.is_finite()) {
        bail!(
            "envelope_spread_bins must be positive, got {}",
            config.envelope_spread_bins
        );
    }
    Ok(())
}

/// Timeout applied to each stage execution.
#[derive(Debug, Clone, PartialEq)]
pub struct StageTimeouts {
    pub separation: Duration,
    pub tagging: Duration,
    pub tempo_key: Duration,
    pub fingerprint: Duration,
    pub report: Duration,
}

impl StageTimeouts {
    /// Same timeout for every stage.
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            separation: timeout,
            tagging: timeout,
            tempo_key: timeout,
            fingerprint: timeout,
            report: timeout,
        }
    }

    pub fn for_stage(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Separation => self.separation,
            Stage::Tagging => self.tagging,
            Stage::TempoKey => self.tempo_key,
            Stage::FingerprintMatch => self.fingerprint,
            Stage::Report => self.report,
        }
    }
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            separation: Duration::from_secs(900),
            tagging: Duration::from_secs(300),
            tempo_key: Duration::from_secs(120),
            fingerprint: Duration::from_secs(120),
            report: Duration::from_secs(180),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Number of stage workers (max stage executions in flight)
    pub workers: usize,
    /// Attempts per stage before the job is dead-lettered
    pub max_attempts: u32,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub backoff_multiplier: f64,
    /// Upper bound on how long the manager sleeps with nothing due
    pub idle_poll_interval_secs: u64,
    pub stage_timeouts: StageTimeouts,
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("pipeline.workers must be at least 1");
        }
        if self.max_attempts == 0 {
            bail!("pipeline.max_attempts must be at least 1");
        }
        if self.backoff_multiplier < 1.0 {
            bail!(
                "pipeline.backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            );
        }
        if self.idle_poll_interval_secs == 0 {
            bail!("pipeline.idle_poll_interval_secs must be at least 1");
        }
        Ok(())
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 3,
            initial_backoff_secs: 5,
            max_backoff_secs: 300, // 5 minutes
            backoff_multiplier: 2.0,
            idle_poll_interval_secs: 30,
            stage_timeouts: StageTimeouts::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelSettings {
    /// None disables the remote model processors
    pub base_url: Option<String>,
    pub request_timeout_secs: u64,
}
