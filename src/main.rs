use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use audiowave_pipeline::config;
use audiowave_pipeline::fingerprint::{ReferenceLibrary, SqliteReferenceStore};
use audiowave_pipeline::metrics;
use audiowave_pipeline::pipeline::{
    start_pipeline, FingerprintStageProcessor, JobStore, ProcessorRegistry, RemoteModelProcessor,
    SqliteJobStore,
};
use audiowave_pipeline::storage::{ArtifactStore, FsArtifactStore};

fn parse_path(s: &str) -> Result<PathBuf, String> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(format!("Error resolving path '{}': {}", s, msg));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir().map_err(|e| format!("Failed to get current dir: {}", e))?;
    Ok(cwd.join(original_path))
}

fn parse_dir(s: &str) -> Result<PathBuf, String> {
    let path = parse_path(s)?;
    if !path.exists() {
        return Err(format!("Directory does not exist: {}", s));
    }
    if !path.is_dir() {
        return Err(format!("Path is not a directory: {}", s));
    }
    Ok(path)
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Directory containing database files (pipeline.db, fingerprints.db).
    /// Can also be specified in config file.
    #[clap(long, value_parser = parse_dir)]
    pub db_dir: Option<PathBuf>,

    /// Directory for uploaded clips, stems and reports. Defaults to <db-dir>/artifacts.
    #[clap(long, value_parser = parse_path)]
    pub artifacts_dir: Option<PathBuf>,

    /// The port for the metrics server (Prometheus scraping).
    #[clap(long, default_value_t = 9092)]
    pub metrics_port: u16,

    /// Number of concurrent stage workers.
    #[clap(long)]
    pub workers: Option<usize>,

    /// Base URL of the model service running separation, tagging, tempo/key and reports.
    #[clap(long)]
    pub models_url: Option<String>,
}

/// Convert CLI args to CliConfig for config resolution
impl From<&CliArgs> for config::CliConfig {
    fn from(args: &CliArgs) -> Self {
        config::CliConfig {
            db_dir: args.db_dir.clone(),
            artifacts_dir: args.artifacts_dir.clone(),
            metrics_port: args.metrics_port,
            workers: args.workers,
            models_url: args.models_url.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()?;

    // Load TOML config if provided
    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(config::FileConfig::load(path)?)
        }
        None => None,
    };

    // Resolve final configuration (TOML overrides CLI)
    let cli_config: config::CliConfig = (&cli_args).into();
    let app_config = config::AppConfig::resolve(&cli_config, file_config)?;

    info!("Configuration loaded:");
    info!("  db_dir: {:?}", app_config.db_dir);
    info!("  artifacts_dir: {:?}", app_config.artifacts_dir);
    info!("  workers: {}", app_config.pipeline.workers);

    let Some(models_url) = app_config.models.base_url.clone() else {
        bail!("No model service configured. Provide --models-url or [models] base_url in the config file.");
    };

    std::fs::create_dir_all(&app_config.artifacts_dir).with_context(|| {
        format!(
            "Failed to create artifacts directory {:?}",
            app_config.artifacts_dir
        )
    })?;
    let artifacts: Arc<dyn ArtifactStore> =
        Arc::new(FsArtifactStore::new(&app_config.artifacts_dir)?);

    info!("Initializing metrics...");
    metrics::init_metrics();

    info!(
        "Opening fingerprint database at {:?}...",
        app_config.fingerprint_db_path()
    );
    let reference_store = Arc::new(SqliteReferenceStore::new(app_config.fingerprint_db_path())?);
    let library = Arc::new(ReferenceLibrary::open(
        artifacts.clone(),
        reference_store,
        app_config.fingerprint.clone(),
        app_config.matching.clone(),
    )?);
    info!(
        "Fingerprint index ready: {} tracks, {} postings",
        library.index().track_count(),
        library.index().posting_count()
    );

    info!(
        "Opening pipeline database at {:?}...",
        app_config.pipeline_db_path()
    );
    let job_store: Arc<dyn JobStore> =
        Arc::new(SqliteJobStore::new(app_config.pipeline_db_path())?);

    let mut registry =
        ProcessorRegistry::new().with(Arc::new(FingerprintStageProcessor::new(library)));
    info!("Model service configured at {}", models_url);
    for processor in RemoteModelProcessor::for_all_stages(
        &models_url,
        Duration::from_secs(app_config.models.request_timeout_secs),
        tokio::runtime::Handle::current(),
    )? {
        registry.register(Arc::new(processor));
    }

    let shutdown_token = CancellationToken::new();

    let pipeline = start_pipeline(
        job_store,
        artifacts,
        registry,
        &app_config.pipeline,
        shutdown_token.child_token(),
    );

    let metrics_port = app_config.metrics_port;
    let metrics_shutdown = shutdown_token.clone();
    let metrics_server = tokio::spawn(async move {
        if let Err(e) = metrics::serve_metrics(metrics_port, metrics_shutdown).await {
            error!("Metrics server error: {:#}", e);
        }
    });

    info!("Pipeline running with {} workers", app_config.pipeline.workers);
    info!("Metrics available at port {}!", metrics_port);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, initiating graceful shutdown");
    shutdown_token.cancel();

    pipeline.join().await;
    if let Err(e) = metrics_server.await {
        error!("Metrics server task failed: {}", e);
    }
    info!("Shutdown complete");
    Ok(())
}
