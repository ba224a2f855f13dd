use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use walkdir::WalkDir;

use audiowave_pipeline::audio::decode_wav;
use audiowave_pipeline::config::{AppConfig, CliConfig, FileConfig};
use audiowave_pipeline::fingerprint::{ReferenceLibrary, SqliteReferenceStore};
use audiowave_pipeline::storage::{ArtifactStore, FsArtifactStore};

#[derive(Parser, Debug)]
#[command(name = "cli-fingerprint", about = "Manage the reference sample library")]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI arguments.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Directory containing fingerprints.db.
    #[clap(long)]
    pub db_dir: Option<PathBuf>,

    /// Directory where reference audio is copied. Defaults to <db-dir>/artifacts.
    #[clap(long)]
    pub artifacts_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fingerprint a WAV file and add it to the library as <TRACK_ID>.
    Ingest { track_id: String, wav: PathBuf },

    /// Fingerprint every .wav file under a directory. Track ids are the file stems.
    IngestDir {
        dir: PathBuf,

        /// Number of extraction threads. Defaults to the number of CPUs.
        #[clap(long)]
        threads: Option<usize>,
    },

    /// Match a WAV clip against the library.
    Match {
        wav: PathBuf,

        /// Print candidates as JSON.
        #[clap(long)]
        json: bool,
    },

    /// List reference tracks.
    List,

    /// Remove a reference track.
    Remove { track_id: String },
}

fn create_progress_bar(len: u64, msg: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec}, ETA: {eta})")?
            .progress_chars("=> "),
    );
    pb.set_message(msg.to_string());
    Ok(pb)
}

fn is_wav(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("wav"))
        .unwrap_or(false)
}

fn ingest_file(
    library: &ReferenceLibrary,
    artifacts: &dyn ArtifactStore,
    track_id: &str,
    path: &Path,
) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    let handle = artifacts.put(&bytes)?;
    match library.ingest_reference_track(track_id, &handle) {
        Ok(_) => Ok(()),
        Err(e) => {
            // Keep the artifact directory free of audio nobody references
            if let Err(cleanup) = artifacts.delete(&handle) {
                warn!("Failed to delete artifact {}: {}", handle, cleanup);
            }
            Err(e.into())
        }
    }
}

fn ingest_dir(
    library: &ReferenceLibrary,
    artifacts: &dyn ArtifactStore,
    dir: &Path,
    threads: Option<usize>,
) -> Result<()> {
    if !dir.is_dir() {
        bail!("Not a directory: {:?}", dir);
    }
    let files: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && is_wav(entry.path()))
        .map(|entry| entry.into_path())
        .collect();

    if files.is_empty() {
        println!("No .wav files found under {:?}", dir);
        return Ok(());
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads.unwrap_or(0))
        .build()?;
    let pb = create_progress_bar(files.len() as u64, "Ingesting")?;

    let failures: Vec<(PathBuf, String)> = pool.install(|| {
        files
            .par_iter()
            .filter_map(|path| {
                let track_id = path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().to_string())
                    .unwrap_or_default();
                let result = ingest_file(library, artifacts, &track_id, path);
                pb.inc(1);
                result.err().map(|e| (path.clone(), format!("{:#}", e)))
            })
            .collect()
    });
    pb.finish_and_clear();

    println!(
        "Ingested {} of {} files",
        files.len() - failures.len(),
        files.len()
    );
    for (path, error) in &failures {
        println!("  FAILED {:?}: {}", path, error);
    }
    Ok(())
}

fn match_clip(library: &ReferenceLibrary, path: &Path, json: bool) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    let audio = decode_wav(&bytes)?;
    let landmarks = match library.extractor().extract(&audio.samples, audio.sample_rate) {
        Ok(landmarks) => landmarks,
        Err(e) => {
            info!("No landmarks extracted: {}", e);
            Vec::new()
        }
    };
    let candidates = library.match_engine().find_matches(&landmarks);

    if json {
        println!("{}", serde_json::to_string_pretty(&candidates)?);
        return Ok(());
    }
    if candidates.is_empty() {
        println!("No match ({} landmarks)", landmarks.len());
        return Ok(());
    }
    println!(
        "{:<32} {:>10} {:>8} {:>10}",
        "TRACK", "OFFSET(s)", "VOTES", "CONFIDENCE"
    );
    for candidate in &candidates {
        println!(
            "{:<32} {:>10.2} {:>8} {:>10.3}",
            candidate.track_id, candidate.offset_secs, candidate.vote_count, candidate.confidence
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()?;

    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let cli_config = CliConfig {
        db_dir: cli_args.db_dir.clone(),
        artifacts_dir: cli_args.artifacts_dir.clone(),
        ..Default::default()
    };
    let app_config = AppConfig::resolve(&cli_config, file_config)?;

    std::fs::create_dir_all(&app_config.artifacts_dir)?;
    let artifacts = Arc::new(FsArtifactStore::new(&app_config.artifacts_dir)?);
    let store = Arc::new(SqliteReferenceStore::new(app_config.fingerprint_db_path())?);
    let library = ReferenceLibrary::open(
        artifacts.clone(),
        store,
        app_config.fingerprint.clone(),
        app_config.matching.clone(),
    )?;

    match cli_args.command {
        Command::Ingest { track_id, wav } => {
            ingest_file(&library, artifacts.as_ref(), &track_id, &wav)?;
            println!("Ingested {}", track_id);
        }
        Command::IngestDir { dir, threads } => {
            ingest_dir(&library, artifacts.as_ref(), &dir, threads)?;
        }
        Command::Match { wav, json } => match_clip(&library, &wav, json)?,
        Command::List => {
            let tracks = library.list_tracks()?;
            println!(
                "{:<32} {:>9} {:>10} {:>8}",
                "TRACK", "LANDMARKS", "DURATION", "VERSION"
            );
            for track in &tracks {
                println!(
                    "{:<32} {:>9} {:>9.1}s {:>8}",
                    track.track_id, track.landmark_count, track.duration_secs, track.extractor_version
                );
            }
            println!("{} tracks", tracks.len());
        }
        Command::Remove { track_id } => {
            if !library.remove_reference_track(&track_id)? {
                bail!("No reference track {}", track_id);
            }
            println!("Removed {}", track_id);
        }
    }
    Ok(())
}
