//! Pipeline lifecycle management for tests
//!
//! Each test gets an isolated pipeline with its own job database, artifact
//! store and reference library.

use super::constants::*;
use super::fixtures::wav;
use audiowave_pipeline::config::{PipelineSettings, StageTimeouts};
use audiowave_pipeline::fingerprint::{
    FingerprintConfig, MatchConfig, ReferenceLibrary, SqliteReferenceStore,
};
use audiowave_pipeline::pipeline::{
    start_pipeline, Job, JobStatus, JobStore, PipelineHandle, ProcessorRegistry, RunningPipeline,
    SqliteJobStore,
};
use audiowave_pipeline::storage::{ArtifactHandle, ArtifactStore, MemoryArtifactStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// A running pipeline backed by a file database in a temp directory.
///
/// When dropped, the pipeline is shut down and temp resources are cleaned up.
pub struct TestPipeline {
    pub handle: PipelineHandle,
    pub store: Arc<SqliteJobStore>,
    pub artifacts: Arc<MemoryArtifactStore>,
    pub library: Arc<ReferenceLibrary>,

    // Private fields - keep resources alive until drop
    running: Option<RunningPipeline>,
    shutdown: CancellationToken,
    _temp_db_dir: TempDir,
}

/// Fast settings: no backoff, generous timeouts, two workers.
fn test_settings() -> PipelineSettings {
    PipelineSettings {
        workers: 2,
        max_attempts: 3,
        initial_backoff_secs: 0,
        max_backoff_secs: 0,
        backoff_multiplier: 1.0,
        idle_poll_interval_secs: 1,
        stage_timeouts: StageTimeouts::uniform(Duration::from_secs(30)),
    }
}

impl TestPipeline {
    /// Start a pipeline whose processors are built by `build` from the
    /// pipeline's reference library.
    pub fn start(build: impl FnOnce(Arc<ReferenceLibrary>) -> ProcessorRegistry) -> Self {
        let temp_db_dir = TempDir::new().expect("Failed to create temp dir");
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let library = Arc::new(ReferenceLibrary::new(
            artifacts.clone(),
            Arc::new(SqliteReferenceStore::in_memory().expect("Failed to open reference store")),
            FingerprintConfig::default(),
            MatchConfig::default(),
        ));
        let store = Arc::new(
            SqliteJobStore::new(db_path(&temp_db_dir)).expect("Failed to open job store"),
        );
        let registry = build(library.clone());
        Self::launch(store, artifacts, library, registry, temp_db_dir)
    }

    fn launch(
        store: Arc<SqliteJobStore>,
        artifacts: Arc<MemoryArtifactStore>,
        library: Arc<ReferenceLibrary>,
        registry: ProcessorRegistry,
        temp_db_dir: TempDir,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let running = start_pipeline(
            store.clone(),
            artifacts.clone(),
            registry,
            &test_settings(),
            shutdown.clone(),
        );
        Self {
            handle: running.handle(),
            store,
            artifacts,
            library,
            running: Some(running),
            shutdown,
            _temp_db_dir: temp_db_dir,
        }
    }

    /// Stop the pipeline, reopen the job database from disk and start again
    /// with new processors. Artifacts and the reference library survive.
    pub async fn restart(
        mut self,
        build: impl FnOnce(Arc<ReferenceLibrary>) -> ProcessorRegistry,
    ) -> Self {
        self.stop().await;
        let temp_db_dir = std::mem::replace(
            &mut self._temp_db_dir,
            TempDir::new().expect("Failed to create temp dir"),
        );
        let store = Arc::new(
            SqliteJobStore::new(db_path(&temp_db_dir)).expect("Failed to reopen job store"),
        );
        let registry = build(self.library.clone());
        Self::launch(
            store,
            self.artifacts.clone(),
            self.library.clone(),
            registry,
            temp_db_dir,
        )
    }

    async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(running) = self.running.take() {
            running.join().await;
        }
    }

    /// Store a clip as an upload artifact.
    pub fn upload(&self, samples: &[f32]) -> ArtifactHandle {
        self.artifacts.put(&wav(samples)).unwrap()
    }

    /// Add a licensed sample to the reference library.
    pub fn ingest_reference(&self, track_id: &str, samples: &[f32]) {
        let handle = self.artifacts.put(&wav(samples)).unwrap();
        self.library
            .ingest_reference_track(track_id, &handle)
            .expect("Failed to ingest reference track");
        // Reference audio is not part of any job
        self.artifacts.delete(&handle).unwrap();
    }

    pub fn load_job(&self, job_id: &str) -> Job {
        self.store
            .load_job(job_id)
            .unwrap()
            .unwrap_or_else(|| panic!("job {} not found", job_id))
    }

    /// Poll until `predicate` holds for the job.
    pub async fn wait_for(&self, job_id: &str, predicate: impl Fn(&Job) -> bool) -> Job {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            let job = self.load_job(job_id);
            if predicate(&job) {
                return job;
            }
            if Instant::now() > deadline {
                panic!(
                    "timed out waiting on job {} (status {}, stage {})",
                    job_id, job.status, job.stage
                );
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub async fn wait_for_terminal(&self, job_id: &str) -> Job {
        self.wait_for(job_id, |job| job.status.is_terminal()).await
    }

    pub async fn wait_for_status(&self, job_id: &str, status: JobStatus) -> Job {
        self.wait_for(job_id, |job| job.status == status).await
    }

    /// Poll until `condition` holds.
    pub async fn wait_until(&self, what: &str, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        while !condition() {
            if Instant::now() > deadline {
                panic!("timed out waiting until {}", what);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    pub async fn shutdown(mut self) {
        self.stop().await;
    }
}

impl Drop for TestPipeline {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("pipeline.db")
}
