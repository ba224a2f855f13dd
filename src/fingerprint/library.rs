//! Reference library: administrative ingestion of licensed samples.
//!
//! Ties together the artifact store (where sample audio lives), the
//! extractor, the persistent reference store and the in-memory index.

use super::config::{FingerprintConfig, MatchConfig};
use super::extractor::{ExtractError, FingerprintExtractor, Landmark, EXTRACTOR_VERSION};
use super::index::{FingerprintIndex, IndexError};
use super::matcher::MatchEngine;
use super::store::{ReferenceStore, ReferenceTrack};
use crate::audio::{decode_wav, AudioError};
use crate::metrics;
use crate::storage::{ArtifactHandle, ArtifactStore, StorageError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Extraction error: {0}")]
    Extract(#[from] ExtractError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Reference store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Outcome of rebuilding the index from the reference store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RebuildReport {
    pub loaded: usize,
    /// Tracks extracted by a different extractor version.
    pub skipped_version: usize,
    pub failed: usize,
}

pub struct ReferenceLibrary {
    artifacts: Arc<dyn ArtifactStore>,
    store: Arc<dyn ReferenceStore>,
    index: Arc<FingerprintIndex>,
    extractor: FingerprintExtractor,
    match_config: MatchConfig,
}

impl ReferenceLibrary {
    /// Create a library with an empty index. Call [`rebuild_index`](Self::rebuild_index)
    /// to load previously ingested tracks.
    pub fn new(
        artifacts: Arc<dyn ArtifactStore>,
        store: Arc<dyn ReferenceStore>,
        fingerprint_config: FingerprintConfig,
        match_config: MatchConfig,
    ) -> Self {
        Self {
            artifacts,
            store,
            index: Arc::new(FingerprintIndex::new()),
            extractor: FingerprintExtractor::new(fingerprint_config),
            match_config,
        }
    }

    /// Create a library and load every compatible stored track into the index.
    pub fn open(
        artifacts: Arc<dyn ArtifactStore>,
        store: Arc<dyn ReferenceStore>,
        fingerprint_config: FingerprintConfig,
        match_config: MatchConfig,
    ) -> Result<Self, LibraryError> {
        let library = Self::new(artifacts, store, fingerprint_config, match_config);
        let report = library.rebuild_index()?;
        info!(
            "Loaded {} reference tracks ({} skipped for extractor version, {} failed)",
            report.loaded, report.skipped_version, report.failed
        );
        Ok(library)
    }

    pub fn index(&self) -> &Arc<FingerprintIndex> {
        &self.index
    }

    pub fn extractor(&self) -> &FingerprintExtractor {
        &self.extractor
    }

    /// A match engine reading this library's index.
    pub fn match_engine(&self) -> MatchEngine {
        MatchEngine::new(
            self.index.clone(),
            self.match_config.clone(),
            self.extractor.config().frame_duration_secs(),
        )
    }

    pub fn rebuild_index(&self) -> Result<RebuildReport, LibraryError> {
        let mut report = RebuildReport::default();
        for track in self.store.list_tracks()? {
            if track.extractor_version != EXTRACTOR_VERSION {
                warn!(
                    "Skipping reference track {}: extracted with version {}, current is {}",
                    track.track_id, track.extractor_version, EXTRACTOR_VERSION
                );
                report.skipped_version += 1;
                continue;
            }
            let loaded = self
                .store
                .load_track(&track.track_id)
                .map_err(LibraryError::from)
                .and_then(|found| match found {
                    Some((_, landmarks)) => {
                        self.index.ingest(&track.track_id, &landmarks)?;
                        Ok(())
                    }
                    None => Ok(()),
                });
            match loaded {
                Ok(()) => report.loaded += 1,
                Err(e) => {
                    warn!("Failed to load reference track {}: {}", track.track_id, e);
                    report.failed += 1;
                }
            }
        }
        self.update_metrics();
        Ok(report)
    }

    /// Fingerprint the audio behind `audio_handle` and make it matchable as
    /// `track_id`, replacing any previous version of that track.
    pub fn ingest_reference_track(
        &self,
        track_id: &str,
        audio_handle: &ArtifactHandle,
    ) -> Result<ReferenceTrack, LibraryError> {
        let bytes = self.artifacts.get(audio_handle)?;
        let audio = decode_wav(&bytes)?;
        let landmarks = self.extractor.extract(&audio.samples, audio.sample_rate)?;

        let track = ReferenceTrack {
            track_id: track_id.to_string(),
            extractor_version: EXTRACTOR_VERSION,
            landmark_count: landmarks.len(),
            duration_secs: audio.duration_secs(),
            ingested_at: chrono::Utc::now().timestamp(),
        };
        self.ingest_landmarks(&track, &landmarks)?;

        info!(
            "Ingested reference track {} ({:.1}s, {} landmarks)",
            track_id, track.duration_secs, track.landmark_count
        );
        Ok(track)
    }

    /// Persist and index precomputed landmarks. The index only publishes the
    /// new version once the store has committed it.
    pub fn ingest_landmarks(
        &self,
        track: &ReferenceTrack,
        landmarks: &[Landmark],
    ) -> Result<(), LibraryError> {
        let store = &self.store;
        let result = self
            .index
            .ingest_with(&track.track_id, landmarks, || {
                store
                    .save_track(track, landmarks)
                    .map_err(|e| format!("{:#}", e))
            })
            .map_err(LibraryError::from);
        self.update_metrics();
        result
    }

    /// Remove a track from both the index and the store. The store goes
    /// first, so a failed delete leaves the track matchable and persisted.
    pub fn remove_reference_track(&self, track_id: &str) -> Result<bool, LibraryError> {
        let in_store = self.store.delete_track(track_id)?;
        let in_index = self.index.remove(track_id)?;
        self.update_metrics();
        Ok(in_index || in_store)
    }

    pub fn list_tracks(&self) -> Result<Vec<ReferenceTrack>, LibraryError> {
        Ok(self.store.list_tracks()?)
    }

    fn update_metrics(&self) {
        metrics::set_index_size(self.index.track_count(), self.index.posting_count());
    }
}
