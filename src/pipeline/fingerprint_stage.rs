//! The FINGERPRINT_MATCH stage: landmark extraction plus index lookup.

use super::models::{Stage, StageError, StageErrorKind, StageOutput};
use super::processor::{ProcessorContext, StageInput, StageProcessor};
use crate::audio::{decode_wav, AudioError};
use crate::fingerprint::{ExtractError, ReferenceLibrary};
use crate::metrics;
use crate::storage::StorageError;
use std::sync::Arc;
use tracing::{debug, info};

/// Stems tried in order; "mix" is the full mixture when separation keeps it.
const QUERY_STEMS: [&str; 2] = ["mix", "other"];

pub struct FingerprintStageProcessor {
    library: Arc<ReferenceLibrary>,
}

impl FingerprintStageProcessor {
    pub fn new(library: Arc<ReferenceLibrary>) -> Self {
        Self { library }
    }
}

fn storage_error(error: StorageError) -> StageError {
    match error {
        StorageError::NotFound(handle) => StageError::new(
            StageErrorKind::CorruptedStem,
            format!("Stem {} is missing", handle),
        ),
        StorageError::InvalidHandle(handle) => StageError::new(
            StageErrorKind::CorruptedStem,
            format!("Invalid stem handle {}", handle),
        ),
        StorageError::Io(e) => StageError::new(
            StageErrorKind::ResourceExhausted,
            format!("Failed to read stem: {}", e),
        ),
        StorageError::Closed => {
            StageError::new(StageErrorKind::Timeout, "Execution was abandoned")
        }
    }
}

impl StageProcessor for FingerprintStageProcessor {
    fn stage(&self) -> Stage {
        Stage::FingerprintMatch
    }

    fn process(&self, ctx: &ProcessorContext, input: &StageInput) -> Result<StageOutput, StageError> {
        let stems = input.stems().ok_or_else(|| {
            StageError::new(StageErrorKind::Internal, "Separation result is missing")
        })?;
        let (stem_name, handle) = QUERY_STEMS
            .iter()
            .find_map(|name| stems.get(*name).map(|handle| (*name, handle)))
            .ok_or_else(|| {
                StageError::new(
                    StageErrorKind::CorruptedStem,
                    format!("No {} stem among {:?}", QUERY_STEMS.join("/"), stems.keys()),
                )
            })?;

        let bytes = ctx.artifacts.get(handle).map_err(storage_error)?;
        let audio = decode_wav(&bytes).map_err(|e| match e {
            AudioError::Decode(e) => StageError::new(
                StageErrorKind::CorruptedStem,
                format!("Stem {} could not be decoded: {}", stem_name, e),
            ),
            AudioError::Unsupported(reason) => {
                StageError::new(StageErrorKind::UnsupportedCodec, reason)
            }
        })?;

        if ctx.is_cancelled() {
            return Err(StageError::new(StageErrorKind::Timeout, "Cancelled before extraction"));
        }

        let landmarks = match self
            .library
            .extractor()
            .extract(&audio.samples, audio.sample_rate)
        {
            Ok(landmarks) => landmarks,
            Err(ExtractError::InsufficientSignal(reason)) => {
                // A silent or very short stem cannot contain a sample
                debug!(job_id = %input.job_id, "No landmarks in {} stem: {}", stem_name, reason);
                metrics::record_match_query(0);
                return Ok(StageOutput::Fingerprint {
                    candidates: Vec::new(),
                    query_landmarks: 0,
                });
            }
            Err(ExtractError::UnsupportedAudioKind(reason)) => {
                return Err(StageError::new(StageErrorKind::UnsupportedCodec, reason));
            }
        };

        let candidates = self.library.match_engine().find_matches(&landmarks);
        metrics::record_match_query(candidates.len());
        info!(
            job_id = %input.job_id,
            stem = stem_name,
            landmarks = landmarks.len(),
            candidates = candidates.len(),
            "Fingerprint lookup finished"
        );

        Ok(StageOutput::Fingerprint {
            candidates,
            query_landmarks: landmarks.len(),
        })
    }
}
