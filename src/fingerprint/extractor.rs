//! Landmark extraction.
//!
//! Audio is resampled to the analysis rate, peak-normalized, turned into an
//! STFT magnitude spectrogram and reduced to sparse spectral peaks. Each
//! peak then acts as an anchor and is paired with up to `fan_out` later
//! peaks inside its target zone. A pair `(f1, f2, dt)` is packed into a
//! 32-bit hash; the anchor's frame is the landmark's time offset.

use super::config::FingerprintConfig;
use super::peaks::{pick_peaks, Peak};
use super::spectrogram::{frame_count, stft_magnitudes};
use crate::audio::{resample_linear, MAX_SAMPLE_RATE, MIN_SAMPLE_RATE};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Bumped whenever a change to extraction alters the landmarks produced for
/// the same audio. Stored reference fingerprints from other versions are
/// not loaded.
pub const EXTRACTOR_VERSION: u32 = 1;

const BIN_BITS: u32 = 9;
const DT_BITS: u32 = 8;
const BIN_MASK: u32 = (1 << BIN_BITS) - 1;
const DT_MASK: u32 = (1 << DT_BITS) - 1;

/// Largest frame delta a landmark hash can carry.
pub const MAX_TARGET_DT: u32 = DT_MASK;

#[derive(Debug, Error, PartialEq)]
pub enum ExtractError {
    #[error("Unsupported audio: {0}")]
    UnsupportedAudioKind(String),

    #[error("Insufficient signal: {0}")]
    InsufficientSignal(String),
}

/// A hashed peak pair anchored at a frame offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Landmark {
    pub hash: u32,
    pub anchor_frame: u32,
}

/// Pack anchor bin, target bin and frame delta into a landmark hash.
pub fn pack_hash(f1: u32, f2: u32, dt: u32) -> u32 {
    ((f1 & BIN_MASK) << (BIN_BITS + DT_BITS)) | ((f2 & BIN_MASK) << DT_BITS) | (dt & DT_MASK)
}

/// Inverse of [`pack_hash`].
pub fn unpack_hash(hash: u32) -> (u32, u32, u32) {
    (
        (hash >> (BIN_BITS + DT_BITS)) & BIN_MASK,
        (hash >> DT_BITS) & BIN_MASK,
        hash & DT_MASK,
    )
}

#[derive(Debug, Clone, Default)]
pub struct FingerprintExtractor {
    config: FingerprintConfig,
}

impl FingerprintExtractor {
    pub fn new(config: FingerprintConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FingerprintConfig {
        &self.config
    }

    /// Extract the landmark sequence for mono `samples` at `sample_rate`.
    ///
    /// Output is ordered by anchor frame, then anchor bin, then target
    /// selection order, and is identical for identical input.
    pub fn extract(&self, samples: &[f32], sample_rate: u32) -> Result<Vec<Landmark>, ExtractError> {
        let config = &self.config;

        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&sample_rate) {
            return Err(ExtractError::UnsupportedAudioKind(format!(
                "sample rate {} Hz",
                sample_rate
            )));
        }
        if samples.iter().any(|s| !s.is_finite()) {
            return Err(ExtractError::UnsupportedAudioKind(
                "non-finite samples".to_string(),
            ));
        }

        let mut analysis = resample_linear(samples, sample_rate, config.analysis_sample_rate);

        let min_len = ((config.min_duration_secs * config.analysis_sample_rate as f32) as usize)
            .max(config.frame_size);
        if analysis.len() < min_len {
            return Err(ExtractError::InsufficientSignal(format!(
                "{:.2}s of audio, need at least {:.2}s",
                analysis.len() as f32 / config.analysis_sample_rate as f32,
                min_len as f32 / config.analysis_sample_rate as f32
            )));
        }

        let raw_rms = frame_rms(&analysis, config.frame_size, config.hop_size);
        if raw_rms.iter().all(|&rms| rms < config.silence_rms) {
            return Err(ExtractError::InsufficientSignal(
                "clip is silent".to_string(),
            ));
        }

        // Peak normalization makes everything below independent of input gain.
        let peak = analysis.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        for s in analysis.iter_mut() {
            *s /= peak;
        }
        let active: Vec<bool> = frame_rms(&analysis, config.frame_size, config.hop_size)
            .into_iter()
            .map(|rms| rms >= config.silence_rms)
            .collect();

        let spectrogram = stft_magnitudes(&analysis, config.frame_size, config.hop_size);
        let peaks = pick_peaks(&spectrogram, &active, config);
        let landmarks = self.pair_peaks(&peaks);

        debug!(
            "Extracted {} landmarks from {} frames ({} peaks)",
            landmarks.len(),
            spectrogram.frame_count(),
            peaks.iter().map(Vec::len).sum::<usize>()
        );

        if landmarks.is_empty() {
            return Err(ExtractError::InsufficientSignal(
                "no spectral landmarks found".to_string(),
            ));
        }
        Ok(landmarks)
    }

    fn pair_peaks(&self, peaks_by_frame: &[Vec<Peak>]) -> Vec<Landmark> {
        let config = &self.config;
        let mut landmarks = Vec::new();
        let mut zone: Vec<&Peak> = Vec::new();

        for (t1, anchors) in peaks_by_frame.iter().enumerate() {
            for anchor in anchors {
                let mut paired = 0;
                for dt in config.target_dt_min..=config.target_dt_max {
                    if paired >= config.fan_out {
                        break;
                    }
                    let Some(targets) = peaks_by_frame.get(t1 + dt as usize) else {
                        break;
                    };

                    zone.clear();
                    zone.extend(
                        targets
                            .iter()
                            .filter(|p| p.bin.abs_diff(anchor.bin) <= config.target_df_max),
                    );
                    zone.sort_by_key(|p| (p.bin.abs_diff(anchor.bin), p.bin));

                    for target in zone.iter().take(config.fan_out - paired) {
                        landmarks.push(Landmark {
                            hash: pack_hash(anchor.bin, target.bin, dt),
                            anchor_frame: anchor.frame,
                        });
                        paired += 1;
                    }
                }
            }
        }

        landmarks
    }
}

fn frame_rms(samples: &[f32], frame_size: usize, hop_size: usize) -> Vec<f32> {
    (0..frame_count(samples.len(), frame_size, hop_size))
        .map(|i| {
            let frame = &samples[i * hop_size..i * hop_size + frame_size];
            (frame.iter().map(|s| s * s).sum::<f32>() / frame_size as f32).sqrt()
        })
        .collect()
}
