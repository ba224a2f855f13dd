//! Spectral peak picking against a decaying masking envelope.
//!
//! A bin becomes a peak when it is a local maximum across frequency, clears
//! the magnitude floor and rises above the envelope left behind by earlier
//! peaks. Accepted peaks raise the envelope around their bin with a Gaussian
//! skirt, so loud components suppress their neighbours for a few frames.

use super::config::FingerprintConfig;
use super::spectrogram::Spectrogram;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub frame: u32,
    pub bin: u32,
    pub magnitude: f32,
}

/// Pick peaks from every frame not marked silent in `active`.
///
/// Returned peaks are grouped by frame, ascending by bin inside each frame.
pub fn pick_peaks(
    spectrogram: &Spectrogram,
    active: &[bool],
    config: &FingerprintConfig,
) -> Vec<Vec<Peak>> {
    let bins = spectrogram.bin_count;
    let spread = gaussian_skirt(config.envelope_spread_bins, bins);
    let mut envelope = vec![0.0f32; bins];
    let mut result = Vec::with_capacity(spectrogram.frame_count());

    for (frame_idx, magnitudes) in spectrogram.frames.iter().enumerate() {
        for value in envelope.iter_mut() {
            *value *= config.envelope_decay;
        }

        if !active.get(frame_idx).copied().unwrap_or(false) {
            result.push(Vec::new());
            continue;
        }

        let mut candidates: Vec<u32> = (1..bins.saturating_sub(1))
            .filter(|&b| {
                let m = magnitudes[b];
                m > config.peak_floor && m > magnitudes[b - 1] && m >= magnitudes[b + 1]
            })
            .map(|b| b as u32)
            .collect();
        // Loudest first; ties resolved by bin so the order is total.
        candidates.sort_by(|&a, &b| {
            magnitudes[b as usize]
                .total_cmp(&magnitudes[a as usize])
                .then(a.cmp(&b))
        });

        let mut frame_peaks = Vec::new();
        for bin in candidates {
            if frame_peaks.len() >= config.max_peaks_per_frame {
                break;
            }
            let b = bin as usize;
            let magnitude = magnitudes[b];
            if magnitude <= envelope[b] {
                continue;
            }
            raise_envelope(&mut envelope, b, magnitude, &spread);
            frame_peaks.push(Peak {
                frame: frame_idx as u32,
                bin,
                magnitude,
            });
        }
        frame_peaks.sort_by_key(|p| p.bin);
        result.push(frame_peaks);
    }

    result
}

/// `spread[d]` is the fraction of a peak's magnitude cast `d` bins away.
fn gaussian_skirt(sigma: f32, bins: usize) -> Vec<f32> {
    let sigma = sigma.max(f32::EPSILON);
    (0..bins)
        .map(|d| (-0.5 * (d as f32 / sigma).powi(2)).exp())
        .take_while(|&w| w > 1e-4)
        .collect()
}

fn raise_envelope(envelope: &mut [f32], center: usize, magnitude: f32, spread: &[f32]) {
    for (d, &weight) in spread.iter().enumerate() {
        let value = magnitude * weight;
        if let Some(slot) = envelope.get_mut(center + d) {
            *slot = slot.max(value);
        }
        if d > 0 && center >= d {
            let slot = &mut envelope[center - d];
            *slot = slot.max(value);
        }
    }
}
