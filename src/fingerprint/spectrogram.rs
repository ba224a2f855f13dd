//! Short-time Fourier transform magnitudes.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

/// Magnitude spectrogram: one row of `bin_count` magnitudes per frame.
#[derive(Debug, Clone)]
pub struct Spectrogram {
    pub frames: Vec<Vec<f32>>,
    pub bin_count: usize,
}

impl Spectrogram {
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

/// Symmetric Hann window of length `n`.
pub fn hann_window(n: usize) -> Vec<f32> {
    if n <= 1 {
        return vec![1.0; n];
    }
    (0..n)
        .map(|i| {
            let x = 2.0 * std::f32::consts::PI * i as f32 / (n - 1) as f32;
            0.5 * (1.0 - x.cos())
        })
        .collect()
}

/// Number of full frames that fit in `len` samples.
pub fn frame_count(len: usize, frame_size: usize, hop_size: usize) -> usize {
    if len < frame_size || hop_size == 0 {
        0
    } else {
        (len - frame_size) / hop_size + 1
    }
}

/// Hann-windowed STFT magnitudes over full frames only; a trailing partial
/// frame is dropped.
pub fn stft_magnitudes(samples: &[f32], frame_size: usize, hop_size: usize) -> Spectrogram {
    let bin_count = frame_size / 2 + 1;
    let n_frames = frame_count(samples.len(), frame_size, hop_size);
    let window = hann_window(frame_size);

    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(frame_size);
    let mut buffer = vec![Complex::new(0.0f32, 0.0); frame_size];

    let mut frames = Vec::with_capacity(n_frames);
    for frame_idx in 0..n_frames {
        let start = frame_idx * hop_size;
        for (slot, (&sample, &w)) in buffer
            .iter_mut()
            .zip(samples[start..start + frame_size].iter().zip(window.iter()))
        {
            *slot = Complex::new(sample * w, 0.0);
        }
        fft.process(&mut buffer);
        frames.push(buffer[..bin_count].iter().map(|c| c.norm()).collect());
    }

    Spectrogram { frames, bin_count }
}
