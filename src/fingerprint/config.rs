/// Tunables for landmark extraction.
#[derive(Debug, Clone)]
pub struct FingerprintConfig {
    /// All input is resampled to this rate before analysis.
    pub analysis_sample_rate: u32,
    /// STFT frame length in samples (power of two).
    pub frame_size: usize,
    /// STFT hop in samples; one hop is one "analysis frame" of time offset.
    pub hop_size: usize,
    /// Inputs shorter than this are rejected.
    pub min_duration_secs: f32,
    /// Frames whose RMS is below this are skipped. A clip where every frame
    /// is below it is rejected as silent.
    pub silence_rms: f32,
    /// Absolute floor for peak magnitudes after peak normalization.
    pub peak_floor: f32,
    /// Per-frame multiplicative decay of the masking envelope.
    pub envelope_decay: f32,
    /// Gaussian spread (in bins) a peak casts onto the masking envelope.
    pub envelope_spread_bins: f32,
    pub max_peaks_per_frame: usize,
    /// Target zone: frame delta range between anchor and target peak.
    pub target_dt_min: u32,
    pub target_dt_max: u32,
    /// Target zone: maximum absolute bin distance between anchor and target.
    pub target_df_max: u32,
    /// Maximum number of targets paired with each anchor.
    pub fan_out: usize,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            analysis_sample_rate: 11025,
            frame_size: 512,
            hop_size: 256,
            min_duration_secs: 1.0,
            silence_rms: 1e-4,
            peak_floor: 0.01,
            envelope_decay: 0.98,
            envelope_spread_bins: 4.0,
            max_peaks_per_frame: 5,
            target_dt_min: 1,
            target_dt_max: 63,
            target_df_max: 64,
            fan_out: 5,
        }
    }
}

impl FingerprintConfig {
    /// Duration of one analysis frame (hop) in seconds.
    pub fn frame_duration_secs(&self) -> f64 {
        self.hop_size as f64 / self.analysis_sample_rate as f64
    }

    /// Number of magnitude bins produced per frame.
    pub fn bin_count(&self) -> usize {
        self.frame_size / 2 + 1
    }
}

/// Tunables for offset-histogram matching.
#[derive(Debug, Clone)]
pub struct MatchConfig {
    /// Half-width, in frames, of the offset window votes are counted in.
    pub offset_tolerance_frames: i64,
    /// Candidates with fewer votes are dropped.
    pub min_votes: usize,
    /// Upper bound on returned candidates.
    pub max_candidates: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            offset_tolerance_frames: 1,
            min_votes: 5,
            max_candidates: 10,
        }
    }
}
