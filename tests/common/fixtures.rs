//! Synthetic audio and scripted stage processors

use super::constants::SAMPLE_RATE;
use audiowave_pipeline::audio::encode_wav_mono;
use audiowave_pipeline::fingerprint::ReferenceLibrary;
use audiowave_pipeline::pipeline::{
    FingerprintStageProcessor, InstrumentTag, ProcessorContext, ProcessorRegistry, Stage,
    StageError, StageErrorKind, StageInput, StageOutput, StageProcessor,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Length of one tone segment in seconds.
const SEGMENT_SECS: f32 = 0.1;

/// A deterministic "licensed sample": a sequence of 100ms segments, each a
/// mix of three random tones. Different seeds give unrelated audio.
pub fn synth_sample(seed: u64, secs: f32) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let len = (SAMPLE_RATE as f32 * secs) as usize;
    let segment_len = (SAMPLE_RATE as f32 * SEGMENT_SECS) as usize;

    let mut tones: Vec<(f32, f32)> = Vec::new();
    let mut samples = Vec::with_capacity(len);
    for i in 0..len {
        if i % segment_len == 0 {
            tones = (0..3)
                .map(|_| {
                    (
                        rng.random_range(300.0f32..3500.0),
                        rng.random_range(0.08f32..0.25),
                    )
                })
                .collect();
        }
        let t = i as f32 / SAMPLE_RATE as f32;
        samples.push(
            tones
                .iter()
                .map(|(freq, amp)| amp * (2.0 * std::f32::consts::PI * freq * t).sin())
                .sum(),
        );
    }
    samples
}

/// Add uniform white noise of the given peak amplitude.
pub fn add_noise(samples: &[f32], seed: u64, amplitude: f32) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    samples
        .iter()
        .map(|s| s + rng.random_range(-amplitude..amplitude))
        .collect()
}

pub fn wav(samples: &[f32]) -> Vec<u8> {
    encode_wav_mono(samples, SAMPLE_RATE).unwrap()
}

fn storage_failure(kind: StageErrorKind, e: impl std::fmt::Display) -> StageError {
    StageError::new(kind, e.to_string())
}

/// Separation stand-in: writes the upload back as the "mix" and "drums" stems.
#[derive(Default)]
pub struct CopySeparation {
    calls: AtomicUsize,
}

impl CopySeparation {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl StageProcessor for CopySeparation {
    fn stage(&self) -> Stage {
        Stage::Separation
    }

    fn process(&self, ctx: &ProcessorContext, input: &StageInput) -> Result<StageOutput, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let bytes = ctx
            .artifacts
            .get(&input.upload)
            .map_err(|e| storage_failure(StageErrorKind::MalformedInput, e))?;
        let mut stems = BTreeMap::new();
        for name in ["mix", "drums"] {
            let handle = ctx
                .artifacts
                .put(&bytes)
                .map_err(|e| storage_failure(StageErrorKind::ResourceExhausted, e))?;
            stems.insert(name.to_string(), handle);
        }
        Ok(StageOutput::Separation { stems })
    }
}

/// Returns a fixed result for TAGGING, TEMPO_KEY or REPORT.
pub struct StaticProcessor {
    stage: Stage,
    calls: AtomicUsize,
}

impl StaticProcessor {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl StageProcessor for StaticProcessor {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn process(&self, ctx: &ProcessorContext, input: &StageInput) -> Result<StageOutput, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.stage {
            Stage::Tagging => Ok(StageOutput::Tagging {
                tags: vec![InstrumentTag {
                    label: "drums".to_string(),
                    confidence: 0.9,
                }],
            }),
            Stage::TempoKey => Ok(StageOutput::TempoKey {
                bpm: 120.0,
                key: "C major".to_string(),
                confidence: 0.7,
            }),
            Stage::Report => {
                let summary = serde_json::to_vec(&input.prior)
                    .map_err(|e| storage_failure(StageErrorKind::Internal, e))?;
                let report = ctx
                    .artifacts
                    .put(&summary)
                    .map_err(|e| storage_failure(StageErrorKind::ResourceExhausted, e))?;
                Ok(StageOutput::Report { report })
            }
            stage => Err(StageError::new(
                StageErrorKind::Internal,
                format!("no static output for {}", stage),
            )),
        }
    }
}

/// Fails with the scripted error kinds, in order, then delegates.
pub struct ScriptedProcessor {
    inner: Arc<dyn StageProcessor>,
    failures: Mutex<VecDeque<StageErrorKind>>,
    calls: AtomicUsize,
}

impl ScriptedProcessor {
    pub fn new(inner: Arc<dyn StageProcessor>, failures: Vec<StageErrorKind>) -> Self {
        Self {
            inner,
            failures: Mutex::new(failures.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Shortcut for a scripted [`StaticProcessor`].
    pub fn failing(stage: Stage, failures: Vec<StageErrorKind>) -> Self {
        Self::new(Arc::new(StaticProcessor::new(stage)), failures)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl StageProcessor for ScriptedProcessor {
    fn stage(&self) -> Stage {
        self.inner.stage()
    }

    fn process(&self, ctx: &ProcessorContext, input: &StageInput) -> Result<StageOutput, StageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(kind) = self.failures.lock().unwrap().pop_front() {
            return Err(StageError::new(kind, format!("scripted failure #{}", call)));
        }
        self.inner.process(ctx, input)
    }
}

/// Writes a partial artifact, then blocks until its execution is cancelled.
pub struct BlockingProcessor {
    stage: Stage,
    started: AtomicBool,
}

impl BlockingProcessor {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            started: AtomicBool::new(false),
        }
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

impl StageProcessor for BlockingProcessor {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn process(&self, ctx: &ProcessorContext, _input: &StageInput) -> Result<StageOutput, StageError> {
        ctx.artifacts
            .put(b"partial output")
            .map_err(|e| storage_failure(StageErrorKind::ResourceExhausted, e))?;
        self.started.store(true, Ordering::SeqCst);

        let deadline = Instant::now() + Duration::from_secs(20);
        while !ctx.is_cancelled() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        // Either refused or deleted along with the rest of the execution's writes
        let _ = ctx.artifacts.put(b"late output");
        Err(StageError::new(StageErrorKind::Timeout, "cancelled"))
    }
}

/// Every stage registered: fake models plus the real fingerprint stage.
pub fn default_registry(library: Arc<ReferenceLibrary>) -> ProcessorRegistry {
    ProcessorRegistry::new()
        .with(Arc::new(CopySeparation::default()))
        .with(Arc::new(StaticProcessor::new(Stage::Tagging)))
        .with(Arc::new(StaticProcessor::new(Stage::TempoKey)))
        .with(Arc::new(FingerprintStageProcessor::new(library)))
        .with(Arc::new(StaticProcessor::new(Stage::Report)))
}
