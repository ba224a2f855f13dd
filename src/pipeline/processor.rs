//! Stage processors and the context they run in.

use super::models::{Stage, StageError, StageOutput};
use crate::storage::{ArtifactHandle, ArtifactStore, StorageError};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Everything a processor needs to know about the job it works on.
#[derive(Debug, Clone)]
pub struct StageInput {
    pub job_id: String,
    pub stage: Stage,
    /// 1-based attempt number of this execution.
    pub attempt: u32,
    /// The uploaded clip.
    pub upload: ArtifactHandle,
    /// Results of every stage that already completed.
    pub prior: BTreeMap<Stage, StageOutput>,
}

impl StageInput {
    pub fn prior_output(&self, stage: Stage) -> Option<&StageOutput> {
        self.prior.get(&stage)
    }

    /// Stems produced by the separation stage, if it ran.
    pub fn stems(&self) -> Option<&BTreeMap<String, ArtifactHandle>> {
        match self.prior.get(&Stage::Separation) {
            Some(StageOutput::Separation { stems }) => Some(stems),
            _ => None,
        }
    }
}

/// Context provided to processors during execution.
#[derive(Clone)]
pub struct ProcessorContext {
    /// Cancelled when the job is cancelled, the stage times out or the
    /// pipeline shuts down.
    pub cancellation_token: CancellationToken,

    /// Artifact storage scoped to this execution.
    pub artifacts: Arc<dyn ArtifactStore>,
}

impl ProcessorContext {
    pub fn new(cancellation_token: CancellationToken, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            cancellation_token,
            artifacts,
        }
    }

    /// Processors should check this between expensive steps and return early
    /// when it is set. Whatever they return afterwards is discarded.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

/// A pluggable analysis step.
///
/// Processors are executed synchronously on a blocking thread via
/// `spawn_blocking`. They must not mutate job state: they only read their
/// input and return a result.
pub trait StageProcessor: Send + Sync {
    /// The stage this processor handles.
    fn stage(&self) -> Stage;

    fn process(&self, ctx: &ProcessorContext, input: &StageInput) -> Result<StageOutput, StageError>;
}

/// Registry of processors keyed by stage.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<Stage, Arc<dyn StageProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor, replacing any previous one for the same stage.
    pub fn register(&mut self, processor: Arc<dyn StageProcessor>) {
        self.processors.insert(processor.stage(), processor);
    }

    pub fn with(mut self, processor: Arc<dyn StageProcessor>) -> Self {
        self.register(processor);
        self
    }

    pub fn get(&self, stage: Stage) -> Option<Arc<dyn StageProcessor>> {
        self.processors.get(&stage).cloned()
    }

    /// Stages without a registered processor.
    pub fn missing_stages(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|s| !self.processors.contains_key(s))
            .collect()
    }
}

/// Artifact store wrapper that tracks what one execution writes.
///
/// Once abandoned, everything it wrote is deleted and further writes are
/// refused, so a processor that outlives its timeout cannot leak artifacts.
pub(crate) struct ScopedArtifactStore {
    inner: Arc<dyn ArtifactStore>,
    created: Mutex<Vec<ArtifactHandle>>,
    abandoned: AtomicBool,
}

impl ScopedArtifactStore {
    pub(crate) fn new(inner: Arc<dyn ArtifactStore>) -> Self {
        Self {
            inner,
            created: Mutex::new(Vec::new()),
            abandoned: AtomicBool::new(false),
        }
    }

    /// Handles written so far.
    pub(crate) fn created(&self) -> Vec<ArtifactHandle> {
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Delete everything written so far and refuse further writes.
    pub(crate) fn abandon(&self) {
        let mut created = self.created.lock().unwrap_or_else(|e| e.into_inner());
        self.abandoned.store(true, Ordering::SeqCst);
        for handle in created.drain(..) {
            let _ = self.inner.delete(&handle);
        }
    }
}

impl ArtifactStore for ScopedArtifactStore {
    fn put(&self, bytes: &[u8]) -> Result<ArtifactHandle, StorageError> {
        // Held across the write so abandon() cannot miss it
        let mut created = self.created.lock().unwrap_or_else(|e| e.into_inner());
        if self.abandoned.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        let handle = self.inner.put(bytes)?;
        created.push(handle.clone());
        Ok(handle)
    }

    fn get(&self, handle: &ArtifactHandle) -> Result<Vec<u8>, StorageError> {
        self.inner.get(handle)
    }

    fn delete(&self, handle: &ArtifactHandle) -> Result<(), StorageError> {
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|h| h != handle);
        self.inner.delete(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::models::StageErrorKind;
    use crate::storage::MemoryArtifactStore;

    struct Fixed(Stage);

    impl StageProcessor for Fixed {
        fn stage(&self) -> Stage {
            self.0
        }
        fn process(&self, _ctx: &ProcessorContext, _input: &StageInput) -> Result<StageOutput, StageError> {
            Err(StageError::new(StageErrorKind::Internal, "unused"))
        }
    }

    #[test]
    fn test_registry_reports_missing_stages() {
        let registry = ProcessorRegistry::new()
            .with(Arc::new(Fixed(Stage::Separation)))
            .with(Arc::new(Fixed(Stage::Report)));

        assert!(registry.get(Stage::Separation).is_some());
        assert!(registry.get(Stage::Tagging).is_none());
        assert_eq!(
            registry.missing_stages(),
            vec![Stage::Tagging, Stage::TempoKey, Stage::FingerprintMatch]
        );
    }

    #[test]
    fn test_scoped_store_tracks_and_abandons() {
        let inner = Arc::new(MemoryArtifactStore::new());
        let scope = ScopedArtifactStore::new(inner.clone());

        let a = scope.put(b"a").unwrap();
        let b = scope.put(b"b").unwrap();
        scope.delete(&b).unwrap();
        assert_eq!(scope.created(), vec![a.clone()]);
        assert_eq!(scope.get(&a).unwrap(), b"a");

        scope.abandon();
        assert!(!inner.exists(&a));
        assert!(inner.is_empty());
        assert!(matches!(scope.put(b"late"), Err(StorageError::Closed)));
        assert!(inner.is_empty());
    }

    #[test]
    fn test_stage_input_stems() {
        let mut stems = BTreeMap::new();
        stems.insert("other".to_string(), ArtifactHandle::new("h"));
        let mut input = StageInput {
            job_id: "j".into(),
            stage: Stage::FingerprintMatch,
            attempt: 1,
            upload: ArtifactHandle::new("up"),
            prior: BTreeMap::new(),
        };
        assert!(input.stems().is_none());

        input
            .prior
            .insert(Stage::Separation, StageOutput::Separation { stems });
        assert_eq!(input.stems().unwrap()["other"], ArtifactHandle::new("h"));
    }
}
