//! Artifact storage.
//!
//! Uploaded clips, separated stems and generated reports are opaque blobs
//! addressed by an [`ArtifactHandle`]. The pipeline only ever stores handles
//! in job records; the bytes live behind an [`ArtifactStore`].

mod fs_store;
mod memory_store;

pub use fs_store::FsArtifactStore;
pub use memory_store::MemoryArtifactStore;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Opaque reference to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactHandle(String);

impl ArtifactHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub(crate) fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Artifact not found: {0}")]
    NotFound(ArtifactHandle),

    #[error("Invalid artifact handle: {0}")]
    InvalidHandle(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Artifact scope closed")]
    Closed,
}

/// Blob storage used by the pipeline and the reference library.
///
/// Implementations are synchronous: stage processors run on blocking threads
/// and call into the store directly.
pub trait ArtifactStore: Send + Sync {
    /// Store a blob and return a fresh handle for it.
    fn put(&self, bytes: &[u8]) -> Result<ArtifactHandle, StorageError>;

    /// Read a blob back.
    fn get(&self, handle: &ArtifactHandle) -> Result<Vec<u8>, StorageError>;

    /// Delete a blob. Deleting a missing handle returns `StorageError::NotFound`.
    fn delete(&self, handle: &ArtifactHandle) -> Result<(), StorageError>;

    /// Returns true if the handle currently resolves to a blob.
    fn exists(&self, handle: &ArtifactHandle) -> bool {
        self.get(handle).is_ok()
    }
}
