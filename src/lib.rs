//! Audiowave analysis pipeline library
//!
//! This library exposes the internal modules for testing and for the
//! `cli-fingerprint` admin tool.

pub mod audio;
pub mod config;
pub mod fingerprint;
pub mod metrics;
pub mod pipeline;
pub mod sqlite_persistence;
pub mod storage;

// Re-export commonly used types for convenience
pub use fingerprint::{MatchCandidate, ReferenceLibrary};
pub use pipeline::{start_pipeline, PipelineHandle, RunningPipeline};
pub use storage::{ArtifactHandle, ArtifactStore, FsArtifactStore, MemoryArtifactStore};
