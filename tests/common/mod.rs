//! Common test infrastructure
//!
//! Synthetic audio, scripted stage processors and a harness that runs a
//! full pipeline against in-memory artifact storage.
//! Tests should only import from this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{default_registry, TestPipeline};
//!
//! #[tokio::test]
//! async fn test_job_completes() {
//!     let pipeline = TestPipeline::start(default_registry);
//!     let upload = pipeline.upload(&common::synth_sample(1, 5.0));
//!     let job_id = pipeline.handle.submit_job(common::OWNER, upload).await.unwrap();
//!     pipeline.wait_for_terminal(&job_id).await;
//! }
//! ```

mod constants;
mod fixtures;
mod harness;

// Public API - this is what tests import
pub use constants::*;
pub use fixtures::*;
pub use harness::TestPipeline;
