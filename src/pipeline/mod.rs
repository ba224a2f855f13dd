//! Multi-stage analysis pipeline.
//!
//! [`JobManager`] owns every job state transition and persists it before
//! acting on it. [`StageWorkerPool`] runs stage processors with per-stage
//! timeouts and reports outcomes back to the manager.

mod audit_logger;
mod fingerprint_stage;
mod handle;
mod job_store;
mod manager;
mod models;
mod processor;
mod remote_processor;
mod retry_policy;
mod schema;
mod worker_pool;

pub use audit_logger::JobAuditLogger;
pub use fingerprint_stage::FingerprintStageProcessor;
pub use handle::{PipelineCommand, PipelineError, PipelineHandle};
pub use job_store::{JobStore, SqliteJobStore};
pub use manager::{start_pipeline, JobManager, RunningPipeline};
pub use models::{
    FailureView, InstrumentTag, Job, JobEvent, JobEventType, JobStatus, JobView, Stage,
    StageError, StageErrorKind, StageOutput,
};
pub use processor::{ProcessorContext, ProcessorRegistry, StageInput, StageProcessor};
pub use remote_processor::{classify_status, RemoteModelProcessor, RemoteProcessorError};
pub use retry_policy::RetryPolicy;
pub use schema::PIPELINE_VERSIONED_SCHEMAS;
pub use worker_pool::{StageOutcome, StageResult, StageWorkerPool, WorkUnit};
