//! Handle for talking to a running job manager.
//!
//! Mutations are sent to the manager as commands; reads go straight to the
//! job store.

use super::job_store::JobStore;
use super::models::{Job, JobEvent, JobStatus, JobView};
use crate::storage::ArtifactHandle;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {job_id} is {status}, expected {expected}")]
    InvalidState {
        job_id: String,
        status: JobStatus,
        expected: JobStatus,
    },

    #[error("Job {0} has been deleted")]
    Deleted(String),

    #[error("Job {job_id} was already requeued as {requeued_as}")]
    AlreadyRequeued { job_id: String, requeued_as: String },

    #[error("Job manager is not running")]
    ManagerUnavailable,

    #[error("Job store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Command sent to the job manager.
pub enum PipelineCommand {
    Submit {
        owner: String,
        upload: ArtifactHandle,
        response: oneshot::Sender<Result<String, PipelineError>>,
    },
    RequestDeletion {
        job_id: String,
        response: oneshot::Sender<Result<JobStatus, PipelineError>>,
    },
    RequeueDeadLetter {
        job_id: String,
        response: oneshot::Sender<Result<String, PipelineError>>,
    },
}

/// Cloneable handle used by the upload front-end and operator tools.
#[derive(Clone)]
pub struct PipelineHandle {
    /// Channel to send commands to the manager
    command_tx: mpsc::Sender<PipelineCommand>,
    /// Job store for read-only queries
    store: Arc<dyn JobStore>,
}

impl PipelineHandle {
    pub fn new(command_tx: mpsc::Sender<PipelineCommand>, store: Arc<dyn JobStore>) -> Self {
        Self { command_tx, store }
    }

    async fn send<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<T, PipelineError>>) -> PipelineCommand,
    ) -> Result<T, PipelineError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(command(response_tx))
            .await
            .map_err(|_| PipelineError::ManagerUnavailable)?;
        response_rx
            .await
            .map_err(|_| PipelineError::ManagerUnavailable)?
    }

    /// Create a job for an uploaded clip. Returns the new job id.
    pub async fn submit_job(
        &self,
        owner: &str,
        upload: ArtifactHandle,
    ) -> Result<String, PipelineError> {
        let owner = owner.to_string();
        self.send(|response| PipelineCommand::Submit {
            owner,
            upload,
            response,
        })
        .await
    }

    /// Cancel the job if it is still active and delete every artifact it owns.
    ///
    /// Idempotent. Returns the job's status after the request.
    pub async fn request_deletion(&self, job_id: &str) -> Result<JobStatus, PipelineError> {
        let job_id = job_id.to_string();
        self.send(|response| PipelineCommand::RequestDeletion { job_id, response })
            .await
    }

    /// Create a new job that resumes a dead-lettered job at its failing stage.
    /// Returns the new job id.
    pub async fn requeue_dead_letter(&self, job_id: &str) -> Result<String, PipelineError> {
        let job_id = job_id.to_string();
        self.send(|response| PipelineCommand::RequeueDeadLetter { job_id, response })
            .await
    }

    /// Full job record, for operators.
    pub fn load_job(&self, job_id: &str) -> Result<Job, PipelineError> {
        self.store
            .load_job(job_id)?
            .ok_or_else(|| PipelineError::JobNotFound(job_id.to_string()))
    }

    /// User-facing view of a job.
    pub fn get_job(&self, job_id: &str) -> Result<JobView, PipelineError> {
        Ok(JobView::from_job(&self.load_job(job_id)?))
    }

    pub fn list_jobs(
        &self,
        owner: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobView>, PipelineError> {
        Ok(self
            .store
            .list_for_owner(owner, limit, offset)?
            .iter()
            .map(JobView::from_job)
            .collect())
    }

    /// FAILED jobs that have not been requeued or deleted.
    pub fn dead_letters(&self) -> Result<Vec<Job>, PipelineError> {
        Ok(self
            .store
            .list_by_status(JobStatus::Failed)?
            .into_iter()
            .filter(|job| job.requeued_as.is_none() && !job.deletion_requested)
            .collect())
    }

    pub fn job_events(&self, job_id: &str) -> Result<Vec<JobEvent>, PipelineError> {
        // Distinguish unknown jobs from jobs without events
        self.load_job(job_id)?;
        Ok(self.store.events_for_job(job_id)?)
    }
}
