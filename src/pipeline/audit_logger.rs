//! Audit logging for job transitions.
//!
//! Provides a higher-level interface over the job store's raw event log.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use super::job_store::JobStore;
use super::models::{Job, JobEvent, JobEventType, JobStatus, Stage, StageError};

/// Helper for logging audit events from the job manager.
///
/// Every method snapshots the job's stage, status and attempt counter
/// as they are after the transition.
pub struct JobAuditLogger {
    store: Arc<dyn JobStore>,
}

impl JobAuditLogger {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    fn log(&self, event: JobEvent) -> Result<()> {
        self.store.log_event(&event).map(|_| ())
    }

    pub fn log_submitted(&self, job: &Job) -> Result<()> {
        self.log(
            JobEvent::for_job(job, JobEventType::Submitted).with_details(serde_json::json!({
                "owner": job.owner,
                "upload": job.upload,
            })),
        )
    }

    pub fn log_stage_started(&self, job: &Job) -> Result<()> {
        self.log(JobEvent::for_job(job, JobEventType::StageStarted))
    }

    /// `job` is already advanced; `stage` is the one that just finished.
    pub fn log_stage_completed(&self, job: &Job, stage: Stage, duration: Duration) -> Result<()> {
        self.log(
            JobEvent::for_job(job, JobEventType::StageCompleted).with_details(serde_json::json!({
                "completed_stage": stage,
                "duration_ms": duration.as_millis() as u64,
            })),
        )
    }

    pub fn log_retry_scheduled(&self, job: &Job, error: &StageError) -> Result<()> {
        let mut event =
            JobEvent::for_job(job, JobEventType::RetryScheduled).with_error(error.kind);
        if let Some(next_retry_at) = job.next_retry_at {
            event = event.with_details(serde_json::json!({
                "next_retry_at": next_retry_at,
                "message": error.message,
            }));
        }
        self.log(event)
    }

    /// Log a job entering the dead letter state.
    pub fn log_failed(&self, job: &Job, error: &StageError) -> Result<()> {
        self.log(
            JobEvent::for_job(job, JobEventType::Failed)
                .with_error(error.kind)
                .with_details(serde_json::json!({
                    "message": error.message,
                    "retryable": error.is_retryable(),
                })),
        )
    }

    pub fn log_completed(&self, job: &Job) -> Result<()> {
        let mut event = JobEvent::for_job(job, JobEventType::Completed);
        if let Some(candidates) = job.fingerprint_matches() {
            event = event.with_details(serde_json::json!({
                "fingerprint_candidates": candidates.len(),
            }));
        }
        self.log(event)
    }

    pub fn log_cancelled(&self, job: &Job, previous: JobStatus) -> Result<()> {
        self.log(
            JobEvent::for_job(job, JobEventType::Cancelled).with_details(serde_json::json!({
                "previous_status": previous,
            })),
        )
    }

    pub fn log_deletion_requested(&self, job: &Job, purged_artifacts: usize) -> Result<()> {
        self.log(
            JobEvent::for_job(job, JobEventType::DeletionRequested).with_details(
                serde_json::json!({
                    "purged_artifacts": purged_artifacts,
                }),
            ),
        )
    }

    /// Logged on both the dead-lettered job and its replacement.
    pub fn log_requeued(&self, failed: &Job, replacement: &Job) -> Result<()> {
        let details = serde_json::json!({
            "requeued_from": failed.id,
            "requeued_as": replacement.id,
        });
        self.log(JobEvent::for_job(failed, JobEventType::Requeued).with_details(details.clone()))?;
        self.log(JobEvent::for_job(replacement, JobEventType::Requeued).with_details(details))
    }

    pub fn log_recovered(&self, job: &Job) -> Result<()> {
        self.log(JobEvent::for_job(job, JobEventType::Recovered))
    }

    /// Log a stage output dropped because the job moved on without it.
    pub fn log_output_discarded(&self, job: &Job, stage: Stage, artifacts: usize) -> Result<()> {
        self.log(
            JobEvent::for_job(job, JobEventType::OutputDiscarded).with_details(serde_json::json!({
                "discarded_stage": stage,
                "deleted_artifacts": artifacts,
            })),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::job_store::SqliteJobStore;
    use crate::pipeline::models::StageErrorKind;
    use crate::storage::ArtifactHandle;

    fn setup() -> (Arc<SqliteJobStore>, JobAuditLogger, Job) {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let logger = JobAuditLogger::new(store.clone());
        let job = Job::new("job-1".into(), "user-1".into(), ArtifactHandle::new("up"));
        store.save_job(&job).unwrap();
        (store, logger, job)
    }

    #[test]
    fn test_log_sequence() {
        let (store, logger, mut job) = setup();
        logger.log_submitted(&job).unwrap();

        job.status = JobStatus::Running;
        logger.log_stage_started(&job).unwrap();

        let error = StageError::new(StageErrorKind::Timeout, "deadline exceeded");
        job.status = JobStatus::RetryWait;
        job.attempts.insert(Stage::Separation, 1);
        job.next_retry_at = Some(42);
        logger.log_retry_scheduled(&job, &error).unwrap();

        let events = store.events_for_job("job-1").unwrap();
        let types: Vec<JobEventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                JobEventType::Submitted,
                JobEventType::StageStarted,
                JobEventType::RetryScheduled
            ]
        );
        assert_eq!(events[2].attempt, 1);
        assert_eq!(events[2].error_kind, Some(StageErrorKind::Timeout));
        assert_eq!(events[2].details.as_ref().unwrap()["next_retry_at"], 42);
    }

    #[test]
    fn test_log_requeued_writes_both_jobs() {
        let (store, logger, failed) = setup();
        let replacement = Job::new("job-2".into(), "user-1".into(), ArtifactHandle::new("up"));
        store.save_job(&replacement).unwrap();

        logger.log_requeued(&failed, &replacement).unwrap();

        for id in ["job-1", "job-2"] {
            let events = store.events_for_job(id).unwrap();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].event_type, JobEventType::Requeued);
            assert_eq!(events[0].details.as_ref().unwrap()["requeued_as"], "job-2");
        }
    }
}
