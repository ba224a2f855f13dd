//! Job manager: the single owner of job state.
//!
//! Runs the per-job state machine
//! (QUEUED → RUNNING → RETRY_WAIT → DONE / FAILED / CANCELLED), hands ready
//! stages to the [`StageWorkerPool`] and applies the outcomes it reports.
//! Every transition is persisted before the next stage is enqueued.

use super::audit_logger::JobAuditLogger;
use super::handle::{PipelineCommand, PipelineError, PipelineHandle};
use super::job_store::JobStore;
use super::models::{Job, JobStatus, StageError, StageOutput};
use super::processor::{ProcessorRegistry, StageInput};
use super::retry_policy::RetryPolicy;
use super::worker_pool::{StageOutcome, StageResult, StageWorkerPool, WorkUnit};
use super::Stage;
use crate::config::PipelineSettings;
use crate::metrics;
use crate::storage::{ArtifactHandle, ArtifactStore, StorageError};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of the command channel between handles and the manager.
const COMMAND_CHANNEL_CAPACITY: usize = 100;

struct InFlight {
    stage: Stage,
    cancel: CancellationToken,
}

pub struct JobManager {
    store: Arc<dyn JobStore>,
    audit: JobAuditLogger,
    artifacts: Arc<dyn ArtifactStore>,
    retry_policy: RetryPolicy,
    /// Maximum stage executions dispatched at once
    capacity: usize,
    idle_poll_interval: Duration,

    work_tx: mpsc::UnboundedSender<WorkUnit>,
    outcome_rx: mpsc::UnboundedReceiver<StageOutcome>,
    command_rx: mpsc::Receiver<PipelineCommand>,

    in_flight: HashMap<String, InFlight>,
    /// Jobs left RUNNING in the store with no execution after a failed persist
    stranded: HashSet<String>,
    shutdown_token: CancellationToken,
}

impl JobManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        artifacts: Arc<dyn ArtifactStore>,
        settings: &PipelineSettings,
        work_tx: mpsc::UnboundedSender<WorkUnit>,
        outcome_rx: mpsc::UnboundedReceiver<StageOutcome>,
        command_rx: mpsc::Receiver<PipelineCommand>,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            audit: JobAuditLogger::new(store.clone()),
            store,
            artifacts,
            retry_policy: RetryPolicy::new(settings),
            capacity: settings.workers.max(1),
            idle_poll_interval: Duration::from_secs(settings.idle_poll_interval_secs.max(1)),
            work_tx,
            outcome_rx,
            command_rx,
            in_flight: HashMap::new(),
            stranded: HashSet::new(),
            shutdown_token,
        }
    }

    /// Run the manager until the shutdown token is cancelled.
    pub async fn run(mut self) {
        info!("Starting job manager with {} execution slots", self.capacity);

        match self.recover() {
            Ok(count) if count > 0 => info!("Recovered {} interrupted jobs", count),
            Ok(_) => {}
            Err(e) => error!("Failed to recover interrupted jobs: {:#}", e),
        }
        self.dispatch_ready();

        loop {
            let sleep_duration = self.time_until_next_retry();

            tokio::select! {
                Some(outcome) = self.outcome_rx.recv() => {
                    self.handle_outcome(outcome);
                    self.dispatch_ready();
                }
                Some(cmd) = self.command_rx.recv() => {
                    self.handle_command(cmd);
                }
                _ = tokio::time::sleep(sleep_duration) => {
                    self.dispatch_ready();
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Job manager received shutdown signal");
                    break;
                }
            }
        }

        // In-flight stages stay RUNNING in the store and are recovered on restart
        for (job_id, flight) in self.in_flight.drain() {
            debug!("Abandoning {} of job {} for shutdown", flight.stage, job_id);
            flight.cancel.cancel();
        }
        info!("Job manager stopped");
    }

    /// Reset jobs interrupted by a crash and finish interrupted deletions.
    ///
    /// RUNNING jobs go back to QUEUED at their recorded stage, keeping the
    /// results of every stage that completed before the crash.
    pub fn recover(&mut self) -> Result<usize> {
        let mut recovered = 0;
        for mut job in self.store.list_by_status(JobStatus::Running)? {
            if self.in_flight.contains_key(&job.id) {
                continue;
            }
            job.status = JobStatus::Queued;
            self.persist(&mut job)?;
            if let Err(e) = self.audit.log_recovered(&job) {
                warn!("Failed to log recovery of job {}: {}", job.id, e);
            }
            info!(job_id = %job.id, stage = %job.stage, "Re-queued interrupted job");
            recovered += 1;
        }

        for status in [JobStatus::Cancelled, JobStatus::Done, JobStatus::Failed] {
            for mut job in self.store.list_by_status(status)? {
                if job.deletion_requested
                    && (!job.results.is_empty() || !job.artifacts.is_empty())
                {
                    info!("Finishing interrupted deletion of job {}", job.id);
                    self.purge_artifacts(&job);
                    job.results.clear();
                    job.artifacts.clear();
                    self.persist(&mut job)?;
                }
            }
        }

        Ok(recovered)
    }

    fn handle_command(&mut self, cmd: PipelineCommand) {
        match cmd {
            PipelineCommand::Submit {
                owner,
                upload,
                response,
            } => {
                let result = self.submit(owner, upload);
                let _ = response.send(result);
            }
            PipelineCommand::RequestDeletion { job_id, response } => {
                let result = self.request_deletion(&job_id);
                let _ = response.send(result);
            }
            PipelineCommand::RequeueDeadLetter { job_id, response } => {
                let result = self.requeue_dead_letter(&job_id);
                let _ = response.send(result);
            }
        }
    }

    fn submit(&mut self, owner: String, upload: ArtifactHandle) -> Result<String, PipelineError> {
        let mut job = Job::new(uuid::Uuid::new_v4().to_string(), owner, upload);
        self.persist(&mut job)?;

        metrics::record_job_submitted();
        metrics::record_job_transition(JobStatus::Queued.as_str());
        if let Err(e) = self.audit.log_submitted(&job) {
            warn!("Failed to log submission of job {}: {}", job.id, e);
        }
        info!(job_id = %job.id, owner = %job.owner, "Job submitted");

        let id = job.id.clone();
        self.dispatch_ready();
        Ok(id)
    }

    fn request_deletion(&mut self, job_id: &str) -> Result<JobStatus, PipelineError> {
        let mut job = self
            .store
            .load_job(job_id)?
            .ok_or_else(|| PipelineError::JobNotFound(job_id.to_string()))?;

        if job.deletion_requested {
            debug!("Deletion of job {} already requested", job_id);
            return Ok(job.status);
        }

        let previous = job.status;
        let mut freed_slot = false;
        if !previous.is_terminal() {
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(chrono::Utc::now().timestamp());
            job.next_retry_at = None;
            if let Some(flight) = self.in_flight.remove(job_id) {
                flight.cancel.cancel();
                freed_slot = true;
            }
        }
        job.deletion_requested = true;

        // Record the request before any artifact disappears
        self.persist(&mut job)?;
        if job.status != previous {
            metrics::record_job_transition(job.status.as_str());
            if let Err(e) = self.audit.log_cancelled(&job, previous) {
                warn!("Failed to log cancellation of job {}: {}", job.id, e);
            }
        }

        let purged = self.purge_artifacts(&job);
        job.results.clear();
        job.artifacts.clear();
        self.persist(&mut job)?;

        if let Err(e) = self.audit.log_deletion_requested(&job, purged) {
            warn!("Failed to log deletion of job {}: {}", job.id, e);
        }
        info!(
            job_id = %job.id,
            previous = %previous,
            purged,
            "Job deleted"
        );

        if freed_slot {
            self.dispatch_ready();
        }
        Ok(job.status)
    }

    fn requeue_dead_letter(&mut self, job_id: &str) -> Result<String, PipelineError> {
        let mut failed = self
            .store
            .load_job(job_id)?
            .ok_or_else(|| PipelineError::JobNotFound(job_id.to_string()))?;

        if failed.status != JobStatus::Failed {
            return Err(PipelineError::InvalidState {
                job_id: job_id.to_string(),
                status: failed.status,
                expected: JobStatus::Failed,
            });
        }
        if failed.deletion_requested {
            return Err(PipelineError::Deleted(job_id.to_string()));
        }
        if let Some(requeued_as) = &failed.requeued_as {
            return Err(PipelineError::AlreadyRequeued {
                job_id: job_id.to_string(),
                requeued_as: requeued_as.clone(),
            });
        }

        let mut replacement = Job::new(
            uuid::Uuid::new_v4().to_string(),
            failed.owner.clone(),
            failed.upload.clone(),
        );
        replacement.stage = failed.stage;
        replacement.results = failed.results.clone();
        replacement.artifacts = failed.artifacts.clone();
        replacement.requeued_from = Some(failed.id.clone());
        self.persist(&mut replacement)?;

        // Artifact ownership moves to the replacement with this link
        failed.requeued_as = Some(replacement.id.clone());
        self.persist(&mut failed)?;

        metrics::record_job_transition(JobStatus::Queued.as_str());
        if let Err(e) = self.audit.log_requeued(&failed, &replacement) {
            warn!("Failed to log requeue of job {}: {}", failed.id, e);
        }
        info!(
            job_id = %failed.id,
            requeued_as = %replacement.id,
            stage = %replacement.stage,
            "Dead-lettered job requeued"
        );

        let id = replacement.id.clone();
        self.dispatch_ready();
        Ok(id)
    }

    /// Dispatch ready jobs into free execution slots, oldest first.
    fn dispatch_ready(&mut self) {
        self.requeue_stranded();

        let free = self.capacity.saturating_sub(self.in_flight.len());
        if free == 0 {
            return;
        }

        let now = chrono::Utc::now().timestamp();
        let jobs = match self.store.list_ready_jobs(now, free) {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("Failed to list ready jobs: {:#}", e);
                return;
            }
        };

        for mut job in jobs {
            let previous = job.status;
            job.status = JobStatus::Running;
            job.next_retry_at = None;
            if let Err(e) = self.persist(&mut job) {
                error!("Failed to mark job {} running: {:#}", job.id, e);
                continue;
            }
            if previous != JobStatus::Running {
                metrics::record_job_transition(JobStatus::Running.as_str());
            }
            self.enqueue(job);
        }
    }

    /// Hand the job's current stage to the worker pool. The job must already
    /// be persisted as RUNNING at that stage.
    fn enqueue(&mut self, job: Job) {
        if let Err(e) = self.audit.log_stage_started(&job) {
            warn!("Failed to log stage start of job {}: {}", job.id, e);
        }

        let cancel = self.shutdown_token.child_token();
        let input = StageInput {
            job_id: job.id.clone(),
            stage: job.stage,
            attempt: job.current_attempts() + 1,
            upload: job.upload.clone(),
            prior: job.results,
        };
        debug!(
            job_id = %job.id,
            stage = %job.stage,
            attempt = input.attempt,
            "Dispatching stage"
        );

        self.in_flight.insert(
            job.id.clone(),
            InFlight {
                stage: job.stage,
                cancel: cancel.clone(),
            },
        );
        if self.work_tx.send(WorkUnit { input, cancel }).is_err() {
            // Left RUNNING; recovered on the next start
            error!("Worker pool is gone, cannot dispatch job {}", job.id);
            self.in_flight.remove(&job.id);
        }
    }

    fn handle_outcome(&mut self, outcome: StageOutcome) {
        let expected = matches!(
            self.in_flight.get(&outcome.job_id),
            Some(flight) if flight.stage == outcome.stage
        );
        if expected {
            self.in_flight.remove(&outcome.job_id);
        }

        let job = match self.store.load_job(&outcome.job_id) {
            Ok(job) => job,
            Err(e) => {
                error!("Failed to load job {}: {:#}", outcome.job_id, e);
                if expected {
                    self.stranded.insert(outcome.job_id.clone());
                }
                self.discard_outcome(None, outcome);
                return;
            }
        };

        let mut job = match job {
            Some(job) if expected && job.status == JobStatus::Running && job.stage == outcome.stage => job,
            other => {
                self.discard_outcome(other.as_ref(), outcome);
                return;
            }
        };

        match outcome.result {
            StageResult::Success(output) => {
                self.complete_stage(job, output, outcome.artifacts, outcome.duration);
            }
            StageResult::Failure(error) => self.fail_stage(&mut job, error),
            StageResult::Abandoned => {
                warn!(
                    "Stage {} of job {} was abandoned while the job was running",
                    outcome.stage, job.id
                );
            }
        }
    }

    /// Drop an outcome that no longer applies (job cancelled, deleted or moved on).
    fn discard_outcome(&self, job: Option<&Job>, outcome: StageOutcome) {
        let mut handles = outcome.artifacts;
        if let StageResult::Success(output) = &outcome.result {
            handles.extend(output.artifacts());
        }
        handles.sort();
        handles.dedup();

        let deleted = self.delete_handles(&handles);
        debug!(
            "Discarded {} outcome of job {} ({} artifacts deleted)",
            outcome.stage, outcome.job_id, deleted
        );
        if let Some(job) = job {
            if !matches!(outcome.result, StageResult::Abandoned) {
                if let Err(e) = self.audit.log_output_discarded(job, outcome.stage, deleted) {
                    warn!("Failed to log discarded output of job {}: {}", job.id, e);
                }
            }
        }
    }

    fn complete_stage(
        &mut self,
        mut job: Job,
        output: StageOutput,
        written: Vec<ArtifactHandle>,
        duration: Duration,
    ) {
        let stage = job.stage;
        let mut produced = output.artifacts();
        produced.extend(written.iter().cloned());
        job.artifacts.extend(written);
        job.results.insert(stage, output);
        job.last_error = None;

        match stage.next() {
            Some(next) => {
                job.stage = next;
                if let Err(e) = self.persist(&mut job) {
                    error!("Failed to persist completion of {} for job {}: {:#}", stage, job.id, e);
                    self.strand(&job.id, &produced);
                    return;
                }
                if let Err(e) = self.audit.log_stage_completed(&job, stage, duration) {
                    warn!("Failed to log stage completion of job {}: {}", job.id, e);
                }
                info!(job_id = %job.id, "Stage {} completed, advancing to {}", stage, next);
                self.enqueue(job);
            }
            None => {
                job.status = JobStatus::Done;
                job.completed_at = Some(chrono::Utc::now().timestamp());
                if let Err(e) = self.persist(&mut job) {
                    error!("Failed to persist completion of job {}: {:#}", job.id, e);
                    self.strand(&job.id, &produced);
                    return;
                }
                metrics::record_job_transition(JobStatus::Done.as_str());
                if let Err(e) = self
                    .audit
                    .log_stage_completed(&job, stage, duration)
                    .and_then(|_| self.audit.log_completed(&job))
                {
                    warn!("Failed to log completion of job {}: {}", job.id, e);
                }
                info!(job_id = %job.id, "Job completed");
            }
        }
    }

    fn fail_stage(&mut self, job: &mut Job, error: StageError) {
        let failed_attempts = {
            let attempts = job.attempts.entry(job.stage).or_insert(0);
            *attempts += 1;
            *attempts
        };

        if self.retry_policy.should_retry(&error, failed_attempts) {
            job.status = JobStatus::RetryWait;
            job.next_retry_at = Some(self.retry_policy.next_retry_at(failed_attempts));
            job.last_error = Some(error.clone());
            if let Err(e) = self.persist(job) {
                error!("Failed to persist retry of job {}: {:#}", job.id, e);
                self.strand(&job.id, &[]);
                return;
            }
            metrics::record_job_transition(JobStatus::RetryWait.as_str());
            if let Err(e) = self.audit.log_retry_scheduled(job, &error) {
                warn!("Failed to log retry of job {}: {}", job.id, e);
            }
            warn!(
                job_id = %job.id,
                stage = %job.stage,
                attempt = failed_attempts,
                "Stage failed ({}), retry in {}s",
                error,
                self.retry_policy.backoff_secs(failed_attempts)
            );
        } else {
            job.status = JobStatus::Failed;
            job.next_retry_at = None;
            job.completed_at = Some(chrono::Utc::now().timestamp());
            job.last_error = Some(error.clone());
            if let Err(e) = self.persist(job) {
                error!("Failed to persist failure of job {}: {:#}", job.id, e);
                self.strand(&job.id, &[]);
                return;
            }
            metrics::record_job_transition(JobStatus::Failed.as_str());
            if let Err(e) = self.audit.log_failed(job, &error) {
                warn!("Failed to log failure of job {}: {}", job.id, e);
            }
            error!(
                job_id = %job.id,
                stage = %job.stage,
                attempt = failed_attempts,
                "Job dead-lettered: {}",
                error
            );
        }
    }

    /// Remember a job whose outcome could not be persisted. Its stage output
    /// is dropped and the stage runs again once the job is re-queued.
    fn strand(&mut self, job_id: &str, produced: &[ArtifactHandle]) {
        let deleted = self.delete_handles(produced);
        warn!(
            job_id = %job_id,
            deleted,
            "Outcome not persisted, job will be re-queued"
        );
        self.stranded.insert(job_id.to_string());
    }

    /// Put stranded jobs back to QUEUED at their stored stage.
    fn requeue_stranded(&mut self) {
        if self.stranded.is_empty() {
            return;
        }
        let ids: Vec<String> = self.stranded.iter().cloned().collect();
        for job_id in ids {
            match self.store.load_job(&job_id) {
                Ok(Some(mut job))
                    if job.status == JobStatus::Running && !self.in_flight.contains_key(&job_id) =>
                {
                    job.status = JobStatus::Queued;
                    if let Err(e) = self.persist(&mut job) {
                        warn!("Failed to re-queue stranded job {}: {:#}", job_id, e);
                        continue;
                    }
                    info!(job_id = %job_id, stage = %job.stage, "Re-queued stranded job");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Failed to load stranded job {}: {:#}", job_id, e);
                    continue;
                }
            }
            self.stranded.remove(&job_id);
        }
    }

    /// How long to sleep before the next retry falls due.
    fn time_until_next_retry(&self) -> Duration {
        match self.store.next_retry_at() {
            Ok(Some(at)) => {
                let now = chrono::Utc::now().timestamp();
                if at <= now {
                    // Nothing can be dispatched until a slot frees up
                    if self.in_flight.len() >= self.capacity {
                        self.idle_poll_interval
                    } else {
                        Duration::ZERO
                    }
                } else {
                    Duration::from_secs((at - now) as u64).min(self.idle_poll_interval)
                }
            }
            Ok(None) => self.idle_poll_interval,
            Err(e) => {
                warn!("Failed to read next retry time: {:#}", e);
                self.idle_poll_interval
            }
        }
    }

    fn persist(&self, job: &mut Job) -> Result<()> {
        job.updated_at = chrono::Utc::now().timestamp();
        self.store.save_job(job)
    }

    /// Delete every artifact the job owns. Returns how many were deleted.
    fn purge_artifacts(&self, job: &Job) -> usize {
        let handles: Vec<ArtifactHandle> = job.owned_artifacts().into_iter().collect();
        self.delete_handles(&handles)
    }

    fn delete_handles(&self, handles: &[ArtifactHandle]) -> usize {
        let mut deleted = 0;
        for handle in handles {
            match self.artifacts.delete(handle) {
                Ok(()) => deleted += 1,
                Err(StorageError::NotFound(_)) => {}
                Err(e) => warn!("Failed to delete artifact {}: {}", handle, e),
            }
        }
        deleted
    }
}

/// A started pipeline: manager task, worker pool and a handle to both.
pub struct RunningPipeline {
    handle: PipelineHandle,
    manager: JoinHandle<()>,
    pool: StageWorkerPool,
}

impl RunningPipeline {
    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    /// Wait for the manager and all workers to stop. Cancel the shutdown
    /// token passed to [`start_pipeline`] first.
    pub async fn join(self) {
        if let Err(e) = self.manager.await {
            error!("Job manager task failed: {}", e);
        }
        self.pool.join().await;
    }
}

/// Wire up a job manager and worker pool and start them on the current runtime.
pub fn start_pipeline(
    store: Arc<dyn JobStore>,
    artifacts: Arc<dyn ArtifactStore>,
    registry: ProcessorRegistry,
    settings: &PipelineSettings,
    shutdown: CancellationToken,
) -> RunningPipeline {
    let missing = registry.missing_stages();
    if !missing.is_empty() {
        warn!(
            "No processor registered for {:?}; jobs reaching those stages will fail",
            missing
        );
    }

    let (work_tx, work_rx) = mpsc::unbounded_channel();
    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

    let pool = StageWorkerPool::spawn(
        settings.workers,
        work_rx,
        outcome_tx,
        Arc::new(registry),
        artifacts.clone(),
        settings.stage_timeouts.clone(),
        shutdown.clone(),
    );

    let manager = JobManager::new(
        store.clone(),
        artifacts,
        settings,
        work_tx,
        outcome_rx,
        command_rx,
        shutdown,
    );
    let manager = tokio::spawn(manager.run());

    RunningPipeline {
        handle: PipelineHandle::new(command_tx, store),
        manager,
        pool,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::job_store::SqliteJobStore;
    use crate::storage::MemoryArtifactStore;

    fn manager(
        store: Arc<dyn JobStore>,
        artifacts: Arc<MemoryArtifactStore>,
    ) -> (JobManager, mpsc::UnboundedReceiver<WorkUnit>) {
        manager_with_workers(store, artifacts, 2)
    }

    fn manager_with_workers(
        store: Arc<dyn JobStore>,
        artifacts: Arc<MemoryArtifactStore>,
        workers: usize,
    ) -> (JobManager, mpsc::UnboundedReceiver<WorkUnit>) {
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (_outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (_command_tx, command_rx) = mpsc::channel(1);
        let settings = PipelineSettings {
            workers,
            initial_backoff_secs: 0,
            ..Default::default()
        };
        let manager = JobManager::new(
            store,
            artifacts,
            &settings,
            work_tx,
            outcome_rx,
            command_rx,
            CancellationToken::new(),
        );
        (manager, work_rx)
    }

    fn outcome(job_id: &str, stage: Stage, result: StageResult) -> StageOutcome {
        StageOutcome {
            job_id: job_id.to_string(),
            stage,
            attempt: 1,
            result,
            artifacts: Vec::new(),
            duration: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_submit_dispatches_up_to_capacity() {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let (mut manager, mut work_rx) = manager(store.clone(), artifacts);

        let ids: Vec<String> = (0..3)
            .map(|i| {
                manager
                    .submit(format!("user-{i}"), ArtifactHandle::new(format!("up-{i}")))
                    .unwrap()
            })
            .collect();

        assert_eq!(manager.in_flight.len(), 2);
        assert_eq!(store.load_job(&ids[0]).unwrap().unwrap().status, JobStatus::Running);
        assert_eq!(store.load_job(&ids[1]).unwrap().unwrap().status, JobStatus::Running);
        assert_eq!(store.load_job(&ids[2]).unwrap().unwrap().status, JobStatus::Queued);

        let unit = work_rx.try_recv().unwrap();
        assert_eq!(unit.input.stage, Stage::Separation);
        assert_eq!(unit.input.attempt, 1);
    }

    #[test]
    fn test_success_persists_result_before_enqueueing_next_stage() {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let (mut manager, mut work_rx) = manager(store.clone(), artifacts);
        let id = manager.submit("user".into(), ArtifactHandle::new("up")).unwrap();
        work_rx.try_recv().unwrap();

        manager.handle_outcome(outcome(
            &id,
            Stage::Separation,
            StageResult::Success(StageOutput::Separation {
                stems: Default::default(),
            }),
        ));

        let job = store.load_job(&id).unwrap().unwrap();
        assert_eq!(job.stage, Stage::Tagging);
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.results.contains_key(&Stage::Separation));

        let next = work_rx.try_recv().unwrap();
        assert_eq!(next.input.stage, Stage::Tagging);
        assert!(next.input.prior.contains_key(&Stage::Separation));
    }

    #[test]
    fn test_transient_failure_then_dead_letter() {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let (mut manager, mut work_rx) = manager(store.clone(), artifacts);
        let id = manager.submit("user".into(), ArtifactHandle::new("up")).unwrap();

        for attempt in 1..=3u32 {
            let unit = work_rx.try_recv().unwrap();
            assert_eq!(unit.input.attempt, attempt);
            manager.handle_outcome(outcome(
                &id,
                Stage::Separation,
                StageResult::Failure(StageError::new(
                    crate::pipeline::StageErrorKind::ModelUnavailable,
                    "503",
                )),
            ));
            // Zero backoff: due immediately
            manager.dispatch_ready();
        }

        let job = store.load_job(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.current_attempts(), 3);
        assert!(work_rx.try_recv().is_err());
    }

    #[test]
    fn test_outcome_for_cancelled_job_is_discarded() {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let upload = artifacts.put(b"clip").unwrap();
        let (mut manager, mut work_rx) = manager(store.clone(), artifacts.clone());
        let id = manager.submit("user".into(), upload.clone()).unwrap();
        let unit = work_rx.try_recv().unwrap();

        assert_eq!(manager.request_deletion(&id).unwrap(), JobStatus::Cancelled);
        assert!(unit.cancel.is_cancelled());
        assert!(!artifacts.exists(&upload));

        let late_stem = artifacts.put(b"stem").unwrap();
        let mut late = outcome(
            &id,
            Stage::Separation,
            StageResult::Success(StageOutput::Separation {
                stems: [("other".to_string(), late_stem.clone())].into_iter().collect(),
            }),
        );
        late.artifacts = vec![late_stem.clone()];
        manager.handle_outcome(late);

        let job = store.load_job(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.results.is_empty());
        assert!(!artifacts.exists(&late_stem));

        // Idempotent
        assert_eq!(manager.request_deletion(&id).unwrap(), JobStatus::Cancelled);
    }

    /// Fails the first save of a job that has advanced to `fail_at`.
    struct FlakyStore {
        inner: SqliteJobStore,
        fail_at: std::sync::Mutex<Option<Stage>>,
    }

    impl JobStore for FlakyStore {
        fn save_job(&self, job: &Job) -> Result<()> {
            let mut fail_at = self.fail_at.lock().unwrap();
            if *fail_at == Some(job.stage) {
                *fail_at = None;
                anyhow::bail!("database is locked");
            }
            self.inner.save_job(job)
        }
        fn load_job(&self, id: &str) -> Result<Option<Job>> {
            self.inner.load_job(id)
        }
        fn list_ready_jobs(&self, now: i64, limit: usize) -> Result<Vec<Job>> {
            self.inner.list_ready_jobs(now, limit)
        }
        fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
            self.inner.list_by_status(status)
        }
        fn list_for_owner(&self, owner: &str, limit: usize, offset: usize) -> Result<Vec<Job>> {
            self.inner.list_for_owner(owner, limit, offset)
        }
        fn next_retry_at(&self) -> Result<Option<i64>> {
            self.inner.next_retry_at()
        }
        fn log_event(&self, event: &crate::pipeline::JobEvent) -> Result<i64> {
            self.inner.log_event(event)
        }
        fn events_for_job(&self, job_id: &str) -> Result<Vec<crate::pipeline::JobEvent>> {
            self.inner.events_for_job(job_id)
        }
    }

    #[test]
    fn test_unpersisted_completion_requeues_stage() {
        let store = Arc::new(FlakyStore {
            inner: SqliteJobStore::in_memory().unwrap(),
            fail_at: std::sync::Mutex::new(Some(Stage::Tagging)),
        });
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let upload = artifacts.put(b"clip").unwrap();
        let (mut manager, mut work_rx) = manager(store.clone(), artifacts.clone());
        let id = manager.submit("user".into(), upload.clone()).unwrap();
        work_rx.try_recv().unwrap();

        let stem = artifacts.put(b"stem").unwrap();
        let mut done = outcome(
            &id,
            Stage::Separation,
            StageResult::Success(StageOutput::Separation {
                stems: [("other".to_string(), stem.clone())].into_iter().collect(),
            }),
        );
        done.artifacts = vec![stem.clone()];
        manager.handle_outcome(done);

        // The unrecorded output is gone and the stage is dispatched again
        assert!(!artifacts.exists(&stem));
        assert!(artifacts.exists(&upload));
        manager.dispatch_ready();

        let job = store.load_job(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.stage, Stage::Separation);
        assert!(job.results.is_empty());
        assert!(manager.in_flight.contains_key(&id));
        assert!(manager.stranded.is_empty());

        let unit = work_rx.try_recv().unwrap();
        assert_eq!(unit.input.stage, Stage::Separation);
    }

    #[test]
    fn test_deletion_frees_slot_for_queued_job() {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let (mut manager, mut work_rx) = manager_with_workers(store.clone(), artifacts, 1);
        let first = manager.submit("user".into(), ArtifactHandle::new("up-a")).unwrap();
        let second = manager.submit("user".into(), ArtifactHandle::new("up-b")).unwrap();
        assert_eq!(work_rx.try_recv().unwrap().input.job_id, first);
        assert_eq!(store.load_job(&second).unwrap().unwrap().status, JobStatus::Queued);

        manager.request_deletion(&first).unwrap();

        assert_eq!(store.load_job(&second).unwrap().unwrap().status, JobStatus::Running);
        assert!(manager.in_flight.contains_key(&second));
        assert_eq!(work_rx.try_recv().unwrap().input.job_id, second);
    }

    #[test]
    fn test_recover_requeues_running_jobs() {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let mut job = Job::new("j".into(), "user".into(), ArtifactHandle::new("up"));
        job.status = JobStatus::Running;
        job.stage = Stage::TempoKey;
        store.save_job(&job).unwrap();

        let (mut manager, _work_rx) = manager(store.clone(), Arc::new(MemoryArtifactStore::new()));
        assert_eq!(manager.recover().unwrap(), 1);

        let job = store.load_job("j").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.stage, Stage::TempoKey);
    }
}
