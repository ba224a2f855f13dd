//! Fixed-size pool of stage workers.
//!
//! Workers pull [`WorkUnit`]s from a shared channel, run the matching
//! processor on a blocking thread under the stage timeout and report a
//! [`StageOutcome`] back to the job manager. Workers never touch job records.

use super::models::{Stage, StageError, StageErrorKind, StageOutput};
use super::processor::{ProcessorContext, ProcessorRegistry, ScopedArtifactStore, StageInput};
use crate::config::StageTimeouts;
use crate::metrics;
use crate::storage::{ArtifactHandle, ArtifactStore};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One stage execution handed to the pool.
#[derive(Debug)]
pub struct WorkUnit {
    pub input: StageInput,
    /// Cancelled by the manager when the job is cancelled.
    pub cancel: CancellationToken,
}

#[derive(Debug)]
pub enum StageResult {
    Success(StageOutput),
    Failure(StageError),
    /// Cancelled before the processor returned; carries no result.
    Abandoned,
}

/// Report sent back to the manager for every work unit.
#[derive(Debug)]
pub struct StageOutcome {
    pub job_id: String,
    pub stage: Stage,
    pub attempt: u32,
    pub result: StageResult,
    /// Artifacts the processor wrote. Empty unless the stage succeeded;
    /// everything written by a failed or abandoned execution is deleted.
    pub artifacts: Vec<ArtifactHandle>,
    pub duration: Duration,
}

struct WorkerShared {
    registry: Arc<ProcessorRegistry>,
    artifacts: Arc<dyn ArtifactStore>,
    timeouts: StageTimeouts,
    outcome_tx: mpsc::UnboundedSender<StageOutcome>,
    in_flight: AtomicUsize,
}

pub struct StageWorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl StageWorkerPool {
    /// Spawn `worker_count` workers. They stop when `shutdown` is cancelled or
    /// the work channel closes.
    pub fn spawn(
        worker_count: usize,
        work_rx: mpsc::UnboundedReceiver<WorkUnit>,
        outcome_tx: mpsc::UnboundedSender<StageOutcome>,
        registry: Arc<ProcessorRegistry>,
        artifacts: Arc<dyn ArtifactStore>,
        timeouts: StageTimeouts,
        shutdown: CancellationToken,
    ) -> Self {
        let shared = Arc::new(WorkerShared {
            registry,
            artifacts,
            timeouts,
            outcome_tx,
            in_flight: AtomicUsize::new(0),
        });
        let receiver = Arc::new(Mutex::new(work_rx));

        let workers = (0..worker_count.max(1))
            .map(|id| {
                tokio::spawn(run_worker(
                    id,
                    shared.clone(),
                    receiver.clone(),
                    shutdown.clone(),
                ))
            })
            .collect::<Vec<_>>();

        info!("Started {} stage workers", workers.len());
        Self { workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!("Stage worker exited abnormally: {}", e);
            }
        }
    }
}

async fn run_worker(
    id: usize,
    shared: Arc<WorkerShared>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<WorkUnit>>>,
    shutdown: CancellationToken,
) {
    debug!("Stage worker {} started", id);

    loop {
        let unit = {
            let mut rx = tokio::select! {
                guard = receiver.lock() => guard,
                _ = shutdown.cancelled() => break,
            };
            tokio::select! {
                unit = rx.recv() => unit,
                _ = shutdown.cancelled() => None,
            }
        };
        let Some(unit) = unit else {
            break;
        };

        let in_flight = shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_stages_in_flight(in_flight);

        let outcome = execute(&shared, unit).await;

        let in_flight = shared.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_stages_in_flight(in_flight);

        if shared.outcome_tx.send(outcome).is_err() {
            debug!("Outcome channel closed, stopping stage worker {}", id);
            break;
        }
    }

    debug!("Stage worker {} stopped", id);
}

async fn execute(shared: &WorkerShared, unit: WorkUnit) -> StageOutcome {
    let WorkUnit { input, cancel } = unit;
    let job_id = input.job_id.clone();
    let stage = input.stage;
    let attempt = input.attempt;
    let started = Instant::now();
    let scope = Arc::new(ScopedArtifactStore::new(shared.artifacts.clone()));

    debug!(job_id = %job_id, stage = %stage, attempt, "Executing stage");

    let result = match shared.registry.get(stage) {
        None => StageResult::Failure(StageError::new(
            StageErrorKind::Internal,
            format!("No processor registered for stage {}", stage),
        )),
        Some(processor) => {
            let ctx = ProcessorContext::new(cancel.clone(), scope.clone());
            let timeout = shared.timeouts.for_stage(stage);
            let task = tokio::task::spawn_blocking(move || {
                let output = processor.process(&ctx, &input)?;
                if output.stage() != input.stage {
                    return Err(StageError::new(
                        StageErrorKind::Internal,
                        format!(
                            "Processor for {} returned a {} result",
                            input.stage,
                            output.stage()
                        ),
                    ));
                }
                Ok(output)
            });

            tokio::select! {
                biased;
                joined = tokio::time::timeout(timeout, task) => match joined {
                    Ok(Ok(Ok(output))) => StageResult::Success(output),
                    Ok(Ok(Err(error))) => StageResult::Failure(error),
                    Ok(Err(join_error)) => StageResult::Failure(StageError::new(
                        StageErrorKind::Internal,
                        format!("Processor panicked: {}", join_error),
                    )),
                    Err(_) => {
                        // Ask the processor to stop; its late writes are refused
                        cancel.cancel();
                        StageResult::Failure(StageError::new(
                            StageErrorKind::Timeout,
                            format!("Stage {} exceeded {:?}", stage, timeout),
                        ))
                    }
                },
                _ = cancel.cancelled() => StageResult::Abandoned,
            }
        }
    };

    let artifacts = match &result {
        StageResult::Success(_) => scope.created(),
        _ => {
            scope.abandon();
            Vec::new()
        }
    };

    let duration = started.elapsed();
    let outcome_label = match &result {
        StageResult::Success(_) => "success",
        StageResult::Failure(error) => error.kind.as_str(),
        StageResult::Abandoned => "abandoned",
    };
    metrics::record_stage_execution(stage.as_str(), outcome_label, duration);
    debug!(
        job_id = %job_id,
        stage = %stage,
        outcome = outcome_label,
        duration_ms = duration.as_millis() as u64,
        "Stage execution finished"
    );

    StageOutcome {
        job_id,
        stage,
        attempt,
        result,
        artifacts,
        duration,
    }
}
