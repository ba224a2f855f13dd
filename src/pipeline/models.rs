//! Data models for the analysis pipeline.
//!
//! Defines jobs, stages, statuses, stage results and error kinds.

use crate::fingerprint::MatchCandidate;
use crate::storage::ArtifactHandle;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

/// Analysis stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Separation,
    Tagging,
    TempoKey,
    FingerprintMatch,
    Report,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Separation,
        Stage::Tagging,
        Stage::TempoKey,
        Stage::FingerprintMatch,
        Stage::Report,
    ];

    pub fn first() -> Stage {
        Stage::Separation
    }

    /// The stage that runs after this one, or None for the last stage.
    pub fn next(&self) -> Option<Stage> {
        Stage::ALL.get(self.index() + 1).copied()
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn is_last(&self) -> bool {
        self.next().is_none()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Separation => "SEPARATION",
            Stage::Tagging => "TAGGING",
            Stage::TempoKey => "TEMPO_KEY",
            Stage::FingerprintMatch => "FINGERPRINT_MATCH",
            Stage::Report => "REPORT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "SEPARATION" => Some(Stage::Separation),
            "TAGGING" => Some(Stage::Tagging),
            "TEMPO_KEY" => Some(Stage::TempoKey),
            "FINGERPRINT_MATCH" => Some(Stage::FingerprintMatch),
            "REPORT" => Some(Stage::Report),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a job in the pipeline state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    RetryWait,
    Done,      // terminal
    Failed,    // terminal (dead letter)
    Cancelled, // terminal
}

impl JobStatus {
    /// Returns true if this is a terminal state (Done, Failed or Cancelled).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::RetryWait => "RETRY_WAIT",
            JobStatus::Done => "DONE",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(JobStatus::Queued),
            "RUNNING" => Some(JobStatus::Running),
            "RETRY_WAIT" => Some(JobStatus::RetryWait),
            "DONE" => Some(JobStatus::Done),
            "FAILED" => Some(JobStatus::Failed),
            "CANCELLED" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    Timeout,           // transient
    ResourceExhausted, // transient
    ModelUnavailable,  // transient
    MalformedInput,    // permanent
    UnsupportedCodec,  // permanent
    CorruptedStem,     // permanent
    Internal,          // permanent: processor crashed or is missing
}

impl StageErrorKind {
    /// Returns true if this error kind should trigger a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StageErrorKind::Timeout
                | StageErrorKind::ResourceExhausted
                | StageErrorKind::ModelUnavailable
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageErrorKind::Timeout => "timeout",
            StageErrorKind::ResourceExhausted => "resource_exhausted",
            StageErrorKind::ModelUnavailable => "model_unavailable",
            StageErrorKind::MalformedInput => "malformed_input",
            StageErrorKind::UnsupportedCodec => "unsupported_codec",
            StageErrorKind::CorruptedStem => "corrupted_stem",
            StageErrorKind::Internal => "internal",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "timeout" => Some(StageErrorKind::Timeout),
            "resource_exhausted" => Some(StageErrorKind::ResourceExhausted),
            "model_unavailable" => Some(StageErrorKind::ModelUnavailable),
            "malformed_input" => Some(StageErrorKind::MalformedInput),
            "unsupported_codec" => Some(StageErrorKind::UnsupportedCodec),
            "corrupted_stem" => Some(StageErrorKind::CorruptedStem),
            "internal" => Some(StageErrorKind::Internal),
            _ => None,
        }
    }

    /// User-facing explanation. Raw error messages are never shown to users.
    pub fn description(&self) -> &'static str {
        match self {
            StageErrorKind::Timeout => "The analysis step took too long to finish",
            StageErrorKind::ResourceExhausted => "The analysis service was out of capacity",
            StageErrorKind::ModelUnavailable => "The analysis model was unavailable",
            StageErrorKind::MalformedInput => "The uploaded audio could not be read",
            StageErrorKind::UnsupportedCodec => "The audio format is not supported",
            StageErrorKind::CorruptedStem => "An intermediate audio track was damaged",
            StageErrorKind::Internal => "An internal error occurred",
        }
    }
}

impl fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed stage execution.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct StageError {
    pub kind: StageErrorKind,
    pub message: String,
}

impl StageError {
    pub fn new(kind: StageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentTag {
    pub label: String,
    pub confidence: f32,
}

/// Result of a successful stage. One variant per stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageOutput {
    Separation {
        /// Stem name ("drums", "bass", "vocals", "other", ...) to audio.
        stems: BTreeMap<String, ArtifactHandle>,
    },
    Tagging {
        tags: Vec<InstrumentTag>,
    },
    TempoKey {
        bpm: f32,
        key: String,
        confidence: f32,
    },
    Fingerprint {
        candidates: Vec<MatchCandidate>,
        query_landmarks: usize,
    },
    Report {
        report: ArtifactHandle,
    },
}

impl StageOutput {
    /// The stage that produces this kind of result.
    pub fn stage(&self) -> Stage {
        match self {
            StageOutput::Separation { .. } => Stage::Separation,
            StageOutput::Tagging { .. } => Stage::Tagging,
            StageOutput::TempoKey { .. } => Stage::TempoKey,
            StageOutput::Fingerprint { .. } => Stage::FingerprintMatch,
            StageOutput::Report { .. } => Stage::Report,
        }
    }

    /// Artifact handles referenced by this result.
    pub fn artifacts(&self) -> Vec<ArtifactHandle> {
        match self {
            StageOutput::Separation { stems } => stems.values().cloned().collect(),
            StageOutput::Report { report } => vec![report.clone()],
            _ => Vec::new(),
        }
    }
}

/// An analysis job for one uploaded clip.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Unique identifier (UUID)
    pub id: String,
    /// Owner reference (user id)
    pub owner: String,
    /// The uploaded clip
    pub upload: ArtifactHandle,
    /// When the job was created (Unix timestamp)
    pub created_at: i64,
    /// Last time the record was written
    pub updated_at: i64,
    /// When the job reached a terminal state
    pub completed_at: Option<i64>,
    /// Current (or failing) stage
    pub stage: Stage,
    /// Current status in the state machine
    pub status: JobStatus,
    /// Failed attempts per stage
    pub attempts: BTreeMap<Stage, u32>,
    /// Durable results of completed stages
    pub results: BTreeMap<Stage, StageOutput>,
    /// Every artifact written on behalf of this job (besides the upload)
    pub artifacts: BTreeSet<ArtifactHandle>,
    /// Last stage failure
    pub last_error: Option<StageError>,
    /// When to retry (for RETRY_WAIT status)
    pub next_retry_at: Option<i64>,
    pub deletion_requested: bool,
    /// Dead-lettered job this one was requeued from
    pub requeued_from: Option<String>,
    /// Job created when this dead-lettered job was requeued
    pub requeued_as: Option<String>,
}

impl Job {
    /// Create a new job at the first stage.
    pub fn new(id: String, owner: String, upload: ArtifactHandle) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id,
            owner,
            upload,
            created_at: now,
            updated_at: now,
            completed_at: None,
            stage: Stage::first(),
            status: JobStatus::Queued,
            attempts: BTreeMap::new(),
            results: BTreeMap::new(),
            artifacts: BTreeSet::new(),
            last_error: None,
            next_retry_at: None,
            deletion_requested: false,
            requeued_from: None,
            requeued_as: None,
        }
    }

    /// Failed attempts of the current stage.
    pub fn current_attempts(&self) -> u32 {
        self.attempts.get(&self.stage).copied().unwrap_or(0)
    }

    /// Artifacts this job is responsible for deleting.
    ///
    /// A requeued dead-letter job hands everything over to its successor.
    pub fn owned_artifacts(&self) -> BTreeSet<ArtifactHandle> {
        if self.requeued_as.is_some() {
            return BTreeSet::new();
        }
        let mut owned = self.artifacts.clone();
        owned.insert(self.upload.clone());
        for output in self.results.values() {
            owned.extend(output.artifacts());
        }
        owned
    }

    pub fn fingerprint_matches(&self) -> Option<&[MatchCandidate]> {
        match self.results.get(&Stage::FingerprintMatch) {
            Some(StageOutput::Fingerprint { candidates, .. }) => Some(candidates),
            _ => None,
        }
    }
}

/// Failure details safe to show to the job owner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureView {
    pub stage: Stage,
    pub kind: StageErrorKind,
    pub description: String,
}

/// User-facing projection of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub id: String,
    pub status: JobStatus,
    /// Hidden for cancelled jobs
    pub stage: Option<Stage>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub completed_stages: Vec<Stage>,
    pub failure: Option<FailureView>,
    pub fingerprint_matches: Option<Vec<MatchCandidate>>,
    pub requeued_as: Option<String>,
}

impl JobView {
    pub fn from_job(job: &Job) -> Self {
        if job.status == JobStatus::Cancelled {
            return Self {
                id: job.id.clone(),
                status: JobStatus::Cancelled,
                stage: None,
                created_at: job.created_at,
                completed_at: job.completed_at,
                completed_stages: Vec::new(),
                failure: None,
                fingerprint_matches: None,
                requeued_as: None,
            };
        }

        let failure = match (job.status, &job.last_error) {
            (JobStatus::Failed, Some(error)) => Some(FailureView {
                stage: job.stage,
                kind: error.kind,
                description: error.kind.description().to_string(),
            }),
            _ => None,
        };

        Self {
            id: job.id.clone(),
            status: job.status,
            stage: Some(job.stage),
            created_at: job.created_at,
            completed_at: job.completed_at,
            completed_stages: job.results.keys().copied().collect(),
            failure,
            fingerprint_matches: job.fingerprint_matches().map(|m| m.to_vec()),
            requeued_as: job.requeued_as.clone(),
        }
    }
}

/// Type of a job audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobEventType {
    Submitted,
    StageStarted,
    StageCompleted,
    RetryScheduled,
    Failed,
    Completed,
    Cancelled,
    DeletionRequested,
    Requeued,
    Recovered,
    OutputDiscarded,
}

impl JobEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventType::Submitted => "SUBMITTED",
            JobEventType::StageStarted => "STAGE_STARTED",
            JobEventType::StageCompleted => "STAGE_COMPLETED",
            JobEventType::RetryScheduled => "RETRY_SCHEDULED",
            JobEventType::Failed => "FAILED",
            JobEventType::Completed => "COMPLETED",
            JobEventType::Cancelled => "CANCELLED",
            JobEventType::DeletionRequested => "DELETION_REQUESTED",
            JobEventType::Requeued => "REQUEUED",
            JobEventType::Recovered => "RECOVERED",
            JobEventType::OutputDiscarded => "OUTPUT_DISCARDED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "SUBMITTED" => Some(JobEventType::Submitted),
            "STAGE_STARTED" => Some(JobEventType::StageStarted),
            "STAGE_COMPLETED" => Some(JobEventType::StageCompleted),
            "RETRY_SCHEDULED" => Some(JobEventType::RetryScheduled),
            "FAILED" => Some(JobEventType::Failed),
            "COMPLETED" => Some(JobEventType::Completed),
            "CANCELLED" => Some(JobEventType::Cancelled),
            "DELETION_REQUESTED" => Some(JobEventType::DeletionRequested),
            "REQUEUED" => Some(JobEventType::Requeued),
            "RECOVERED" => Some(JobEventType::Recovered),
            "OUTPUT_DISCARDED" => Some(JobEventType::OutputDiscarded),
            _ => None,
        }
    }
}

/// One row of the job audit log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    /// Assigned by the store
    pub id: Option<i64>,
    pub job_id: String,
    pub event_type: JobEventType,
    pub stage: Stage,
    pub status: JobStatus,
    pub attempt: u32,
    pub error_kind: Option<StageErrorKind>,
    pub details: Option<serde_json::Value>,
    pub created_at: i64,
}

impl JobEvent {
    /// Snapshot an event from the job's current state.
    pub fn for_job(job: &Job, event_type: JobEventType) -> Self {
        Self {
            id: None,
            job_id: job.id.clone(),
            event_type,
            stage: job.stage,
            status: job.status,
            attempt: job.current_attempts(),
            error_kind: None,
            details: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_error(mut self, kind: StageErrorKind) -> Self {
        self.error_kind = Some(kind);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}
