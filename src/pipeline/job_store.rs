//! Persistent storage for analysis jobs and their audit log.

use super::models::{Job, JobEvent, JobEventType, JobStatus, Stage, StageError, StageErrorKind};
use super::schema::PIPELINE_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::{open_in_memory, open_versioned};
use crate::storage::ArtifactHandle;
use anyhow::{Context, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Storage interface for pipeline jobs.
///
/// The job manager is the only writer of job records; everything else reads.
pub trait JobStore: Send + Sync {
    // === Jobs ===

    /// Insert the job or overwrite the stored record with the same id.
    fn save_job(&self, job: &Job) -> Result<()>;

    fn load_job(&self, id: &str) -> Result<Option<Job>>;

    /// Up to `limit` QUEUED jobs plus RETRY_WAIT jobs whose retry time is at
    /// or before `now`, oldest first.
    fn list_ready_jobs(&self, now: i64, limit: usize) -> Result<Vec<Job>>;

    fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>>;

    /// Jobs of one owner, newest first.
    fn list_for_owner(&self, owner: &str, limit: usize, offset: usize) -> Result<Vec<Job>>;

    /// Earliest scheduled retry among RETRY_WAIT jobs.
    fn next_retry_at(&self) -> Result<Option<i64>>;

    // === Audit Log ===

    /// Append an event, returning its id.
    fn log_event(&self, event: &JobEvent) -> Result<i64>;

    /// Events of one job in insertion order.
    fn events_for_job(&self, job_id: &str) -> Result<Vec<JobEvent>>;
}

pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path.as_ref(), PIPELINE_VERSIONED_SCHEMAS, "pipeline")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(open_in_memory(PIPELINE_VERSIONED_SCHEMAS)?)),
        })
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let last_error = match row.get::<_, Option<String>>("error_kind")? {
            Some(kind) => Some(StageError {
                kind: StageErrorKind::from_str(&kind)
                    .ok_or_else(|| conversion_error("error_kind", &kind))?,
                message: row
                    .get::<_, Option<String>>("error_message")?
                    .unwrap_or_default(),
            }),
            None => None,
        };

        let status: String = row.get("status")?;
        let stage: String = row.get("stage")?;

        Ok(Job {
            id: row.get("id")?,
            owner: row.get("owner")?,
            upload: ArtifactHandle::new(row.get::<_, String>("upload_handle")?),
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            completed_at: row.get("completed_at")?,
            stage: Stage::from_str(&stage).ok_or_else(|| conversion_error("stage", &stage))?,
            status: JobStatus::from_str(&status)
                .ok_or_else(|| conversion_error("status", &status))?,
            attempts: json_column(row, "attempts")?,
            results: json_column(row, "results")?,
            artifacts: json_column(row, "artifacts")?,
            last_error,
            next_retry_at: row.get("next_retry_at")?,
            deletion_requested: row.get::<_, i64>("deletion_requested")? != 0,
            requeued_from: row.get("requeued_from")?,
            requeued_as: row.get("requeued_as")?,
        })
    }

    fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<JobEvent> {
        let event_type: String = row.get("event_type")?;
        let stage: String = row.get("stage")?;
        let status: String = row.get("status")?;
        let details = match row.get::<_, Option<String>>("details")? {
            Some(raw) => Some(
                serde_json::from_str(&raw)
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?,
            ),
            None => None,
        };

        Ok(JobEvent {
            id: Some(row.get("id")?),
            job_id: row.get("job_id")?,
            event_type: JobEventType::from_str(&event_type)
                .ok_or_else(|| conversion_error("event_type", &event_type))?,
            stage: Stage::from_str(&stage).ok_or_else(|| conversion_error("stage", &stage))?,
            status: JobStatus::from_str(&status)
                .ok_or_else(|| conversion_error("status", &status))?,
            attempt: row.get("attempt")?,
            error_kind: row
                .get::<_, Option<String>>("error_kind")?
                .and_then(|s| StageErrorKind::from_str(&s)),
            details,
            created_at: row.get("created_at")?,
        })
    }

    fn query_jobs<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Job>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(sql)?;
        let jobs = stmt
            .query_map(params, Self::row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }
}

fn conversion_error(column: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        Type::Text,
        format!("Invalid {} value: {}", column, value).into(),
    )
}

fn json_column<T: DeserializeOwned>(row: &rusqlite::Row, column: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
}

impl JobStore for SqliteJobStore {
    fn save_job(&self, job: &Job) -> Result<()> {
        let attempts = serde_json::to_string(&job.attempts)?;
        let results = serde_json::to_string(&job.results)?;
        let artifacts = serde_json::to_string(&job.artifacts)?;

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        // Upsert rather than REPLACE: a delete would cascade to job_events
        conn.execute(
            "INSERT INTO jobs (
                id, owner, upload_handle, status, stage, created_at, updated_at,
                completed_at, next_retry_at, attempts, results, artifacts,
                error_kind, error_message, deletion_requested, requeued_from, requeued_as
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            ON CONFLICT(id) DO UPDATE SET
                owner = excluded.owner,
                upload_handle = excluded.upload_handle,
                status = excluded.status,
                stage = excluded.stage,
                updated_at = excluded.updated_at,
                completed_at = excluded.completed_at,
                next_retry_at = excluded.next_retry_at,
                attempts = excluded.attempts,
                results = excluded.results,
                artifacts = excluded.artifacts,
                error_kind = excluded.error_kind,
                error_message = excluded.error_message,
                deletion_requested = excluded.deletion_requested,
                requeued_from = excluded.requeued_from,
                requeued_as = excluded.requeued_as",
            params![
                job.id,
                job.owner,
                job.upload.as_str(),
                job.status.as_str(),
                job.stage.as_str(),
                job.created_at,
                job.updated_at,
                job.completed_at,
                job.next_retry_at,
                attempts,
                results,
                artifacts,
                job.last_error.as_ref().map(|e| e.kind.as_str()),
                job.last_error.as_ref().map(|e| e.message.as_str()),
                job.deletion_requested as i64,
                job.requeued_from,
                job.requeued_as,
            ],
        )
        .with_context(|| format!("Failed to save job {}", job.id))?;
        Ok(())
    }

    fn load_job(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let job = conn
            .query_row(
                "SELECT * FROM jobs WHERE id = ?1",
                params![id],
                Self::row_to_job,
            )
            .optional()
            .with_context(|| format!("Failed to load job {}", id))?;
        Ok(job)
    }

    fn list_ready_jobs(&self, now: i64, limit: usize) -> Result<Vec<Job>> {
        self.query_jobs(
            "SELECT * FROM jobs
             WHERE status = 'QUEUED'
                OR (status = 'RETRY_WAIT' AND next_retry_at <= ?1)
             ORDER BY created_at ASC, id ASC
             LIMIT ?2",
            params![now, limit as i64],
        )
    }

    fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        self.query_jobs(
            "SELECT * FROM jobs WHERE status = ?1 ORDER BY created_at ASC, id ASC",
            params![status.as_str()],
        )
    }

    fn list_for_owner(&self, owner: &str, limit: usize, offset: usize) -> Result<Vec<Job>> {
        self.query_jobs(
            "SELECT * FROM jobs WHERE owner = ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2 OFFSET ?3",
            params![owner, limit as i64, offset as i64],
        )
    }

    fn next_retry_at(&self) -> Result<Option<i64>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let next = conn.query_row(
            "SELECT MIN(next_retry_at) FROM jobs WHERE status = 'RETRY_WAIT'",
            [],
            |row| row.get::<_, Option<i64>>(0),
        )?;
        Ok(next)
    }

    fn log_event(&self, event: &JobEvent) -> Result<i64> {
        let details = event
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO job_events
                (job_id, event_type, stage, status, attempt, error_kind, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.job_id,
                event.event_type.as_str(),
                event.stage.as_str(),
                event.status.as_str(),
                event.attempt,
                event.error_kind.map(|k| k.as_str()),
                details,
                event.created_at,
            ],
        )
        .with_context(|| format!("Failed to log event for job {}", event.job_id))?;
        Ok(conn.last_insert_rowid())
    }

    fn events_for_job(&self, job_id: &str) -> Result<Vec<JobEvent>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare("SELECT * FROM job_events WHERE job_id = ?1 ORDER BY id ASC")?;
        let events = stmt
            .query_map(params![job_id], Self::row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::models::{InstrumentTag, StageOutput};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn job(id: &str, created_at: i64) -> Job {
        let mut job = Job::new(id.to_string(), "user-1".to_string(), ArtifactHandle::new(format!("upload-{id}")));
        job.created_at = created_at;
        job.updated_at = created_at;
        job
    }

    #[test]
    fn test_save_and_load_round_trips_all_fields() {
        let store = SqliteJobStore::in_memory().unwrap();
        let mut original = job("a", 100);
        let mut stems = BTreeMap::new();
        stems.insert("drums".to_string(), ArtifactHandle::new("stem-drums"));
        original
            .results
            .insert(Stage::Separation, StageOutput::Separation { stems });
        original.results.insert(
            Stage::Tagging,
            StageOutput::Tagging {
                tags: vec![InstrumentTag {
                    label: "guitar".to_string(),
                    confidence: 0.5,
                }],
            },
        );
        original.artifacts.insert(ArtifactHandle::new("stem-drums"));
        original.stage = Stage::TempoKey;
        original.status = JobStatus::RetryWait;
        original.attempts.insert(Stage::TempoKey, 2);
        original.last_error = Some(StageError::new(StageErrorKind::Timeout, "slow model"));
        original.next_retry_at = Some(150);
        original.requeued_from = Some("older".to_string());

        store.save_job(&original).unwrap();
        let loaded = store.load_job("a").unwrap().unwrap();
        assert_eq!(loaded, original);
        assert!(store.load_job("missing").unwrap().is_none());
    }

    #[test]
    fn test_save_overwrites_without_dropping_events() {
        let store = SqliteJobStore::in_memory().unwrap();
        let mut j = job("a", 100);
        store.save_job(&j).unwrap();
        store
            .log_event(&JobEvent::for_job(&j, JobEventType::Submitted))
            .unwrap();

        j.status = JobStatus::Running;
        store.save_job(&j).unwrap();

        assert_eq!(store.load_job("a").unwrap().unwrap().status, JobStatus::Running);
        assert_eq!(store.events_for_job("a").unwrap().len(), 1);
    }

    #[test]
    fn test_list_ready_jobs() {
        let store = SqliteJobStore::in_memory().unwrap();

        let queued = job("queued", 10);
        let mut due = job("due", 5);
        due.status = JobStatus::RetryWait;
        due.next_retry_at = Some(1000);
        let mut later = job("later", 1);
        later.status = JobStatus::RetryWait;
        later.next_retry_at = Some(2000);
        let mut running = job("running", 1);
        running.status = JobStatus::Running;

        for j in [&queued, &due, &later, &running] {
            store.save_job(j).unwrap();
        }

        let ids: Vec<String> = store
            .list_ready_jobs(1500, 10)
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec!["due", "queued"]);
        assert_eq!(store.list_ready_jobs(1500, 1).unwrap().len(), 1);
        assert_eq!(store.next_retry_at().unwrap(), Some(1000));
        assert_eq!(store.list_by_status(JobStatus::Running).unwrap().len(), 1);
    }

    #[test]
    fn test_list_for_owner_newest_first() {
        let store = SqliteJobStore::in_memory().unwrap();
        store.save_job(&job("old", 1)).unwrap();
        store.save_job(&job("new", 2)).unwrap();
        let mut other = job("other", 3);
        other.owner = "user-2".to_string();
        store.save_job(&other).unwrap();

        let ids: Vec<String> = store
            .list_for_owner("user-1", 10, 0)
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec!["new", "old"]);
        assert_eq!(store.list_for_owner("user-1", 1, 1).unwrap()[0].id, "old");
    }

    #[test]
    fn test_events_round_trip() {
        let store = SqliteJobStore::in_memory().unwrap();
        let j = job("a", 1);
        store.save_job(&j).unwrap();

        let event = JobEvent::for_job(&j, JobEventType::RetryScheduled)
            .with_error(StageErrorKind::ModelUnavailable)
            .with_details(serde_json::json!({ "backoff_secs": 5 }));
        let id = store.log_event(&event).unwrap();

        let events = store.events_for_job("a").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, Some(id));
        assert_eq!(events[0].event_type, JobEventType::RetryScheduled);
        assert_eq!(events[0].error_kind, Some(StageErrorKind::ModelUnavailable));
        assert_eq!(events[0].details, event.details);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pipeline.db");
        {
            let store = SqliteJobStore::new(&path).unwrap();
            store.save_job(&job("a", 1)).unwrap();
        }
        let store = SqliteJobStore::new(&path).unwrap();
        assert!(store.load_job("a").unwrap().is_some());
    }
}
