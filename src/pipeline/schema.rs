//! Database schema for pipeline.db.
//!
//! Jobs carry their per-stage attempt counters, stage results and owned
//! artifact handles as JSON columns; they are only ever read back whole.

use crate::sqlite_column;
use crate::sqlite_persistence::{
    Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema,
};

// =============================================================================
// Jobs Table - Version 0
// =============================================================================

const JOBS_TABLE_V0: Table = Table {
    name: "jobs",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("owner", &SqlType::Text, non_null = true),
        sqlite_column!("upload_handle", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("stage", &SqlType::Text, non_null = true),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
        sqlite_column!("completed_at", &SqlType::Integer),
        sqlite_column!("next_retry_at", &SqlType::Integer),
        sqlite_column!("attempts", &SqlType::Text, non_null = true, default_value = Some("'{}'")),
        sqlite_column!("results", &SqlType::Text, non_null = true, default_value = Some("'{}'")),
        sqlite_column!("artifacts", &SqlType::Text, non_null = true, default_value = Some("'[]'")),
        sqlite_column!("error_kind", &SqlType::Text),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!(
            "deletion_requested",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("requeued_from", &SqlType::Text),
        sqlite_column!("requeued_as", &SqlType::Text),
    ],
    indices: &[
        ("idx_jobs_status", "status"),
        ("idx_jobs_owner", "owner"),
        ("idx_jobs_next_retry", "next_retry_at"),
    ],
};

// =============================================================================
// Job Events Table (Audit Log) - Version 0
// =============================================================================

const JOB_EVENTS_TABLE_V0: Table = Table {
    name: "job_events",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "job_id",
            &SqlType::Text,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "jobs",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!("event_type", &SqlType::Text, non_null = true),
        sqlite_column!("stage", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("attempt", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("error_kind", &SqlType::Text),
        sqlite_column!("details", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[
        ("idx_job_events_job", "job_id"),
        ("idx_job_events_created", "created_at"),
    ],
};

pub const PIPELINE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[JOBS_TABLE_V0, JOB_EVENTS_TABLE_V0],
    migration: None,
}];
