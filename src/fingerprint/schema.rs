//! Database schema for fingerprints.db.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

// =============================================================================
// Reference Tracks Table - Version 0
// =============================================================================

/// One row per reference track; landmarks are stored packed in a blob.
const REFERENCE_TRACKS_TABLE_V0: Table = Table {
    name: "reference_tracks",
    columns: &[
        sqlite_column!("track_id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("extractor_version", &SqlType::Integer, non_null = true),
        sqlite_column!("landmark_count", &SqlType::Integer, non_null = true),
        sqlite_column!("duration_secs", &SqlType::Real, non_null = true),
        sqlite_column!("landmarks", &SqlType::Blob, non_null = true),
        sqlite_column!("ingested_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_reference_tracks_version", "extractor_version")],
};

pub const FINGERPRINT_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[REFERENCE_TRACKS_TABLE_V0],
    migration: None,
}];
