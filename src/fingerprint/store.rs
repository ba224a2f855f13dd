//! Persistent storage for reference fingerprints.
//!
//! The in-memory index is rebuilt from this store at startup.

use super::extractor::Landmark;
use super::schema::FINGERPRINT_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::{open_in_memory, open_versioned};
use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Metadata of an ingested reference track.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceTrack {
    pub track_id: String,
    pub extractor_version: u32,
    pub landmark_count: usize,
    pub duration_secs: f64,
    /// Unix timestamp.
    pub ingested_at: i64,
}

pub trait ReferenceStore: Send + Sync {
    /// Insert or replace a track and its landmarks in one transaction.
    fn save_track(&self, track: &ReferenceTrack, landmarks: &[Landmark]) -> Result<()>;

    fn load_track(&self, track_id: &str) -> Result<Option<(ReferenceTrack, Vec<Landmark>)>>;

    /// All tracks, ordered by id.
    fn list_tracks(&self) -> Result<Vec<ReferenceTrack>>;

    /// Returns false if the track did not exist.
    fn delete_track(&self, track_id: &str) -> Result<bool>;
}

pub struct SqliteReferenceStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteReferenceStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned(db_path.as_ref(), FINGERPRINT_VERSIONED_SCHEMAS, "fingerprint")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(open_in_memory(FINGERPRINT_VERSIONED_SCHEMAS)?)),
        })
    }

    fn row_to_track(row: &rusqlite::Row) -> rusqlite::Result<ReferenceTrack> {
        Ok(ReferenceTrack {
            track_id: row.get("track_id")?,
            extractor_version: row.get("extractor_version")?,
            landmark_count: row.get::<_, i64>("landmark_count")? as usize,
            duration_secs: row.get("duration_secs")?,
            ingested_at: row.get("ingested_at")?,
        })
    }
}

/// Landmarks are stored as little-endian `(hash, anchor_frame)` u32 pairs.
fn encode_landmarks(landmarks: &[Landmark]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(landmarks.len() * 8);
    for lm in landmarks {
        bytes.extend_from_slice(&lm.hash.to_le_bytes());
        bytes.extend_from_slice(&lm.anchor_frame.to_le_bytes());
    }
    bytes
}

fn decode_landmarks(bytes: &[u8]) -> Result<Vec<Landmark>> {
    if bytes.len() % 8 != 0 {
        bail!("Landmark blob length {} is not a multiple of 8", bytes.len());
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| Landmark {
            hash: u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
            anchor_frame: u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]),
        })
        .collect())
}

impl ReferenceStore for SqliteReferenceStore {
    fn save_track(&self, track: &ReferenceTrack, landmarks: &[Landmark]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO reference_tracks
                (track_id, extractor_version, landmark_count, duration_secs, landmarks, ingested_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                track.track_id,
                track.extractor_version,
                landmarks.len() as i64,
                track.duration_secs,
                encode_landmarks(landmarks),
                track.ingested_at,
            ],
        )
        .with_context(|| format!("Failed to save reference track {}", track.track_id))?;
        tx.commit()?;
        Ok(())
    }

    fn load_track(&self, track_id: &str) -> Result<Option<(ReferenceTrack, Vec<Landmark>)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row = conn
            .query_row(
                "SELECT * FROM reference_tracks WHERE track_id = ?1",
                params![track_id],
                |row| Ok((Self::row_to_track(row)?, row.get::<_, Vec<u8>>("landmarks")?)),
            )
            .optional()?;

        match row {
            Some((track, blob)) => {
                let landmarks = decode_landmarks(&blob)
                    .with_context(|| format!("Corrupt landmarks for track {}", track_id))?;
                if landmarks.len() != track.landmark_count {
                    bail!(
                        "Track {} declares {} landmarks but stores {}",
                        track_id,
                        track.landmark_count,
                        landmarks.len()
                    );
                }
                Ok(Some((track, landmarks)))
            }
            None => Ok(None),
        }
    }

    fn list_tracks(&self) -> Result<Vec<ReferenceTrack>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT track_id, extractor_version, landmark_count, duration_secs, ingested_at
             FROM reference_tracks ORDER BY track_id",
        )?;
        let tracks = stmt
            .query_map([], Self::row_to_track)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tracks)
    }

    fn delete_track(&self, track_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let deleted = conn.execute(
            "DELETE FROM reference_tracks WHERE track_id = ?1",
            params![track_id],
        )?;
        Ok(deleted > 0)
    }
}
