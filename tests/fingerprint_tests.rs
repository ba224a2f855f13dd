//! Matching tests against a reference library of synthetic samples

mod common;

use audiowave_pipeline::audio::decode_wav;
use audiowave_pipeline::fingerprint::{
    FingerprintConfig, MatchCandidate, MatchConfig, ReferenceLibrary, SqliteReferenceStore,
};
use audiowave_pipeline::storage::{ArtifactStore, MemoryArtifactStore};
use common::*;
use std::sync::Arc;
use tempfile::TempDir;

fn library_with_store(store: SqliteReferenceStore) -> ReferenceLibrary {
    ReferenceLibrary::new(
        Arc::new(MemoryArtifactStore::new()),
        Arc::new(store),
        FingerprintConfig::default(),
        MatchConfig::default(),
    )
}

fn library() -> ReferenceLibrary {
    library_with_store(SqliteReferenceStore::in_memory().unwrap())
}

fn ingest(library: &ReferenceLibrary, artifacts: &MemoryArtifactStore, track_id: &str, samples: &[f32]) {
    let handle = artifacts.put(&wav(samples)).unwrap();
    library.ingest_reference_track(track_id, &handle).unwrap();
}

/// Match a clip the way the pipeline does: through a WAV round trip.
fn query(library: &ReferenceLibrary, samples: &[f32]) -> Vec<MatchCandidate> {
    let audio = decode_wav(&wav(samples)).unwrap();
    let landmarks = library
        .extractor()
        .extract(&audio.samples, audio.sample_rate)
        .unwrap();
    library.match_engine().find_matches(&landmarks)
}

/// A library holding three unrelated samples, plus their audio.
fn populated() -> (ReferenceLibrary, Vec<Vec<f32>>) {
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let library = ReferenceLibrary::new(
        artifacts.clone(),
        Arc::new(SqliteReferenceStore::in_memory().unwrap()),
        FingerprintConfig::default(),
        MatchConfig::default(),
    );
    let samples: Vec<Vec<f32>> = (0..3).map(|seed| synth_sample(100 + seed, 12.0)).collect();
    for (i, audio) in samples.iter().enumerate() {
        ingest(&library, &artifacts, &format!("sample-{}", i), audio);
    }
    (library, samples)
}

#[test]
fn test_every_reference_matches_itself() {
    let (library, samples) = populated();
    for (i, audio) in samples.iter().enumerate() {
        let matches = query(&library, audio);
        assert_eq!(matches[0].track_id, format!("sample-{}", i));
        assert!(matches[0].confidence >= 0.95, "confidence {}", matches[0].confidence);
        assert_eq!(matches[0].offset_frames, 0);
    }
}

#[test]
fn test_quieter_copy_still_matches() {
    let (library, samples) = populated();
    let quiet: Vec<f32> = samples[1].iter().map(|s| s * 0.25).collect();

    let matches = query(&library, &quiet);
    assert_eq!(matches[0].track_id, "sample-1");
    assert!(matches[0].confidence >= 0.9, "confidence {}", matches[0].confidence);
}

#[test]
fn test_noisy_copy_still_matches() {
    let (library, samples) = populated();
    let noisy = add_noise(&samples[2], 7, 0.05);

    let matches = query(&library, &noisy);
    assert!(!matches.is_empty());
    assert_eq!(matches[0].track_id, "sample-2");
    assert!(matches[0].vote_count >= MatchConfig::default().min_votes);
    assert!(matches[0].offset_frames.abs() <= 1);
}

#[test]
fn test_trimmed_clip_reports_offset() {
    let (library, samples) = populated();
    let trim = 5 * SAMPLE_RATE as usize;
    let trimmed = &samples[0][trim..];

    let matches = query(&library, trimmed);
    assert_eq!(matches[0].track_id, "sample-0");
    assert!(matches[0].vote_count >= MatchConfig::default().min_votes);
    assert!(
        (matches[0].offset_secs - 5.0).abs() < 0.1,
        "offset {}",
        matches[0].offset_secs
    );
}

#[test]
fn test_unrelated_clip_has_no_match() {
    let (library, _) = populated();
    let matches = query(&library, &synth_sample(999, 8.0));
    assert!(matches.is_empty(), "{:?}", matches);
}

#[test]
fn test_empty_library_has_no_match() {
    let library = library();
    assert!(query(&library, &synth_sample(1, 4.0)).is_empty());
}

#[test]
fn test_concurrent_ingestion_does_not_disturb_queries() {
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let library = ReferenceLibrary::new(
        artifacts.clone(),
        Arc::new(SqliteReferenceStore::in_memory().unwrap()),
        FingerprintConfig::default(),
        MatchConfig::default(),
    );
    let existing = synth_sample(200, 8.0);
    ingest(&library, &artifacts, "existing", &existing);

    let new_tracks: Vec<Vec<f32>> = (0..4).map(|i| synth_sample(300 + i, 6.0)).collect();
    std::thread::scope(|scope| {
        for (i, audio) in new_tracks.iter().enumerate() {
            let (library, artifacts) = (&library, &artifacts);
            scope.spawn(move || ingest(library, artifacts, &format!("new-{}", i), audio));
        }
        let library = &library;
        let existing = &existing;
        scope.spawn(move || {
            for _ in 0..5 {
                let matches = query(library, existing);
                assert_eq!(matches[0].track_id, "existing");
                assert!(matches[0].confidence >= 0.95);
            }
        });
    });

    assert_eq!(library.list_tracks().unwrap().len(), 5);
    for (i, audio) in new_tracks.iter().enumerate() {
        assert_eq!(query(&library, audio)[0].track_id, format!("new-{}", i));
    }
}

#[test]
fn test_reingest_replaces_track() {
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let library = ReferenceLibrary::new(
        artifacts.clone(),
        Arc::new(SqliteReferenceStore::in_memory().unwrap()),
        FingerprintConfig::default(),
        MatchConfig::default(),
    );
    let old = synth_sample(400, 6.0);
    let new = synth_sample(401, 6.0);
    ingest(&library, &artifacts, "track", &old);
    ingest(&library, &artifacts, "track", &new);

    assert!(query(&library, &old).is_empty());
    assert_eq!(query(&library, &new)[0].track_id, "track");
    assert_eq!(library.list_tracks().unwrap().len(), 1);
}

#[test]
fn test_library_is_rebuilt_from_disk() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("fingerprints.db");
    let audio = synth_sample(500, 6.0);

    {
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let library = ReferenceLibrary::new(
            artifacts.clone(),
            Arc::new(SqliteReferenceStore::new(&db_path).unwrap()),
            FingerprintConfig::default(),
            MatchConfig::default(),
        );
        ingest(&library, &artifacts, SAMPLE_A, &audio);
        ingest(&library, &artifacts, SAMPLE_B, &synth_sample(501, 6.0));
        assert!(library.remove_reference_track(SAMPLE_B).unwrap());
    }

    let library = ReferenceLibrary::open(
        Arc::new(MemoryArtifactStore::new()),
        Arc::new(SqliteReferenceStore::new(&db_path).unwrap()),
        FingerprintConfig::default(),
        MatchConfig::default(),
    )
    .unwrap();
    assert_eq!(library.index().track_count(), 1);
    let matches = query(&library, &audio);
    assert_eq!(matches[0].track_id, SAMPLE_A);
    assert!(matches[0].confidence >= 0.95);
}
