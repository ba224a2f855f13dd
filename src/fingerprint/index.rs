//! In-memory inverted index from landmark hash to reference postings.
//!
//! Postings are spread over a fixed number of shards, each behind its own
//! lock, so ingesting one track only briefly blocks lookups that hash to the
//! same shard. Every ingestion writes its postings under a fresh generation
//! number; lookups only return postings whose generation is the one
//! currently published for the track. Publishing is a single swap of the
//! generation table, which makes a re-ingest appear all at once: readers see
//! either the old postings or the new ones, never both.
//!
//! A replaced or removed generation is retired rather than purged: its
//! postings stay in the shards until no snapshot can still see it, so a
//! query that started before the swap keeps seeing the complete old version.

use super::extractor::Landmark;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

const SHARD_COUNT: usize = 64;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Ingestion of track {0} is already in progress")]
    DuplicateIngestInProgress(String),

    #[error("Index integrity error for track {track_id}: {reason}")]
    Integrity { track_id: String, reason: String },
}

/// One occurrence of a hash in a reference track.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Posting {
    pub track_id: Arc<str>,
    pub offset: u32,
}

#[derive(Debug, Clone)]
struct StoredPosting {
    track_id: Arc<str>,
    offset: u32,
    generation: u64,
}

#[derive(Debug, Clone)]
struct PublishedTrack {
    generation: u64,
    landmark_count: usize,
    /// Distinct hashes written by this generation, used to purge it later.
    /// Every published map holding this entry shares the `Arc`.
    hashes: Arc<Vec<u32>>,
}

/// A generation taken out of the published map, waiting to be purged.
struct RetiredGeneration {
    track: Arc<str>,
    published: PublishedTrack,
}

impl RetiredGeneration {
    /// True once no published map, and so no snapshot, still holds it.
    fn is_unreferenced(&self) -> bool {
        Arc::strong_count(&self.published.hashes) == 1
    }
}

/// Immutable view of which generation is live for each track.
///
/// A matcher takes one snapshot per query so every lookup in that query is
/// filtered against the same set of tracks.
#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    live: Arc<HashMap<Arc<str>, PublishedTrack>>,
}

impl IndexSnapshot {
    pub fn track_count(&self) -> usize {
        self.live.len()
    }

    pub fn contains(&self, track_id: &str) -> bool {
        self.live.contains_key(track_id)
    }

    fn is_live(&self, posting: &StoredPosting) -> bool {
        self.live
            .get(&posting.track_id)
            .is_some_and(|t| t.generation == posting.generation)
    }
}

/// Removes the track from the in-flight set when an ingestion ends.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    track_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.track_id);
    }
}

pub struct FingerprintIndex {
    shards: Vec<RwLock<HashMap<u32, Vec<StoredPosting>>>>,
    published: RwLock<IndexSnapshot>,
    in_flight: Mutex<HashSet<String>>,
    retired: Mutex<Vec<RetiredGeneration>>,
    next_generation: AtomicU64,
    posting_count: AtomicUsize,
}

impl Default for FingerprintIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl FingerprintIndex {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            published: RwLock::new(IndexSnapshot::default()),
            in_flight: Mutex::new(HashSet::new()),
            retired: Mutex::new(Vec::new()),
            next_generation: AtomicU64::new(1),
            posting_count: AtomicUsize::new(0),
        }
    }

    fn shard_for(&self, hash: u32) -> &RwLock<HashMap<u32, Vec<StoredPosting>>> {
        &self.shards[self.shard_index(hash)]
    }

    /// Current published view.
    pub fn snapshot(&self) -> IndexSnapshot {
        self.published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Postings for `hash` from live track versions, sorted by track then
    /// offset. Unknown hashes yield an empty list.
    pub fn lookup(&self, hash: u32) -> Vec<Posting> {
        self.lookup_in(&self.snapshot(), hash)
    }

    /// Like [`lookup`](Self::lookup) but filtered against a caller-held snapshot.
    pub fn lookup_in(&self, snapshot: &IndexSnapshot, hash: u32) -> Vec<Posting> {
        let shard = self
            .shard_for(hash)
            .read()
            .unwrap_or_else(|e| e.into_inner());
        let mut postings: Vec<Posting> = shard
            .get(&hash)
            .map(|list| {
                list.iter()
                    .filter(|p| snapshot.is_live(p))
                    .map(|p| Posting {
                        track_id: p.track_id.clone(),
                        offset: p.offset,
                    })
                    .collect()
            })
            .unwrap_or_default();
        drop(shard);
        postings.sort();
        postings
    }

    /// Replace all entries of `track_id` with `landmarks`.
    pub fn ingest(&self, track_id: &str, landmarks: &[Landmark]) -> Result<(), IndexError> {
        self.ingest_with(track_id, landmarks, || Ok(()))
    }

    /// Ingest with a commit step that runs after the new postings are
    /// written but before they are published. If `commit` fails the new
    /// postings are discarded and the previous version of the track stays
    /// live.
    pub fn ingest_with<F>(
        &self,
        track_id: &str,
        landmarks: &[Landmark],
        commit: F,
    ) -> Result<(), IndexError>
    where
        F: FnOnce() -> Result<(), String>,
    {
        let _guard = self.begin(track_id)?;

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let track: Arc<str> = Arc::from(track_id);
        let hashes = self.write_postings(&track, generation, landmarks);

        if let Err(reason) = commit() {
            warn!(
                "Rolling back generation {} of track {}: {}",
                generation, track_id, reason
            );
            self.purge(&track, generation, &hashes);
            return Err(IndexError::Integrity {
                track_id: track_id.to_string(),
                reason,
            });
        }

        let replaced = self.publish(
            &track,
            Some(PublishedTrack {
                generation,
                landmark_count: landmarks.len(),
                hashes: Arc::new(hashes),
            }),
        );
        if let Some(old) = replaced {
            self.retire(track.clone(), old);
        }
        self.reap_retired();

        debug!(
            "Indexed track {} (generation {}, {} landmarks)",
            track_id,
            generation,
            landmarks.len()
        );
        Ok(())
    }

    /// Unpublish and drop every posting of `track_id`. Returns false if the
    /// track was not indexed.
    pub fn remove(&self, track_id: &str) -> Result<bool, IndexError> {
        let _guard = self.begin(track_id)?;
        let track: Arc<str> = Arc::from(track_id);
        let removed = match self.publish(&track, None) {
            Some(old) => {
                self.retire(track, old);
                true
            }
            None => false,
        };
        self.reap_retired();
        Ok(removed)
    }

    /// Purge retired generations that no snapshot can see anymore. Runs after
    /// every ingest and remove. Returns how many generations were purged.
    pub fn reap_retired(&self) -> usize {
        let mut retired = self.retired.lock().unwrap_or_else(|e| e.into_inner());
        let (ready, waiting): (Vec<_>, Vec<_>) = retired
            .drain(..)
            .partition(RetiredGeneration::is_unreferenced);
        *retired = waiting;
        for entry in &ready {
            self.purge(&entry.track, entry.published.generation, &entry.published.hashes);
        }
        ready.len()
    }

    pub fn contains(&self, track_id: &str) -> bool {
        self.snapshot().contains(track_id)
    }

    pub fn track_count(&self) -> usize {
        self.snapshot().track_count()
    }

    /// Landmark count of the live version of a track.
    pub fn landmark_count(&self, track_id: &str) -> Option<usize> {
        self.snapshot().live.get(track_id).map(|t| t.landmark_count)
    }

    /// Total stored postings, including ones not yet published and retired
    /// ones still visible to older snapshots.
    pub fn posting_count(&self) -> usize {
        self.posting_count.load(Ordering::Relaxed)
    }

    fn begin(&self, track_id: &str) -> Result<InFlightGuard<'_>, IndexError> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(track_id.to_string()) {
            return Err(IndexError::DuplicateIngestInProgress(track_id.to_string()));
        }
        Ok(InFlightGuard {
            set: &self.in_flight,
            track_id: track_id.to_string(),
        })
    }

    fn write_postings(&self, track: &Arc<str>, generation: u64, landmarks: &[Landmark]) -> Vec<u32> {
        let mut by_shard: HashMap<usize, Vec<&Landmark>> = HashMap::new();
        for lm in landmarks {
            let shard_idx = self.shard_index(lm.hash);
            by_shard.entry(shard_idx).or_default().push(lm);
        }

        for (shard_idx, lms) in by_shard {
            let mut shard = self.shards[shard_idx]
                .write()
                .unwrap_or_else(|e| e.into_inner());
            for lm in lms {
                shard.entry(lm.hash).or_default().push(StoredPosting {
                    track_id: track.clone(),
                    offset: lm.anchor_frame,
                    generation,
                });
            }
        }
        self.posting_count
            .fetch_add(landmarks.len(), Ordering::Relaxed);

        let mut hashes: Vec<u32> = landmarks.iter().map(|lm| lm.hash).collect();
        hashes.sort_unstable();
        hashes.dedup();
        hashes
    }

    fn shard_index(&self, hash: u32) -> usize {
        // Low bits of the hash are the frame delta; mix before picking a shard.
        let mixed = hash.wrapping_mul(0x9E37_79B1);
        (mixed >> 26) as usize % SHARD_COUNT
    }

    fn publish(&self, track: &Arc<str>, entry: Option<PublishedTrack>) -> Option<PublishedTrack> {
        let mut published = self.published.write().unwrap_or_else(|e| e.into_inner());
        let mut live = (*published.live).clone();
        let previous = match entry {
            Some(entry) => live.insert(track.clone(), entry),
            None => live.remove(track),
        };
        published.live = Arc::new(live);
        previous
    }

    fn retire(&self, track: Arc<str>, published: PublishedTrack) {
        self.retired
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RetiredGeneration { track, published });
    }

    fn purge(&self, track: &Arc<str>, generation: u64, hashes: &[u32]) {
        let mut removed = 0;
        for &hash in hashes {
            let mut shard = self
                .shard_for(hash)
                .write()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(list) = shard.get_mut(&hash) {
                let before = list.len();
                list.retain(|p| !(p.generation == generation && p.track_id == *track));
                removed += before - list.len();
                if list.is_empty() {
                    shard.remove(&hash);
                }
            }
        }
        self.posting_count.fetch_sub(removed, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn landmarks(seed: u32, count: u32) -> Vec<Landmark> {
        (0..count)
            .map(|i| Landmark {
                hash: seed.wrapping_mul(7919).wrapping_add(i * 31),
                anchor_frame: i,
            })
            .collect()
    }

    #[test]
    fn test_lookup_unknown_hash_is_empty() {
        let index = FingerprintIndex::new();
        assert!(index.lookup(42).is_empty());
    }

    #[test]
    fn test_ingest_and_lookup() {
        let index = FingerprintIndex::new();
        let lms = vec![
            Landmark { hash: 10, anchor_frame: 5 },
            Landmark { hash: 10, anchor_frame: 2 },
            Landmark { hash: 11, anchor_frame: 7 },
        ];
        index.ingest("track-a", &lms).unwrap();

        let postings = index.lookup(10);
        assert_eq!(postings.len(), 2);
        assert_eq!(&*postings[0].track_id, "track-a");
        assert_eq!(postings[0].offset, 2);
        assert_eq!(postings[1].offset, 5);
        assert_eq!(index.landmark_count("track-a"), Some(3));
        assert_eq!(index.posting_count(), 3);
    }

    #[test]
    fn test_reingest_replaces_entries() {
        let index = FingerprintIndex::new();
        index
            .ingest("track-a", &[Landmark { hash: 1, anchor_frame: 1 }])
            .unwrap();
        index
            .ingest("track-a", &[Landmark { hash: 2, anchor_frame: 9 }])
            .unwrap();

        assert!(index.lookup(1).is_empty());
        assert_eq!(index.lookup(2).len(), 1);
        assert_eq!(index.track_count(), 1);
        assert_eq!(index.posting_count(), 1);
    }

    #[test]
    fn test_failed_commit_keeps_previous_version() {
        let index = FingerprintIndex::new();
        index
            .ingest("track-a", &[Landmark { hash: 1, anchor_frame: 1 }])
            .unwrap();

        let result = index.ingest_with(
            "track-a",
            &[Landmark { hash: 2, anchor_frame: 2 }],
            || Err("disk full".to_string()),
        );
        assert!(matches!(result, Err(IndexError::Integrity { .. })));

        assert_eq!(index.lookup(1).len(), 1);
        assert!(index.lookup(2).is_empty());
        assert_eq!(index.posting_count(), 1);
    }

    #[test]
    fn test_remove() {
        let index = FingerprintIndex::new();
        index.ingest("track-a", &landmarks(1, 50)).unwrap();
        assert!(index.remove("track-a").unwrap());
        assert!(!index.remove("track-a").unwrap());
        assert!(!index.contains("track-a"));
        assert_eq!(index.posting_count(), 0);
    }

    #[test]
    fn test_duplicate_ingest_in_progress() {
        let index = Arc::new(FingerprintIndex::new());
        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));

        let worker = {
            let index = index.clone();
            let entered = entered.clone();
            let release = release.clone();
            thread::spawn(move || {
                index.ingest_with("track-a", &landmarks(1, 10), || {
                    entered.wait();
                    release.wait();
                    Ok(())
                })
            })
        };

        entered.wait();
        let second = index.ingest("track-a", &landmarks(2, 10));
        assert!(matches!(
            second,
            Err(IndexError::DuplicateIngestInProgress(_))
        ));
        // Other tracks are unaffected.
        index.ingest("track-b", &landmarks(3, 10)).unwrap();
        release.wait();

        worker.join().unwrap().unwrap();
        assert!(index.contains("track-a"));
        assert!(index.contains("track-b"));
        // After the first ingestion finishes the track can be ingested again.
        index.ingest("track-a", &landmarks(2, 10)).unwrap();
    }

    #[test]
    fn test_snapshot_hides_later_publications() {
        let index = FingerprintIndex::new();
        let snapshot = index.snapshot();
        index
            .ingest("track-a", &[Landmark { hash: 5, anchor_frame: 0 }])
            .unwrap();

        assert!(index.lookup_in(&snapshot, 5).is_empty());
        assert_eq!(index.lookup(5).len(), 1);
    }

    #[test]
    fn test_reingest_keeps_old_version_for_earlier_snapshot() {
        let index = FingerprintIndex::new();
        let lms = vec![
            Landmark { hash: 1, anchor_frame: 0 },
            Landmark { hash: 2, anchor_frame: 3 },
        ];
        index.ingest("track-a", &lms).unwrap();

        let snapshot = index.snapshot();
        assert_eq!(index.lookup_in(&snapshot, 1).len(), 1);
        index.ingest("track-a", &lms).unwrap();

        // The query that started before the swap still sees every old posting
        assert_eq!(index.lookup_in(&snapshot, 2).len(), 1);
        assert_eq!(index.lookup(2).len(), 1);
        assert_eq!(index.posting_count(), 4);

        drop(snapshot);
        assert_eq!(index.reap_retired(), 1);
        assert_eq!(index.posting_count(), 2);
        assert_eq!(index.lookup(1).len(), 1);
    }

    #[test]
    fn test_remove_keeps_track_for_earlier_snapshot() {
        let index = FingerprintIndex::new();
        index.ingest("track-a", &landmarks(1, 20)).unwrap();
        let snapshot = index.snapshot();

        assert!(index.remove("track-a").unwrap());
        let hash = landmarks(1, 20)[7].hash;
        assert!(index.lookup(hash).is_empty());
        assert_eq!(index.lookup_in(&snapshot, hash).len(), 1);

        drop(snapshot);
        index.reap_retired();
        assert_eq!(index.posting_count(), 0);
    }

    #[test]
    fn test_concurrent_ingestion_isolation() {
        let index = Arc::new(FingerprintIndex::new());
        let tracks: Vec<(String, Vec<Landmark>)> = (0..8)
            .map(|i| (format!("track-{}", i), landmarks(i + 1, 500)))
            .collect();

        thread::scope(|scope| {
            for (track_id, lms) in &tracks {
                let index = index.clone();
                scope.spawn(move || {
                    for _ in 0..3 {
                        index.ingest(track_id, lms).unwrap();
                    }
                });
            }
        });

        assert_eq!(index.track_count(), 8);
        assert_eq!(index.posting_count(), 8 * 500);
        for (track_id, lms) in &tracks {
            for lm in lms {
                let own: Vec<_> = index
                    .lookup(lm.hash)
                    .into_iter()
                    .filter(|p| &*p.track_id == track_id.as_str())
                    .collect();
                assert!(own.iter().any(|p| p.offset == lm.anchor_frame));
                // Exactly one generation of this track is visible.
                let expected = lms.iter().filter(|other| other.hash == lm.hash).count();
                assert_eq!(own.len(), expected);
            }
        }
    }
}
