//! Offset-histogram voting against the fingerprint index.
//!
//! For every hit of a query landmark, `delta = reference_offset -
//! query_anchor` is recorded per reference track. A true match concentrates
//! its hits on a single delta (the clip's position inside the reference),
//! while chance hash collisions scatter. Each track is scored by the number
//! of distinct query landmarks whose hits fall inside the best
//! `±offset_tolerance_frames` window.

use super::config::MatchConfig;
use super::extractor::Landmark;
use super::index::FingerprintIndex;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

/// One ranked match of a query against a reference track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub track_id: String,
    /// Where the query starts inside the reference, in analysis frames.
    pub offset_frames: i64,
    pub offset_secs: f64,
    pub vote_count: usize,
    /// `vote_count / query landmark count`, clamped to `[0, 1]`.
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy)]
struct Peak {
    center: i64,
    votes: usize,
    /// Distinct delta values inside the window.
    spread: usize,
    /// Hits exactly on `center`.
    center_hits: usize,
}

impl Peak {
    /// More votes, then tighter spread, then more hits on the center, then
    /// smaller offset.
    fn rank_key(&self) -> (usize, Reverse<usize>, usize, Reverse<i64>) {
        (
            self.votes,
            Reverse(self.spread),
            self.center_hits,
            Reverse(self.center),
        )
    }
}

pub struct MatchEngine {
    index: Arc<FingerprintIndex>,
    config: MatchConfig,
    frame_duration_secs: f64,
}

impl MatchEngine {
    pub fn new(index: Arc<FingerprintIndex>, config: MatchConfig, frame_duration_secs: f64) -> Self {
        Self {
            index,
            config,
            frame_duration_secs,
        }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Rank reference tracks by how well they explain `query`.
    ///
    /// Returns the most confident candidate first. No match is an empty list.
    pub fn find_matches(&self, query: &[Landmark]) -> Vec<MatchCandidate> {
        if query.is_empty() {
            return Vec::new();
        }

        let snapshot = self.index.snapshot();
        // track -> (delta, query landmark index)
        let mut hits: HashMap<Arc<str>, Vec<(i64, u32)>> = HashMap::new();
        for (qi, lm) in query.iter().enumerate() {
            for posting in self.index.lookup_in(&snapshot, lm.hash) {
                let delta = posting.offset as i64 - lm.anchor_frame as i64;
                hits.entry(posting.track_id).or_default().push((delta, qi as u32));
            }
        }

        let total = query.len() as f64;
        let mut scored: Vec<(Arc<str>, Peak)> = hits
            .into_iter()
            .filter_map(|(track, mut track_hits)| {
                best_window(&mut track_hits, self.config.offset_tolerance_frames)
                    .filter(|peak| peak.votes >= self.config.min_votes)
                    .map(|peak| (track, peak))
            })
            .collect();

        scored.sort_by(|(ta, a), (tb, b)| {
            b.votes
                .cmp(&a.votes)
                .then(a.spread.cmp(&b.spread))
                .then(ta.cmp(tb))
        });
        scored.truncate(self.config.max_candidates);

        scored
            .into_iter()
            .map(|(track, peak)| MatchCandidate {
                track_id: track.to_string(),
                offset_frames: peak.center,
                offset_secs: peak.center as f64 * self.frame_duration_secs,
                vote_count: peak.votes,
                confidence: (peak.votes as f64 / total).clamp(0.0, 1.0),
            })
            .collect()
    }
}

/// Slide a `[c - tolerance, c + tolerance]` window over every observed delta
/// `c` and return the best-scoring one.
fn best_window(hits: &mut [(i64, u32)], tolerance: i64) -> Option<Peak> {
    if hits.is_empty() {
        return None;
    }
    hits.sort_unstable();

    // Distinct deltas with their hit counts, in ascending order.
    let mut deltas: Vec<(i64, usize)> = Vec::new();
    for &(delta, _) in hits.iter() {
        match deltas.last_mut() {
            Some((d, count)) if *d == delta => *count += 1,
            _ => deltas.push((delta, 1)),
        }
    }

    let mut in_window: HashMap<u32, usize> = HashMap::new();
    let (mut lo, mut hi) = (0usize, 0usize);
    let (mut delta_lo, mut delta_hi) = (0usize, 0usize);
    let mut best: Option<Peak> = None;

    for &(center, center_hits) in &deltas {
        while hi < hits.len() && hits[hi].0 <= center + tolerance {
            *in_window.entry(hits[hi].1).or_default() += 1;
            hi += 1;
        }
        while lo < hi && hits[lo].0 < center - tolerance {
            let qi = hits[lo].1;
            if let Some(count) = in_window.get_mut(&qi) {
                *count -= 1;
                if *count == 0 {
                    in_window.remove(&qi);
                }
            }
            lo += 1;
        }
        while delta_hi < deltas.len() && deltas[delta_hi].0 <= center + tolerance {
            delta_hi += 1;
        }
        while delta_lo < delta_hi && deltas[delta_lo].0 < center - tolerance {
            delta_lo += 1;
        }

        let candidate = Peak {
            center,
            votes: in_window.len(),
            spread: delta_hi - delta_lo,
            center_hits,
        };
        if best.map_or(true, |b| candidate.rank_key() > b.rank_key()) {
            best = Some(candidate);
        }
    }

    best
}
