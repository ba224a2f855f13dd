//! Landmark fingerprinting and matching.
//!
//! [`FingerprintExtractor`] turns audio into landmark hashes,
//! [`FingerprintIndex`] maps hashes to reference-track postings and
//! [`MatchEngine`] ranks reference tracks for a query by offset voting.
//! [`ReferenceLibrary`] is the administrative entry point for ingesting
//! licensed samples.

mod config;
mod extractor;
mod index;
mod library;
mod matcher;
mod peaks;
mod schema;
mod spectrogram;
mod store;

pub use config::{FingerprintConfig, MatchConfig};
pub use extractor::{
    pack_hash, unpack_hash, ExtractError, FingerprintExtractor, Landmark, EXTRACTOR_VERSION,
    MAX_TARGET_DT,
};
pub use index::{FingerprintIndex, IndexError, IndexSnapshot, Posting};
pub use library::{LibraryError, RebuildReport, ReferenceLibrary};
pub use matcher::{MatchCandidate, MatchEngine};
pub use schema::FINGERPRINT_VERSIONED_SCHEMAS;
pub use store::{ReferenceStore, ReferenceTrack, SqliteReferenceStore};
