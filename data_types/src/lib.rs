//! Shared data types for the cube engine: ids, chunk metadata and the
//! revision lifecycle model.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use schema::PrimaryKey;
use snafu::{ensure, Snafu};

/// Errors constructing metadata values.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("chunk key range inverted: min {} > max {}", min_key, max_key))]
    InvertedKeyRange { min_key: String, max_key: String },

    #[snafu(display("chunk must contain at least one record"))]
    EmptyChunk,
}

/// Convenience alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Identifier of one aggregation (a schema plus its chunk set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AggregateId(u32);

impl AggregateId {
    /// Wrap a raw id.
    pub fn new(v: u32) -> Self {
        Self(v)
    }

    /// The raw id.
    pub fn get(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for AggregateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one immutable chunk. Allocated monotonically by the
/// catalog and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(u64);

impl ChunkId {
    /// Wrap a raw id.
    pub fn new(v: u64) -> Self {
        Self(v)
    }

    /// The raw id.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A published generation of the live chunk set. Revisions are totally
/// ordered per catalog; queries snapshot at one revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RevisionId(u64);

impl RevisionId {
    /// Wrap a raw revision number.
    pub fn new(v: u64) -> Self {
        Self(v)
    }

    /// The raw revision number.
    pub fn get(&self) -> u64 {
        self.0
    }

    /// The revision before any publication.
    pub const ZERO: Self = Self(0);

    /// The next revision.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for RevisionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Catalog metadata of one immutable chunk.
///
/// `min_key`/`max_key` are the first and last record keys of the chunk's
/// sorted byte stream; the envelope is closed on both ends.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMeta {
    /// The chunk id.
    pub id: ChunkId,
    /// The aggregation this chunk belongs to.
    pub aggregate_id: AggregateId,
    /// Key of the first record.
    pub min_key: PrimaryKey,
    /// Key of the last record.
    pub max_key: PrimaryKey,
    /// Number of records; at least one.
    pub record_count: u64,
    /// Revision that published this chunk.
    pub created_at: RevisionId,
    /// Revision that retired this chunk, if any.
    pub retired_at: Option<RevisionId>,
}

impl ChunkMeta {
    /// Build metadata for a freshly written chunk, checking the envelope
    /// invariants. `created_at` is stamped by the catalog on publication.
    pub fn new(
        id: ChunkId,
        aggregate_id: AggregateId,
        min_key: PrimaryKey,
        max_key: PrimaryKey,
        record_count: u64,
    ) -> Result<Self> {
        ensure!(record_count > 0, EmptyChunkSnafu);
        ensure!(
            min_key <= max_key,
            InvertedKeyRangeSnafu {
                min_key: min_key.to_string(),
                max_key: max_key.to_string()
            }
        );
        Ok(Self {
            id,
            aggregate_id,
            min_key,
            max_key,
            record_count,
            created_at: RevisionId::ZERO,
            retired_at: None,
        })
    }

    /// Whether this chunk is part of the live set at `revision`.
    pub fn is_live_at(&self, revision: RevisionId) -> bool {
        self.created_at <= revision && self.retired_at.map_or(true, |r| r > revision)
    }

    /// Whether this chunk's closed key envelope intersects `[lo, hi]`.
    pub fn overlaps(&self, lo: &PrimaryKey, hi: &PrimaryKey) -> bool {
        self.min_key <= *hi && *lo <= self.max_key
    }
}

/// Pressure classification of the live chunk set, derived from the maximum
/// number of chunks stacked over any single key point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapStatus {
    /// Stack depth below the soft threshold.
    Ok,
    /// Stack depth at or above soft, below critical.
    Soft,
    /// Stack depth at or above the critical threshold.
    Critical,
}

impl OverlapStatus {
    /// Classify a measured stack depth against the two thresholds.
    pub fn classify(depth: usize, soft: usize, critical: usize) -> Self {
        if depth < soft {
            Self::Ok
        } else if depth < critical {
            Self::Soft
        } else {
            Self::Critical
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::Value;

    fn key(v: i32) -> PrimaryKey {
        PrimaryKey::new(vec![Value::I32(v)])
    }

    fn meta(id: u64, lo: i32, hi: i32) -> ChunkMeta {
        ChunkMeta::new(ChunkId::new(id), AggregateId::new(1), key(lo), key(hi), 1).unwrap()
    }

    #[test]
    fn envelope_invariants() {
        assert!(matches!(
            ChunkMeta::new(ChunkId::new(1), AggregateId::new(1), key(5), key(1), 1),
            Err(Error::InvertedKeyRange { .. })
        ));
        assert!(matches!(
            ChunkMeta::new(ChunkId::new(1), AggregateId::new(1), key(1), key(5), 0),
            Err(Error::EmptyChunk)
        ));
        // a single-record chunk has a degenerate envelope
        meta(1, 3, 3);
    }

    #[test]
    fn liveness_window() {
        let mut m = meta(1, 0, 10);
        m.created_at = RevisionId::new(2);
        assert!(!m.is_live_at(RevisionId::new(1)));
        assert!(m.is_live_at(RevisionId::new(2)));
        assert!(m.is_live_at(RevisionId::new(9)));

        m.retired_at = Some(RevisionId::new(5));
        assert!(m.is_live_at(RevisionId::new(4)));
        // retired *at* 5 means not visible at 5
        assert!(!m.is_live_at(RevisionId::new(5)));
        assert!(!m.is_live_at(RevisionId::new(6)));
    }

    #[test]
    fn closed_interval_overlap() {
        let m = meta(1, 10, 20);
        assert!(m.overlaps(&key(20), &key(30)));
        assert!(m.overlaps(&key(0), &key(10)));
        assert!(m.overlaps(&key(12), &key(13)));
        assert!(!m.overlaps(&key(21), &key(30)));
        assert!(!m.overlaps(&key(0), &key(9)));
    }

    #[test]
    fn overlap_classification() {
        assert_eq!(OverlapStatus::classify(0, 3, 6), OverlapStatus::Ok);
        assert_eq!(OverlapStatus::classify(2, 3, 6), OverlapStatus::Ok);
        assert_eq!(OverlapStatus::classify(3, 3, 6), OverlapStatus::Soft);
        assert_eq!(OverlapStatus::classify(5, 3, 6), OverlapStatus::Soft);
        assert_eq!(OverlapStatus::classify(6, 3, 6), OverlapStatus::Critical);
    }
}
