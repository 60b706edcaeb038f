//! The revision catalog boundary.
//!
//! The catalog owns chunk id allocation and the revision lifecycle: a
//! publisher bases its work on a revision, then atomically commits a set of
//! created chunks and retired chunk ids as the next revision. Readers load
//! the live set at any revision and see an immutable snapshot.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use async_trait::async_trait;
use data_types::{AggregateId, ChunkId, ChunkMeta, RevisionId};
use snafu::Snafu;
use std::fmt::Debug;

pub mod mem;

pub use mem::MemCatalog;

/// Catalog errors.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display(
        "revision conflict: chunk {} is not retirable at revision {}",
        chunk_id,
        revision
    ))]
    RevisionConflict {
        chunk_id: ChunkId,
        revision: RevisionId,
    },

    #[snafu(display("chunk {} already published", chunk_id))]
    ChunkAlreadyPublished { chunk_id: ChunkId },

    #[snafu(display("chunk {} was never allocated", chunk_id))]
    UnallocatedChunk { chunk_id: ChunkId },

    #[snafu(display("revision {} has not been published yet", revision))]
    UnknownRevision { revision: RevisionId },
}

/// Convenience alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A transactional catalog of chunk lifecycle.
#[async_trait]
pub trait Catalog: Debug + Send + Sync + 'static {
    /// Returns `n` fresh, never-reused chunk ids.
    async fn allocate_chunk_ids(&self, n: usize) -> Result<Vec<ChunkId>>;

    /// Returns the revision a publisher should base its work on: the latest
    /// published revision.
    async fn begin_revision(&self) -> Result<RevisionId>;

    /// Atomically publish the next revision: stamp and insert `created`,
    /// mark `retired` as retired at the new revision.
    ///
    /// Fails with [`Error::RevisionConflict`] when any chunk in `retired`
    /// is no longer live (a concurrent publisher got there first) or was
    /// published after `based_on` (the publisher never saw it). Publishes
    /// that retire nothing cannot conflict, which is what lets ingest and
    /// consolidation commit concurrently.
    async fn publish(
        &self,
        based_on: RevisionId,
        created: Vec<ChunkMeta>,
        retired: Vec<ChunkId>,
    ) -> Result<RevisionId>;

    /// Load the chunk set of `aggregate` live at `revision`, or at the
    /// latest revision when `None`. Returns the resolved revision with the
    /// metadata.
    async fn load_live(
        &self,
        aggregate: AggregateId,
        revision: Option<RevisionId>,
    ) -> Result<(RevisionId, Vec<ChunkMeta>)>;
}
