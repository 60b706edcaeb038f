//! The chunk byte store boundary.
//!
//! A chunk is an append-once byte stream of encoded records, keyed by its
//! [`ChunkId`]. The store confirms durability when a writer finishes; after
//! that the bytes for an id never change. Replacement happens at the catalog
//! level by publishing new ids, never by rewriting bytes here.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use async_trait::async_trait;
use data_types::ChunkId;
use futures::stream::BoxStream;
use schema::{Record, Schema};
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

pub mod mem;

pub use mem::MemChunkStore;

/// Generic boxed error type for chunk store implementations.
///
/// The dynamic boxing makes it easier to deal with errors from different
/// backends; the [`kind`](Self::kind) tag is what callers dispatch on.
#[derive(Debug)]
pub struct ChunkStoreError {
    inner: Box<dyn std::error::Error + Sync + Send>,
    kind: ChunkStoreErrorKind,
}

impl ChunkStoreError {
    /// Wrap an error under the given kind.
    pub fn new(
        kind: ChunkStoreErrorKind,
        e: impl Into<Box<dyn std::error::Error + Sync + Send>>,
    ) -> Self {
        Self {
            inner: e.into(),
            kind,
        }
    }

    /// An I/O failure of the underlying byte stream.
    pub fn io(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(ChunkStoreErrorKind::Io, e)
    }

    /// The requested chunk id holds no bytes.
    pub fn unknown_chunk(id: ChunkId) -> Self {
        Self::new(
            ChunkStoreErrorKind::UnknownChunk,
            format!("no bytes stored for chunk {}", id),
        )
    }

    /// A second writer attempted to open an id.
    pub fn already_written(id: ChunkId) -> Self {
        Self::new(
            ChunkStoreErrorKind::AlreadyWritten,
            format!("chunk {} already written", id),
        )
    }

    /// Stored bytes violate the chunk contract.
    pub fn integrity(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(ChunkStoreErrorKind::Integrity, e)
    }

    /// The error kind.
    pub fn kind(&self) -> ChunkStoreErrorKind {
        self.kind
    }

    /// The wrapped error.
    pub fn inner(&self) -> &dyn std::error::Error {
        self.inner.as_ref()
    }
}

impl Display for ChunkStoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChunkStoreError({:?}): {}", self.kind, self.inner)
    }
}

impl std::error::Error for ChunkStoreError {}

impl From<schema::Error> for ChunkStoreError {
    fn from(e: schema::Error) -> Self {
        Self {
            inner: Box::new(e),
            kind: ChunkStoreErrorKind::InvalidData,
        }
    }
}

/// Classification of chunk store failures.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChunkStoreErrorKind {
    /// A fatal I/O error; the overall operation fails and may be retried at
    /// a higher level with fresh chunk ids.
    Io,

    /// The chunk id has no stored bytes.
    UnknownChunk,

    /// The chunk id was already written; ids are write-once.
    AlreadyWritten,

    /// A record failed to encode or decode against the schema.
    InvalidData,

    /// Stored records are out of order or otherwise inconsistent. Never
    /// masked; surfaced to the reader as fatal.
    Integrity,
}

/// A record stream produced by [`ChunkStore::reader`].
pub type RecordStream = BoxStream<'static, Result<Record, ChunkStoreError>>;

/// An open chunk writer. Records must arrive in strictly increasing key
/// order; the sink reports success only once the bytes are durable.
#[async_trait]
pub trait ChunkSink: Send {
    /// Append one record.
    async fn push(&mut self, record: Record) -> Result<(), ChunkStoreError>;

    /// Seal the chunk. Returns the number of records written after the
    /// bytes are durable. A sink that is dropped without `finish` leaves no
    /// trace in the store.
    async fn finish(self: Box<Self>) -> Result<u64, ChunkStoreError>;
}

/// The chunk byte store.
#[async_trait]
pub trait ChunkStore: Debug + Send + Sync + 'static {
    /// Open a write sink for a freshly allocated chunk id. Exactly one
    /// writer may ever open a given id.
    async fn writer(
        &self,
        chunk_id: ChunkId,
        schema: Arc<Schema>,
    ) -> Result<Box<dyn ChunkSink>, ChunkStoreError>;

    /// Open a record stream over a stored chunk, emitting records in their
    /// stored (ascending key) order. The stream is restartable only by
    /// calling `reader` again.
    async fn reader(
        &self,
        chunk_id: ChunkId,
        schema: Arc<Schema>,
    ) -> Result<RecordStream, ChunkStoreError>;
}
