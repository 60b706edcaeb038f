//! In-memory [`ChunkStore`] holding the encoded byte image per chunk.
//!
//! Records pass through the real record codec on both paths, so everything
//! exercising this store also exercises the byte format. Reads re-verify
//! record ordering and surface corruption as an integrity error.

use crate::{ChunkSink, ChunkStore, ChunkStoreError, RecordStream};
use async_trait::async_trait;
use data_types::ChunkId;
use futures::StreamExt;
use observability_deps::tracing::debug;
use parking_lot::Mutex;
use schema::{PrimaryKey, Record, Schema};
use std::{collections::BTreeMap, sync::Arc};

#[derive(Debug, Clone)]
struct StoredChunk {
    bytes: Arc<Vec<u8>>,
    record_count: u64,
}

/// An in-memory, write-once chunk store.
#[derive(Debug, Default)]
pub struct MemChunkStore {
    chunks: Arc<Mutex<BTreeMap<ChunkId, StoredChunk>>>,
}

impl MemChunkStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Default::default()
    }

    /// Number of chunks holding bytes (published or not).
    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().len()
    }

    /// Total stored bytes across all chunks.
    pub fn bytes_stored(&self) -> usize {
        self.chunks.lock().values().map(|c| c.bytes.len()).sum()
    }

    /// Whether `id` holds bytes.
    pub fn contains(&self, id: ChunkId) -> bool {
        self.chunks.lock().contains_key(&id)
    }

    /// The raw byte image of a chunk, for tests asserting immutability.
    pub fn raw_bytes(&self, id: ChunkId) -> Option<Arc<Vec<u8>>> {
        self.chunks.lock().get(&id).map(|c| Arc::clone(&c.bytes))
    }

    /// Stored record count of a chunk.
    pub fn record_count(&self, id: ChunkId) -> Option<u64> {
        self.chunks.lock().get(&id).map(|c| c.record_count)
    }
}

#[async_trait]
impl ChunkStore for MemChunkStore {
    async fn writer(
        &self,
        chunk_id: ChunkId,
        schema: Arc<Schema>,
    ) -> Result<Box<dyn ChunkSink>, ChunkStoreError> {
        if self.chunks.lock().contains_key(&chunk_id) {
            return Err(ChunkStoreError::already_written(chunk_id));
        }
        Ok(Box::new(MemChunkSink {
            chunk_id,
            schema,
            chunks: Arc::clone(&self.chunks),
            buffer: Vec::new(),
            record_count: 0,
            last_key: None,
        }))
    }

    async fn reader(
        &self,
        chunk_id: ChunkId,
        schema: Arc<Schema>,
    ) -> Result<RecordStream, ChunkStoreError> {
        let stored = self
            .chunks
            .lock()
            .get(&chunk_id)
            .cloned()
            .ok_or_else(|| ChunkStoreError::unknown_chunk(chunk_id))?;

        let state = ReadState {
            bytes: stored.bytes,
            offset: 0,
            schema,
            last_key: None,
            chunk_id,
        };
        let stream = futures::stream::try_unfold(state, |mut state| async move {
            if state.offset >= state.bytes.len() {
                return Ok(None);
            }
            let (record, consumed) = state
                .schema
                .decode_record(&state.bytes[state.offset..])
                .map_err(ChunkStoreError::integrity)?;
            state.offset += consumed;

            if let Some(last) = &state.last_key {
                if record.key <= *last {
                    return Err(ChunkStoreError::integrity(format!(
                        "chunk {}: record key {} not above predecessor {}",
                        state.chunk_id, record.key, last
                    )));
                }
            }
            state.last_key = Some(record.key.clone());
            Ok(Some((record, state)))
        });
        Ok(stream.boxed())
    }
}

struct ReadState {
    bytes: Arc<Vec<u8>>,
    offset: usize,
    schema: Arc<Schema>,
    last_key: Option<PrimaryKey>,
    chunk_id: ChunkId,
}

#[derive(Debug)]
struct MemChunkSink {
    chunk_id: ChunkId,
    schema: Arc<Schema>,
    chunks: Arc<Mutex<BTreeMap<ChunkId, StoredChunk>>>,
    buffer: Vec<u8>,
    record_count: u64,
    last_key: Option<PrimaryKey>,
}

#[async_trait]
impl ChunkSink for MemChunkSink {
    async fn push(&mut self, record: Record) -> Result<(), ChunkStoreError> {
        if let Some(last) = &self.last_key {
            if record.key <= *last {
                return Err(ChunkStoreError::integrity(format!(
                    "chunk {}: write of key {} not above predecessor {}",
                    self.chunk_id, record.key, last
                )));
            }
        }
        self.schema.encode_record(&record, &mut self.buffer)?;
        self.last_key = Some(record.key);
        self.record_count += 1;
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<u64, ChunkStoreError> {
        let mut chunks = self.chunks.lock();
        if chunks.contains_key(&self.chunk_id) {
            return Err(ChunkStoreError::already_written(self.chunk_id));
        }
        debug!(
            chunk_id = %self.chunk_id,
            records = self.record_count,
            bytes = self.buffer.len(),
            "chunk sealed"
        );
        chunks.insert(
            self.chunk_id,
            StoredChunk {
                bytes: Arc::new(self.buffer),
                record_count: self.record_count,
            },
        );
        Ok(self.record_count)
    }
}
