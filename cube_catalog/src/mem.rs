//! In-memory [`Catalog`] with a single serialised commit path.

use crate::{Catalog, Error, Result};
use async_trait::async_trait;
use data_types::{AggregateId, ChunkId, ChunkMeta, RevisionId};
use metric::{Metric, U64Counter};
use observability_deps::tracing::{debug, info};
use parking_lot::Mutex;
use snafu::ensure;
use std::{collections::BTreeMap, sync::Arc};

#[derive(Debug, Default)]
struct State {
    next_chunk_id: u64,
    allocated: std::collections::BTreeSet<ChunkId>,
    revision: RevisionId,
    chunks: BTreeMap<ChunkId, ChunkMeta>,
}

/// An in-memory transactional catalog.
///
/// Every mutation happens under one mutex, which is the whole transaction
/// story: a publish is observed either not at all or in full.
#[derive(Debug)]
pub struct MemCatalog {
    state: Mutex<State>,
    publish_ok: U64Counter,
    publish_conflict: U64Counter,
}

impl MemCatalog {
    /// Create an empty catalog registering its metrics in `registry`.
    pub fn new(registry: &metric::Registry) -> Self {
        let publishes: Metric<U64Counter> = registry.register_metric(
            "catalog_publish_count",
            "revision publish attempts by outcome",
        );
        Self {
            state: Default::default(),
            publish_ok: publishes.recorder(&[("outcome", "ok")]),
            publish_conflict: publishes.recorder(&[("outcome", "conflict")]),
        }
    }

    /// Metadata of every chunk ever published, live or retired. Used by
    /// tests and external garbage collection.
    pub fn all_chunks(&self) -> Vec<ChunkMeta> {
        self.state.lock().chunks.values().cloned().collect()
    }
}

#[async_trait]
impl Catalog for MemCatalog {
    async fn allocate_chunk_ids(&self, n: usize) -> Result<Vec<ChunkId>> {
        let mut state = self.state.lock();
        let ids: Vec<_> = (0..n)
            .map(|_| {
                state.next_chunk_id += 1;
                ChunkId::new(state.next_chunk_id)
            })
            .collect();
        state.allocated.extend(ids.iter().copied());
        debug!(n, first = ?ids.first(), "allocated chunk ids");
        Ok(ids)
    }

    async fn begin_revision(&self) -> Result<RevisionId> {
        Ok(self.state.lock().revision)
    }

    async fn publish(
        &self,
        based_on: RevisionId,
        created: Vec<ChunkMeta>,
        retired: Vec<ChunkId>,
    ) -> Result<RevisionId> {
        let mut state = self.state.lock();
        let next = state.revision.next();

        // preconditions before any mutation: the commit is all-or-nothing
        for meta in &created {
            ensure!(
                state.allocated.contains(&meta.id),
                crate::UnallocatedChunkSnafu { chunk_id: meta.id }
            );
            ensure!(
                !state.chunks.contains_key(&meta.id),
                crate::ChunkAlreadyPublishedSnafu { chunk_id: meta.id }
            );
        }
        for id in &retired {
            let live = state
                .chunks
                .get(id)
                .map(|meta| meta.is_live_at(state.revision) && meta.created_at <= based_on)
                .unwrap_or(false);
            if !live {
                self.publish_conflict.inc(1);
                return Err(Error::RevisionConflict {
                    chunk_id: *id,
                    revision: state.revision,
                });
            }
        }

        for mut meta in created {
            meta.created_at = next;
            meta.retired_at = None;
            state.chunks.insert(meta.id, meta);
        }
        for id in &retired {
            state
                .chunks
                .get_mut(id)
                .expect("checked above")
                .retired_at = Some(next);
        }
        state.revision = next;
        self.publish_ok.inc(1);
        info!(revision = %next, retired = retired.len(), "published revision");
        Ok(next)
    }

    async fn load_live(
        &self,
        aggregate: AggregateId,
        revision: Option<RevisionId>,
    ) -> Result<(RevisionId, Vec<ChunkMeta>)> {
        let state = self.state.lock();
        let revision = match revision {
            Some(r) => {
                ensure!(
                    r <= state.revision,
                    crate::UnknownRevisionSnafu { revision: r }
                );
                r
            }
            None => state.revision,
        };
        let live = state
            .chunks
            .values()
            .filter(|meta| meta.aggregate_id == aggregate && meta.is_live_at(revision))
            .cloned()
            .collect();
        Ok((revision, live))
    }
}
