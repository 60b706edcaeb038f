//! The in-memory view of an aggregation's live chunk set.
//!
//! The index is the read path's map and the consolidation planner's sensor:
//! it answers which chunks a predicate must touch, how badly chunk key
//! ranges overlap, and which chunks are worth consolidating next.
//!
//! Mutation is serialised with revision transitions: only
//! [`AggregationIndex::install`] replaces the state, and it installs a full
//! snapshot loaded from the catalog. Readers grab an [`IndexSnapshot`] once
//! per query and never take a lock again.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use data_types::{AggregateId, ChunkMeta, OverlapStatus, RevisionId};
use metric::{Metric, U64Gauge};
use observability_deps::tracing::debug;
use parking_lot::RwLock;
use predicate::KeyBounds;
use schema::PrimaryKey;
use std::sync::Arc;

/// An immutable view of the live chunk set at one revision.
#[derive(Debug)]
pub struct IndexSnapshot {
    aggregate: AggregateId,
    revision: RevisionId,
    /// Live chunks ordered by `(min_key, id)`.
    chunks: Vec<ChunkMeta>,
}

impl IndexSnapshot {
    /// The revision this snapshot was installed from.
    pub fn revision(&self) -> RevisionId {
        self.revision
    }

    /// The aggregation this snapshot belongs to.
    pub fn aggregate(&self) -> AggregateId {
        self.aggregate
    }

    /// All live chunks, ordered by `(min_key, id)`.
    pub fn chunks(&self) -> &[ChunkMeta] {
        &self.chunks
    }

    /// Every live chunk whose key envelope intersects `bounds`, in
    /// `(min_key, id)` order.
    pub fn chunks_covering(&self, bounds: &KeyBounds) -> Vec<ChunkMeta> {
        self.chunks
            .iter()
            .filter(|meta| bounds.overlaps(&meta.min_key, &meta.max_key))
            .cloned()
            .collect()
    }

    /// The maximum number of live chunks stacked over any single key point.
    ///
    /// Sweep-line over open/close events in key order; at equal keys opens
    /// count before closes so chunks touching at a boundary stack.
    pub fn max_stack_depth(&self) -> usize {
        self.deepest_point().map(|(depth, _)| depth).unwrap_or(0)
    }

    fn deepest_point(&self) -> Option<(usize, PrimaryKey)> {
        if self.chunks.is_empty() {
            return None;
        }
        // opens are already sorted by min_key; closes need their own order
        let mut closes: Vec<&PrimaryKey> = self.chunks.iter().map(|c| &c.max_key).collect();
        closes.sort();

        let mut depth = 0_usize;
        let mut best: Option<(usize, PrimaryKey)> = None;
        let mut close_idx = 0;
        for meta in &self.chunks {
            // close everything strictly below this open
            while close_idx < closes.len() && *closes[close_idx] < meta.min_key {
                depth -= 1;
                close_idx += 1;
            }
            depth += 1;
            if best.as_ref().map_or(true, |(d, _)| depth > *d) {
                best = Some((depth, meta.min_key.clone()));
            }
        }
        best
    }

    /// Classify the current stack depth against the given thresholds.
    pub fn overlap_status(&self, soft: usize, critical: usize) -> OverlapStatus {
        OverlapStatus::classify(self.max_stack_depth(), soft, critical)
    }

    /// Select chunks for the next consolidation.
    ///
    /// Picks the chunks covering the deepest stack point, grows the set
    /// with chunks overlapping the selected key span up to `max_chunks`,
    /// then closes the set over full containment: any chunk whose range
    /// lies inside the final span is included even past the cap, so no
    /// micro-chunk is orphaned between consolidated neighbours.
    ///
    /// Returns an empty set when the live set is already flat (no point is
    /// covered twice).
    pub fn pick_consolidation(&self, max_chunks: usize) -> Vec<ChunkMeta> {
        let (depth, point) = match self.deepest_point() {
            Some(found) => found,
            None => return vec![],
        };
        if depth < 2 || max_chunks < 2 {
            return vec![];
        }

        // seed: everything stacked over the deepest point
        let mut selected: Vec<&ChunkMeta> = self
            .chunks
            .iter()
            .filter(|c| c.min_key <= point && point <= c.max_key)
            .collect();
        if selected.len() > max_chunks {
            // cheapest members first: maximise overlap reduction per record
            // read
            selected.sort_by(|a, b| {
                a.record_count
                    .cmp(&b.record_count)
                    .then_with(|| a.id.cmp(&b.id))
            });
            selected.truncate(max_chunks);
        }

        let mut span_min = selected
            .iter()
            .map(|c| &c.min_key)
            .min()
            .expect("non-empty")
            .clone();
        let mut span_max = selected
            .iter()
            .map(|c| &c.max_key)
            .max()
            .expect("non-empty")
            .clone();

        // grow while overlapping neighbours fit under the cap
        loop {
            let mut grew = false;
            for candidate in &self.chunks {
                if selected.len() >= max_chunks {
                    break;
                }
                if selected.iter().any(|c| c.id == candidate.id) {
                    continue;
                }
                if candidate.overlaps(&span_min, &span_max) {
                    if candidate.min_key < span_min {
                        span_min = candidate.min_key.clone();
                    }
                    if candidate.max_key > span_max {
                        span_max = candidate.max_key.clone();
                    }
                    selected.push(candidate);
                    grew = true;
                }
            }
            if !grew || selected.len() >= max_chunks {
                break;
            }
        }

        // containment closure, allowed to exceed the cap
        for candidate in &self.chunks {
            if selected.iter().any(|c| c.id == candidate.id) {
                continue;
            }
            if span_min <= candidate.min_key && candidate.max_key <= span_max {
                selected.push(candidate);
            }
        }

        let mut picked: Vec<ChunkMeta> = selected.into_iter().cloned().collect();
        picked.sort_by(|a, b| a.min_key.cmp(&b.min_key).then_with(|| a.id.cmp(&b.id)));
        picked
    }
}

/// The mutable index: an atomically swappable [`IndexSnapshot`].
#[derive(Debug)]
pub struct AggregationIndex {
    aggregate: AggregateId,
    snapshot: RwLock<Arc<IndexSnapshot>>,
    live_chunks: U64Gauge,
}

impl AggregationIndex {
    /// Create an empty index at revision zero.
    pub fn new(aggregate: AggregateId, registry: &metric::Registry) -> Self {
        let gauge: Metric<U64Gauge> =
            registry.register_metric("index_live_chunks", "live chunks per aggregation");
        let mut attributes = metric::Attributes::default();
        attributes.insert("aggregate", aggregate.to_string());
        Self {
            aggregate,
            snapshot: RwLock::new(Arc::new(IndexSnapshot {
                aggregate,
                revision: RevisionId::ZERO,
                chunks: vec![],
            })),
            live_chunks: gauge.recorder(attributes),
        }
    }

    /// The aggregation this index serves.
    pub fn aggregate(&self) -> AggregateId {
        self.aggregate
    }

    /// Install the live set of a newly observed revision. `chunks` must be
    /// exactly the catalog's live set at `revision`; installs for stale
    /// revisions are ignored so a slow loader cannot roll the index back.
    pub fn install(&self, revision: RevisionId, mut chunks: Vec<ChunkMeta>) {
        let mut guard = self.snapshot.write();
        if revision < guard.revision {
            debug!(
                aggregate = %self.aggregate,
                stale = %revision,
                current = %guard.revision,
                "ignoring stale index install"
            );
            return;
        }
        chunks.sort_by(|a, b| a.min_key.cmp(&b.min_key).then_with(|| a.id.cmp(&b.id)));
        self.live_chunks.set(chunks.len() as u64);
        *guard = Arc::new(IndexSnapshot {
            aggregate: self.aggregate,
            revision,
            chunks,
        });
    }

    /// The current snapshot; queries hold it for their whole run.
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        Arc::clone(&self.snapshot.read())
    }
}
