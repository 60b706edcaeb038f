//! Background consolidation of overlapping chunks.
//!
//! The compactor watches one aggregation's chunk index, and whenever key
//! ranges stack up it rewrites a chosen chunk set into fewer, wider,
//! non-overlapping chunks: a full-key merge-reduce over the victims piped
//! back through the sort-merge writer, finished by one atomic revision that
//! retires the consumed chunks and creates their replacements.
//!
//! Readers are never disturbed: a query planned at an older revision keeps
//! reading the retired chunks, and ingest keeps publishing its own
//! revisions concurrently. A lost publish race simply aborts the round;
//! nothing was live yet, so the rewritten bytes are garbage for external
//! collection and the next round starts over.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chunk_index::AggregationIndex;
use chunk_store::ChunkStore;
use cube_catalog::Catalog;
use cube_query::MergeReader;
use data_types::AggregateId;
use futures::StreamExt;
use ingest::{SortMergeWriter, WriterConfig};
use metric::{Metric, U64Counter};
use observability_deps::tracing::{debug, info, warn};
use predicate::Predicate;
use reduce::{FinaliseMode, MergeReducer, PlanCache, SourceKind};
use schema::Schema;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

mod period;

pub use period::AdaptivePeriod;

/// Consolidation errors.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("merge over consolidation set failed: {0}")]
    Merge(#[from] cube_query::Error),

    #[error("rewrite of consolidation set failed: {0}")]
    Rewrite(#[from] ingest::Error),

    #[error("catalog failure: {0}")]
    Catalog(#[from] cube_catalog::Error),

    #[error("consolidation cancelled")]
    Cancelled,
}

/// Convenience alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Configuration recognised by the consolidation loop.
#[derive(Debug, Clone, Copy)]
pub struct CompactorConfig {
    /// Fastest loop cadence.
    pub period_min: Duration,
    /// Slowest loop cadence.
    pub period_max: Duration,
    /// Stack depth at which overlap pressure is soft.
    pub overlap_soft_threshold: usize,
    /// Stack depth at which overlap pressure is critical.
    pub overlap_critical_threshold: usize,
    /// Multiplicative period adjustment factor, `> 1`.
    pub period_multiplier: f64,
    /// Upper bound on chunks consumed per round (containment closure may
    /// exceed it).
    pub max_chunks_per_consolidation: usize,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            period_min: Duration::from_millis(500),
            period_max: Duration::from_secs(60),
            overlap_soft_threshold: 4,
            overlap_critical_threshold: 16,
            period_multiplier: 2.0,
            max_chunks_per_consolidation: 32,
        }
    }
}

/// What one consolidation round did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// The live set is already flat enough; nothing picked.
    NothingToDo,
    /// Chunks were rewritten and the revision swap committed.
    Consolidated {
        /// Chunks retired by the swap.
        consumed: usize,
        /// Chunks created by the swap.
        produced: usize,
    },
    /// Another publisher retired one of the picked chunks first; the round
    /// aborted without effect.
    LostRace,
}

#[derive(Debug)]
struct CompactorMetrics {
    rounds_ok: U64Counter,
    rounds_empty: U64Counter,
    rounds_conflict: U64Counter,
    rounds_error: U64Counter,
    rounds_skipped: U64Counter,
    chunks_consolidated: U64Counter,
}

impl CompactorMetrics {
    fn new(registry: &metric::Registry) -> Self {
        let rounds: Metric<U64Counter> =
            registry.register_metric("compactor_rounds", "consolidation rounds by outcome");
        let chunks: Metric<U64Counter> = registry.register_metric(
            "compactor_chunks_consolidated",
            "chunks retired by consolidation",
        );
        Self {
            rounds_ok: rounds.recorder(&[("outcome", "ok")]),
            rounds_empty: rounds.recorder(&[("outcome", "empty")]),
            rounds_conflict: rounds.recorder(&[("outcome", "conflict")]),
            rounds_error: rounds.recorder(&[("outcome", "error")]),
            rounds_skipped: rounds.recorder(&[("outcome", "skipped_critical")]),
            chunks_consolidated: chunks.recorder(&[("path", "background")]),
        }
    }
}

/// Consolidation planner and executor for one aggregation.
#[derive(Debug)]
pub struct Compactor {
    aggregate: AggregateId,
    schema: Arc<Schema>,
    index: Arc<AggregationIndex>,
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn ChunkStore>,
    plans: Arc<PlanCache>,
    config: CompactorConfig,
    writer: SortMergeWriter,
    shutdown: CancellationToken,
    metrics: CompactorMetrics,
}

impl Compactor {
    /// Build a compactor. The rewrite writer runs unpartitioned so that one
    /// round's output chunks stay pairwise non-overlapping.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        aggregate: AggregateId,
        schema: Arc<Schema>,
        index: Arc<AggregationIndex>,
        catalog: Arc<dyn Catalog>,
        store: Arc<dyn ChunkStore>,
        plans: Arc<PlanCache>,
        config: CompactorConfig,
        registry: &metric::Registry,
        shutdown: CancellationToken,
    ) -> Self {
        let writer = SortMergeWriter::new(
            aggregate,
            Arc::clone(&schema),
            Arc::clone(&store),
            Arc::clone(&catalog),
            WriterConfig::default(),
            Arc::clone(&plans),
            registry,
            shutdown.clone(),
        )
        .expect("unpartitioned writer config is always valid");

        Self {
            aggregate,
            schema,
            index,
            catalog,
            store,
            plans,
            config,
            writer,
            shutdown,
            metrics: CompactorMetrics::new(registry),
        }
    }

    /// The loop configuration.
    pub fn config(&self) -> &CompactorConfig {
        &self.config
    }

    /// Run one consolidation round against the current index snapshot.
    pub async fn consolidate_once(&self) -> Result<RoundOutcome> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let snapshot = self.index.snapshot();
        let picked = snapshot.pick_consolidation(self.config.max_chunks_per_consolidation);
        if picked.len() < 2 {
            self.metrics.rounds_empty.inc(1);
            return Ok(RoundOutcome::NothingToDo);
        }
        let based_on = snapshot.revision();
        debug!(
            aggregate = %self.aggregate,
            chunks = picked.len(),
            revision = %based_on,
            "consolidation round starting"
        );

        // full-key merge over the victims, no projection, no filter
        let dims = self.schema.dimensions().len();
        let measures: Vec<usize> = (0..self.schema.measures().len()).collect();
        let reducer = MergeReducer::new(
            self.plans
                .get_or_compile(
                    &self.schema,
                    dims,
                    &measures,
                    SourceKind::PreAggregated,
                    FinaliseMode::Identity,
                )
                .map_err(|source| cube_query::Error::Reduce { source })?,
        );

        let mut sources = Vec::with_capacity(picked.len());
        for meta in &picked {
            let stream = self
                .store
                .reader(meta.id, Arc::clone(&self.schema))
                .await
                .map_err(|source| cube_query::Error::Store { source })?;
            sources.push((meta.clone(), stream));
        }
        let dim_names: Vec<String> = self
            .schema
            .dimensions()
            .iter()
            .map(|d| d.name.clone())
            .collect();
        let reader =
            MergeReader::new(sources, reducer, dims, dim_names, Predicate::True).await?;

        // reader -> writer, one group at a time
        let merged = futures::stream::unfold(Some(reader), |state| async move {
            let mut reader = state?;
            match reader.next_group().await {
                Ok(Some(record)) => Some((Ok(record), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((
                    Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
                    None,
                )),
            }
        })
        .boxed();
        let produced = self.writer.write_records(merged).await?;

        let retired: Vec<_> = picked.iter().map(|c| c.id).collect();
        match self
            .catalog
            .publish(based_on, produced.clone(), retired)
            .await
        {
            Ok(revision) => {
                let (revision, live) = self
                    .catalog
                    .load_live(self.aggregate, Some(revision))
                    .await?;
                self.index.install(revision, live);
                self.metrics.rounds_ok.inc(1);
                self.metrics.chunks_consolidated.inc(picked.len() as u64);
                info!(
                    aggregate = %self.aggregate,
                    revision = %revision,
                    consumed = picked.len(),
                    produced = produced.len(),
                    "consolidation committed"
                );
                Ok(RoundOutcome::Consolidated {
                    consumed: picked.len(),
                    produced: produced.len(),
                })
            }
            Err(cube_catalog::Error::RevisionConflict { chunk_id, .. }) => {
                self.metrics.rounds_conflict.inc(1);
                warn!(
                    aggregate = %self.aggregate,
                    chunk = %chunk_id,
                    "consolidation lost a publish race, aborting round"
                );
                // resync so the next pick sees what actually happened
                let (revision, live) = self.catalog.load_live(self.aggregate, None).await?;
                self.index.install(revision, live);
                Ok(RoundOutcome::LostRace)
            }
            Err(source) => Err(Error::Catalog(source)),
        }
    }
}

/// Drives a [`Compactor`] on its adaptive period until shutdown.
pub async fn run_compactor(compactor: Arc<Compactor>, shutdown: CancellationToken) {
    let config = *compactor.config();
    let mut period = AdaptivePeriod::new(
        config.period_min,
        config.period_max,
        config.period_multiplier,
    );

    loop {
        if shutdown.is_cancelled() {
            info!(aggregate = %compactor.aggregate, "compactor shutdown");
            return;
        }

        let status = compactor.index.snapshot().overlap_status(
            config.overlap_soft_threshold,
            config.overlap_critical_threshold,
        );
        if period.observe(status) {
            match compactor.consolidate_once().await {
                Ok(outcome) => {
                    debug!(aggregate = %compactor.aggregate, ?status, ?outcome, "round done")
                }
                Err(Error::Cancelled) => return,
                Err(e) => {
                    // non-fatal: log, count, start over at the base cadence
                    compactor.metrics.rounds_error.inc(1);
                    warn!(aggregate = %compactor.aggregate, error = %e, "round failed");
                    period.reset();
                }
            }
        } else {
            compactor.metrics.rounds_skipped.inc(1);
            debug!(aggregate = %compactor.aggregate, "critical overlap, deferring round");
        }

        tokio::select!(
            _ = tokio::time::sleep(period.current()) => {},
            _ = shutdown.cancelled() => {},
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chunk_store::MemChunkStore;
    use cube_catalog::MemCatalog;
    use data_types::{ChunkMeta, RevisionId};
    use futures::TryStreamExt;
    use ingest::{IngestConfig, IngestJob};
    use schema::{KeyType, MeasureKind, MeasureValue, NumType, Record, Row, Value};

    fn schema() -> Arc<Schema> {
        Arc::new(
            Schema::builder()
                .dimension("site", KeyType::I32)
                .measure("clicks", MeasureKind::Sum(NumType::I64))
                .build()
                .unwrap(),
        )
    }

    struct Fixture {
        store: Arc<MemChunkStore>,
        catalog: Arc<MemCatalog>,
        registry: Arc<metric::Registry>,
        index: Arc<AggregationIndex>,
        plans: Arc<PlanCache>,
        shutdown: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(metric::Registry::new());
            Self {
                store: Arc::new(MemChunkStore::new()),
                catalog: Arc::new(MemCatalog::new(&registry)),
                index: Arc::new(AggregationIndex::new(AggregateId::new(1), &registry)),
                plans: Arc::new(PlanCache::new()),
                registry,
                shutdown: CancellationToken::new(),
            }
        }

        fn compactor(&self, config: CompactorConfig) -> Compactor {
            Compactor::new(
                AggregateId::new(1),
                schema(),
                Arc::clone(&self.index),
                Arc::clone(&self.catalog) as _,
                Arc::clone(&self.store) as _,
                Arc::clone(&self.plans),
                config,
                &self.registry,
                self.shutdown.clone(),
            )
        }

        /// Ingest one single-revision batch and refresh the index.
        async fn ingest(&self, rows: Vec<Row>) {
            let job = IngestJob::new(
                AggregateId::new(1),
                schema(),
                Arc::clone(&self.store) as _,
                Arc::clone(&self.catalog) as _,
                IngestConfig::default(),
                Arc::clone(&self.plans),
                &self.registry,
                CancellationToken::new(),
            )
            .unwrap();
            job.run(futures::stream::iter(rows).boxed()).await.unwrap();
            let (revision, live) = self
                .catalog
                .load_live(AggregateId::new(1), None)
                .await
                .unwrap();
            self.index.install(revision, live);
        }

        async fn read_all(&self, meta: &ChunkMeta) -> Vec<Record> {
            self.store
                .reader(meta.id, schema())
                .await
                .unwrap()
                .try_collect()
                .await
                .unwrap()
        }
    }

    fn row(site: i32, clicks: i64) -> Row {
        Row::new(vec![Value::I32(site)], vec![Value::I64(clicks)])
    }

    #[tokio::test]
    async fn flat_live_set_is_a_no_op() {
        test_helpers::maybe_start_logging();
        let fixture = Fixture::new();
        fixture.ingest(vec![row(1, 10), row(2, 5)]).await;

        let compactor = fixture.compactor(CompactorConfig::default());
        assert_matches!(
            compactor.consolidate_once().await.unwrap(),
            RoundOutcome::NothingToDo
        );
        // live set untouched
        let (_, live) = fixture
            .catalog
            .load_live(AggregateId::new(1), None)
            .await
            .unwrap();
        assert_eq!(live.len(), 1);
    }

    #[tokio::test]
    async fn overlapping_chunks_consolidate_into_one() {
        let fixture = Fixture::new();
        // five separate ingests over the same keys: five stacked chunks
        for _ in 0..5 {
            fixture.ingest(vec![row(1, 1), row(2, 2), row(3, 3)]).await;
        }
        assert_eq!(fixture.index.snapshot().max_stack_depth(), 5);

        let compactor = fixture.compactor(CompactorConfig::default());
        let outcome = compactor.consolidate_once().await.unwrap();
        assert_eq!(
            outcome,
            RoundOutcome::Consolidated {
                consumed: 5,
                produced: 1
            }
        );

        let snapshot = fixture.index.snapshot();
        assert_eq!(snapshot.chunks().len(), 1);
        assert_eq!(snapshot.max_stack_depth(), 1);

        // replacement carries the combined accumulators
        let records = fixture.read_all(&snapshot.chunks()[0]).await;
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].values, vec![MeasureValue::I64(5)]);
        assert_eq!(records[1].values, vec![MeasureValue::I64(10)]);
        assert_eq!(records[2].values, vec![MeasureValue::I64(15)]);

        // originals remain readable for old-revision readers
        let (_, old_live) = fixture
            .catalog
            .load_live(AggregateId::new(1), Some(RevisionId::new(5)))
            .await
            .unwrap();
        assert_eq!(old_live.len(), 5);
        for meta in &old_live {
            assert_eq!(fixture.read_all(meta).await.len(), 3);
        }
    }

    #[tokio::test]
    async fn consolidation_is_idempotent() {
        let fixture = Fixture::new();
        for _ in 0..3 {
            fixture.ingest(vec![row(1, 1)]).await;
        }
        let compactor = fixture.compactor(CompactorConfig::default());
        assert_matches!(
            compactor.consolidate_once().await.unwrap(),
            RoundOutcome::Consolidated { .. }
        );
        let after_first = fixture.index.snapshot();
        assert_matches!(
            compactor.consolidate_once().await.unwrap(),
            RoundOutcome::NothingToDo
        );
        // the surviving chunk is untouched, same id and bytes
        let after_second = fixture.index.snapshot();
        assert_eq!(after_first.chunks()[0].id, after_second.chunks()[0].id);
        assert!(Arc::ptr_eq(
            &fixture.store.raw_bytes(after_first.chunks()[0].id).unwrap(),
            &fixture.store.raw_bytes(after_second.chunks()[0].id).unwrap(),
        ));
    }

    #[tokio::test]
    async fn lost_publish_race_aborts_the_round() {
        let fixture = Fixture::new();
        for _ in 0..3 {
            fixture.ingest(vec![row(1, 1), row(2, 2)]).await;
        }

        // a rival consolidator with its own index view of the same catalog
        let rival_index = Arc::new(AggregationIndex::new(
            AggregateId::new(1),
            &fixture.registry,
        ));
        let (revision, live) = fixture
            .catalog
            .load_live(AggregateId::new(1), None)
            .await
            .unwrap();
        rival_index.install(revision, live);
        let rival = Compactor::new(
            AggregateId::new(1),
            schema(),
            Arc::clone(&rival_index),
            Arc::clone(&fixture.catalog) as _,
            Arc::clone(&fixture.store) as _,
            Arc::clone(&fixture.plans),
            CompactorConfig::default(),
            &fixture.registry,
            CancellationToken::new(),
        );
        assert_matches!(
            rival.consolidate_once().await.unwrap(),
            RoundOutcome::Consolidated { .. }
        );

        // our compactor still plans against the pre-race snapshot and must
        // lose the publish cleanly
        let compactor = fixture.compactor(CompactorConfig::default());
        assert_matches!(
            compactor.consolidate_once().await.unwrap(),
            RoundOutcome::LostRace
        );

        // only the rival's replacement is live, and the loser resynced
        let (_, live) = fixture
            .catalog
            .load_live(AggregateId::new(1), None)
            .await
            .unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(fixture.index.snapshot().chunks().len(), 1);
        assert_matches!(
            compactor.consolidate_once().await.unwrap(),
            RoundOutcome::NothingToDo
        );
    }

    #[tokio::test]
    async fn cancellation_stops_rounds() {
        let fixture = Fixture::new();
        fixture.ingest(vec![row(1, 1)]).await;
        let compactor = fixture.compactor(CompactorConfig::default());
        fixture.shutdown.cancel();
        assert_matches!(compactor.consolidate_once().await, Err(Error::Cancelled));
    }

    #[tokio::test]
    async fn background_loop_drains_overlap_and_shuts_down() {
        let fixture = Fixture::new();
        for _ in 0..4 {
            fixture.ingest(vec![row(1, 1), row(2, 1)]).await;
        }

        let config = CompactorConfig {
            period_min: Duration::from_millis(5),
            period_max: Duration::from_millis(50),
            ..Default::default()
        };
        let compactor = Arc::new(fixture.compactor(config));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_compactor(Arc::clone(&compactor), shutdown.clone()));

        // wait for the loop to flatten the live set
        for _ in 0..100 {
            if fixture.index.snapshot().max_stack_depth() <= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fixture.index.snapshot().max_stack_depth(), 1);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
