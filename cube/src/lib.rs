//! The aggregation cube service.
//!
//! A [`Cube`] owns the catalog, the chunk store and one index per
//! registered aggregation, and exposes the three data-plane operations:
//! ingest a row stream, answer a query, and consolidate overlapping chunks
//! (one-shot or as a background loop).
//!
//! The cube itself holds no global state beyond its constructor arguments
//! `(store, catalog, clock)`; every instance is independently wired, which
//! keeps tests hermetic and lets several tables coexist in one process.
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
use compactor::{run_compactor, Compactor, CompactorConfig, RoundOutcome};
use cube_catalog::Catalog;
use cube_query::{Aggregation, Query, QueryPlan, QueryPlanner};
use cube_time::TimeProvider;
use data_types::{AggregateId, OverlapStatus, RevisionId};
use futures::stream::BoxStream;
use ingest::{IngestConfig, IngestJob, IngestOutcome};
use observability_deps::tracing::info;
use parking_lot::RwLock;
use reduce::PlanCache;
use schema::{Record, Row, Schema};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Top-level service errors.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("aggregation {0} is not registered")]
    UnknownAggregation(AggregateId),

    #[error("invalid schema: {0}")]
    Schema(#[from] schema::Error),

    #[error(transparent)]
    Ingest(#[from] ingest::Error),

    #[error(transparent)]
    Query(#[from] cube_query::Error),

    #[error(transparent)]
    Consolidation(#[from] compactor::Error),

    #[error("catalog failure: {0}")]
    Catalog(#[from] cube_catalog::Error),
}

/// Convenience alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A running background compactor, stopped on request or on drop.
#[derive(Debug)]
pub struct CompactorHandle {
    shutdown: CancellationToken,
    join: Option<tokio::task::JoinHandle<()>>,
}

impl CompactorHandle {
    /// Signal the loop and wait for it to exit.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl Drop for CompactorHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[derive(Debug)]
struct AggregateState {
    schema: Arc<Schema>,
    index: Arc<AggregationIndex>,
}

/// One aggregated table: a set of aggregations over shared storage.
#[derive(Debug)]
pub struct Cube {
    store: Arc<dyn ChunkStore>,
    catalog: Arc<dyn Catalog>,
    time_provider: Arc<dyn TimeProvider>,
    registry: Arc<metric::Registry>,
    plans: Arc<PlanCache>,
    aggregates: RwLock<Vec<(AggregateId, AggregateState)>>,
}

impl Cube {
    /// Wire a cube over its collaborators.
    pub fn new(
        store: Arc<dyn ChunkStore>,
        catalog: Arc<dyn Catalog>,
        time_provider: Arc<dyn TimeProvider>,
        registry: Arc<metric::Registry>,
    ) -> Self {
        Self {
            store,
            catalog,
            time_provider,
            registry,
            plans: Arc::new(PlanCache::new()),
            aggregates: RwLock::new(vec![]),
        }
    }

    /// Register an aggregation under the next free id and return it.
    pub fn register_aggregation(&self, schema: Schema) -> AggregateId {
        let mut aggregates = self.aggregates.write();
        let id = AggregateId::new(aggregates.len() as u32 + 1);
        let state = AggregateState {
            schema: Arc::new(schema),
            index: Arc::new(AggregationIndex::new(id, &self.registry)),
        };
        info!(aggregate = %id, "registered aggregation");
        aggregates.push((id, state));
        id
    }

    fn state(&self, aggregate: AggregateId) -> Result<(Arc<Schema>, Arc<AggregationIndex>)> {
        let aggregates = self.aggregates.read();
        aggregates
            .iter()
            .find(|(id, _)| *id == aggregate)
            .map(|(_, s)| (Arc::clone(&s.schema), Arc::clone(&s.index)))
            .ok_or(Error::UnknownAggregation(aggregate))
    }

    /// Reload an aggregation's live set from the catalog into its index.
    pub async fn refresh_index(&self, aggregate: AggregateId) -> Result<RevisionId> {
        let (_, index) = self.state(aggregate)?;
        let (revision, live) = self.catalog.load_live(aggregate, None).await?;
        index.install(revision, live);
        Ok(revision)
    }

    /// Ingest a row stream into one aggregation; all produced chunks become
    /// live in a single revision.
    pub async fn ingest(
        &self,
        aggregate: AggregateId,
        rows: BoxStream<'_, Row>,
        config: IngestConfig,
        cancel: CancellationToken,
    ) -> Result<IngestOutcome> {
        let (schema, _) = self.state(aggregate)?;
        let job = IngestJob::new(
            aggregate,
            schema,
            Arc::clone(&self.store),
            Arc::clone(&self.catalog),
            config,
            Arc::clone(&self.plans),
            &self.registry,
            cancel,
        )?;
        let outcome = job.run(rows).await?;
        if outcome.revision.is_some() {
            self.refresh_index(aggregate).await?;
        }
        Ok(outcome)
    }

    fn planner(&self) -> QueryPlanner {
        let aggregations: Vec<Aggregation> = self
            .aggregates
            .read()
            .iter()
            .map(|(id, state)| Aggregation {
                id: *id,
                schema: Arc::clone(&state.schema),
                index: Arc::clone(&state.index),
            })
            .collect();
        QueryPlanner::new(
            aggregations,
            Arc::clone(&self.store),
            Arc::clone(&self.plans),
            Arc::clone(&self.time_provider),
            &self.registry,
        )
    }

    /// Plan a query without executing it.
    pub fn plan(&self, query: &Query) -> Result<QueryPlan> {
        Ok(self.planner().plan(query)?)
    }

    /// Execute a query, returning the reduced record stream.
    pub async fn query(
        &self,
        query: &Query,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, cube_query::Result<Record>>> {
        Ok(self.planner().execute(query, cancel).await?)
    }

    /// Execute a query and collect the full result.
    pub async fn query_collect(&self, query: &Query) -> Result<Vec<Record>> {
        use futures::TryStreamExt;
        let stream = self.query(query, CancellationToken::new()).await?;
        Ok(stream.try_collect().await.map_err(Error::Query)?)
    }

    /// Current overlap pressure of one aggregation.
    pub fn overlap_status(
        &self,
        aggregate: AggregateId,
        soft: usize,
        critical: usize,
    ) -> Result<OverlapStatus> {
        let (_, index) = self.state(aggregate)?;
        Ok(index.snapshot().overlap_status(soft, critical))
    }

    fn compactor(
        &self,
        aggregate: AggregateId,
        config: CompactorConfig,
        shutdown: CancellationToken,
    ) -> Result<Compactor> {
        let (schema, index) = self.state(aggregate)?;
        Ok(Compactor::new(
            aggregate,
            schema,
            index,
            Arc::clone(&self.catalog),
            Arc::clone(&self.store),
            Arc::clone(&self.plans),
            config,
            &self.registry,
            shutdown,
        ))
    }

    /// Run one consolidation round now.
    pub async fn consolidate_once(
        &self,
        aggregate: AggregateId,
        config: CompactorConfig,
    ) -> Result<RoundOutcome> {
        let compactor = self.compactor(aggregate, config, CancellationToken::new())?;
        Ok(compactor.consolidate_once().await?)
    }

    /// Spawn the adaptive background consolidation loop.
    pub fn start_compactor(
        &self,
        aggregate: AggregateId,
        config: CompactorConfig,
    ) -> Result<CompactorHandle> {
        let shutdown = CancellationToken::new();
        let compactor = Arc::new(self.compactor(aggregate, config, shutdown.clone())?);
        let join = tokio::spawn(run_compactor(compactor, shutdown.clone()));
        Ok(CompactorHandle {
            shutdown,
            join: Some(join),
        })
    }

    /// The metric registry every subsystem reports into.
    pub fn metric_registry(&self) -> &Arc<metric::Registry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunk_store::MemChunkStore;
    use cube_catalog::MemCatalog;
    use cube_time::SystemProvider;
    use schema::{KeyType, MeasureKind, NumType};

    fn cube() -> Cube {
        let registry = Arc::new(metric::Registry::new());
        Cube::new(
            Arc::new(MemChunkStore::new()),
            Arc::new(MemCatalog::new(&registry)),
            Arc::new(SystemProvider::new()),
            registry,
        )
    }

    fn schema() -> Schema {
        Schema::builder()
            .dimension("d", KeyType::I32)
            .measure("m", MeasureKind::Sum(NumType::I64))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn unknown_aggregation_is_rejected() {
        let cube = cube();
        let err = cube.refresh_index(AggregateId::new(9)).await.unwrap_err();
        assert!(matches!(err, Error::UnknownAggregation(_)));
    }

    #[tokio::test]
    async fn registration_hands_out_sequential_ids() {
        let cube = cube();
        let a = cube.register_aggregation(schema());
        let b = cube.register_aggregation(schema());
        assert_ne!(a, b);
        assert!(cube.overlap_status(a, 2, 4).is_ok());
        assert!(cube.overlap_status(b, 2, 4).is_ok());
    }
}
