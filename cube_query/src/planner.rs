//! Aggregation selection and plan execution.
//!
//! Planning picks the cheapest registered aggregation whose dimensions and
//! measures cover the query, snapshots its index, and narrows the chunk set
//! with the predicate's key bounds. Execution opens one chunk reader per
//! selected chunk and drives the merge, attaching an extra in-memory
//! sort-merge pass only when the requested dimension order is not a prefix
//! of the chosen aggregation's key order.

use crate::{
    merge::MergeReader, DeadlineExceededSnafu, Error, NoCoveringAggregationSnafu, PredicateSnafu,
    ReduceSnafu, Result, StoreSnafu, UnknownDimensionSnafu, UnknownMeasureSnafu,
};
use chunk_index::AggregationIndex;
use chunk_store::ChunkStore;
use cube_time::{Time, TimeProvider};
use data_types::{AggregateId, ChunkMeta, RevisionId};
use futures::stream::BoxStream;
use futures::StreamExt;
use metric::{Metric, U64Counter};
use observability_deps::tracing::debug;
use predicate::Predicate;
use reduce::{FinaliseMode, MeasureOp, MergeReducer, PlanCache, SourceKind};
use schema::{PrimaryKey, Record, Schema};
use snafu::{ensure, OptionExt, ResultExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One query against a table's aggregations.
#[derive(Debug, Clone)]
pub struct Query {
    /// Output grouping dimensions, in requested order.
    pub dimensions: Vec<String>,
    /// Requested measures, in requested order.
    pub measures: Vec<String>,
    /// Row filter; also drives chunk selection.
    pub predicate: Predicate,
    /// Groups to skip before emitting.
    pub offset: usize,
    /// Maximum groups to emit.
    pub limit: Option<usize>,
    /// Absolute deadline checked at group boundaries.
    pub deadline: Option<Time>,
    /// Project sketch measures (`hyperloglog`, `set_union`) as their scalar
    /// summaries instead of raw accumulators.
    pub summarise_sketches: bool,
}

impl Query {
    /// A full-scan query over the given dimensions and measures.
    pub fn new(
        dimensions: impl IntoIterator<Item = impl Into<String>>,
        measures: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            dimensions: dimensions.into_iter().map(Into::into).collect(),
            measures: measures.into_iter().map(Into::into).collect(),
            predicate: Predicate::True,
            offset: 0,
            limit: None,
            deadline: None,
            summarise_sketches: false,
        }
    }

    /// Replace the predicate.
    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    /// Skip the first `offset` groups.
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Emit at most `limit` groups.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Abort with a deadline error once `deadline` passes.
    pub fn with_deadline(mut self, deadline: Time) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// A registered aggregation: schema plus live-chunk index.
#[derive(Debug, Clone)]
pub struct Aggregation {
    /// Stable id; the planner's tie-break.
    pub id: AggregateId,
    /// The aggregation's schema.
    pub schema: Arc<Schema>,
    /// The aggregation's chunk index.
    pub index: Arc<AggregationIndex>,
}

/// The resolved execution strategy for one query.
#[derive(Debug)]
pub struct QueryPlan {
    /// Chosen aggregation.
    pub aggregate: AggregateId,
    /// Schema of the chosen aggregation.
    pub schema: Arc<Schema>,
    /// Revision the plan reads at.
    pub revision: RevisionId,
    /// Chunks the merge will open, in `(min_key, id)` order.
    pub chunks: Vec<ChunkMeta>,
    /// `Some(len)` when the query dimensions are a prefix of the
    /// aggregation key order; `None` forces a post-sort pass.
    pub prefix_len: Option<usize>,
    /// Selected measure positions in the aggregation schema.
    pub measure_selection: Vec<usize>,
    /// Positions of the query dimensions in the aggregation key order.
    pub dimension_positions: Vec<usize>,
    /// Planner cost of the chosen aggregation, log2 of the estimated group
    /// domain.
    pub cost_log2: f64,
}

/// Plans and executes queries over a set of aggregations.
#[derive(Debug)]
pub struct QueryPlanner {
    aggregations: Vec<Aggregation>,
    store: Arc<dyn ChunkStore>,
    plans: Arc<PlanCache>,
    time_provider: Arc<dyn TimeProvider>,
    chunks_read: U64Counter,
    queries: U64Counter,
}

impl QueryPlanner {
    /// Build a planner over `aggregations` (at least one).
    pub fn new(
        aggregations: Vec<Aggregation>,
        store: Arc<dyn ChunkStore>,
        plans: Arc<PlanCache>,
        time_provider: Arc<dyn TimeProvider>,
        registry: &metric::Registry,
    ) -> Self {
        let chunks: Metric<U64Counter> =
            registry.register_metric("query_chunks_read", "chunks opened by query execution");
        let queries: Metric<U64Counter> =
            registry.register_metric("query_count", "queries planned by outcome");
        Self {
            aggregations,
            store,
            plans,
            time_provider,
            chunks_read: chunks.recorder(&[("path", "merge")]),
            queries: queries.recorder(&[("outcome", "planned")]),
        }
    }

    /// Choose the cheapest covering aggregation and resolve the chunk set.
    pub fn plan(&self, query: &Query) -> Result<QueryPlan> {
        ensure!(
            !query.dimensions.is_empty(),
            NoCoveringAggregationSnafu {
                detail: "query selects no dimensions"
            }
        );

        // names must exist *somewhere* before coverage is considered, so a
        // typo surfaces as the right error instead of "no aggregation"
        let known_dim = |name: &str| {
            self.aggregations
                .iter()
                .any(|a| a.schema.dimension_index(name).is_some())
        };
        let known_measure = |name: &str| {
            self.aggregations
                .iter()
                .any(|a| a.schema.measure_index(name).is_some())
        };
        for name in &query.dimensions {
            ensure!(known_dim(name), UnknownDimensionSnafu { name: name.as_str() });
        }
        for name in query.predicate.dimensions() {
            ensure!(known_dim(name), UnknownDimensionSnafu { name });
        }
        for name in &query.measures {
            ensure!(known_measure(name), UnknownMeasureSnafu { name: name.as_str() });
        }

        let mut best: Option<QueryPlan> = None;
        for aggregation in &self.aggregations {
            let schema = &aggregation.schema;
            let covers_dims = query
                .dimensions
                .iter()
                .all(|d| schema.dimension_index(d).is_some())
                && query
                    .predicate
                    .dimensions()
                    .iter()
                    .all(|d| schema.dimension_index(d).is_some());
            let covers_measures = query
                .measures
                .iter()
                .all(|m| schema.measure_index(m).is_some());
            if !covers_dims || !covers_measures {
                continue;
            }

            let bounds = query.predicate.key_bounds(schema).context(PredicateSnafu)?;
            let total: f64 = schema
                .dimensions()
                .iter()
                .map(|d| d.key_type.domain_size_log2())
                .sum();
            let fixed: f64 = schema.dimensions()[..bounds.prefix.len()]
                .iter()
                .map(|d| d.key_type.domain_size_log2())
                .sum();
            let cost_log2 = total - fixed;

            let better = match &best {
                Some(current) => {
                    cost_log2 < current.cost_log2
                        || (cost_log2 == current.cost_log2 && aggregation.id < current.aggregate)
                }
                None => true,
            };
            if !better {
                continue;
            }

            let snapshot = aggregation.index.snapshot();
            let chunks = snapshot.chunks_covering(&bounds);

            let prefix_len = query
                .dimensions
                .iter()
                .enumerate()
                .all(|(i, name)| {
                    schema
                        .dimensions()
                        .get(i)
                        .map_or(false, |spec| spec.name == *name)
                })
                .then_some(query.dimensions.len());

            best = Some(QueryPlan {
                aggregate: aggregation.id,
                schema: Arc::clone(schema),
                revision: snapshot.revision(),
                chunks,
                prefix_len,
                measure_selection: query
                    .measures
                    .iter()
                    .map(|m| schema.measure_index(m).expect("coverage checked"))
                    .collect(),
                dimension_positions: query
                    .dimensions
                    .iter()
                    .map(|d| schema.dimension_index(d).expect("coverage checked"))
                    .collect(),
                cost_log2,
            });
        }

        let plan = best.context(NoCoveringAggregationSnafu {
            detail: "no aggregation covers the requested dimension and measure set",
        })?;
        debug!(
            aggregate = %plan.aggregate,
            revision = %plan.revision,
            chunks = plan.chunks.len(),
            cost_log2 = plan.cost_log2,
            post_sort = plan.prefix_len.is_none(),
            "query planned"
        );
        self.queries.inc(1);
        Ok(plan)
    }

    /// Plan and execute, returning the result stream.
    pub async fn execute(
        &self,
        query: &Query,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<Record>>> {
        let plan = self.plan(query)?;
        self.execute_plan(query, plan, cancel).await
    }

    /// Execute a previously built plan.
    pub async fn execute_plan(
        &self,
        query: &Query,
        plan: QueryPlan,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<Record>>> {
        let dim_names: Vec<String> = plan
            .schema
            .dimensions()
            .iter()
            .map(|d| d.name.clone())
            .collect();

        let merge_key_len = plan
            .prefix_len
            .unwrap_or_else(|| plan.schema.dimensions().len());
        let reducer = MergeReducer::new(
            self.plans
                .get_or_compile(
                    &plan.schema,
                    merge_key_len,
                    &plan.measure_selection,
                    SourceKind::PreAggregated,
                    FinaliseMode::Identity,
                )
                .context(ReduceSnafu)?,
        );

        let mut sources = Vec::with_capacity(plan.chunks.len());
        for meta in &plan.chunks {
            let stream = self
                .store
                .reader(meta.id, Arc::clone(&plan.schema))
                .await
                .context(StoreSnafu)?;
            sources.push((meta.clone(), stream));
        }
        self.chunks_read.inc(sources.len() as u64);

        let reader = MergeReader::new(
            sources,
            reducer,
            merge_key_len,
            dim_names,
            query.predicate.clone(),
        )
        .await?;

        let summary_ops: Option<Vec<MeasureOp>> = query.summarise_sketches.then(|| {
            plan.measure_selection
                .iter()
                .map(|&i| MeasureOp::new(plan.schema.measures()[i].kind))
                .collect()
        });

        match plan.prefix_len {
            Some(_) => {
                let state = StreamState {
                    reader,
                    offset: query.offset,
                    limit: query.limit,
                    deadline: query.deadline,
                    time_provider: Arc::clone(&self.time_provider),
                    cancel,
                    summary_ops,
                };
                Ok(futures::stream::try_unfold(state, |mut state| async move {
                    loop {
                        state.check_interrupts()?;
                        if state.limit == Some(0) {
                            return Ok(None);
                        }
                        let record = match state.reader.next_group().await? {
                            Some(record) => record,
                            None => return Ok(None),
                        };
                        if state.offset > 0 {
                            state.offset -= 1;
                            continue;
                        }
                        if let Some(limit) = &mut state.limit {
                            *limit -= 1;
                        }
                        let record = state.summarise(record);
                        return Ok(Some((record, state)));
                    }
                })
                .boxed())
            }
            None => {
                // requested order is not a prefix of the aggregation key
                // order: merge on the full key, then sort-merge the groups
                // into the requested order in memory
                let records = self
                    .post_sorted(query, &plan, reader, cancel)
                    .await?;
                let limited: Vec<Result<Record>> = records
                    .into_iter()
                    .skip(query.offset)
                    .take(query.limit.unwrap_or(usize::MAX))
                    .map(|record| {
                        Ok(match &summary_ops {
                            Some(ops) => summarise_record(record, ops),
                            None => record,
                        })
                    })
                    .collect();
                Ok(futures::stream::iter(limited).boxed())
            }
        }
    }

    /// Drives the full-key merge to completion, projects keys onto the
    /// requested dimension order, and re-reduces equal projected keys.
    async fn post_sorted(
        &self,
        query: &Query,
        plan: &QueryPlan,
        mut reader: MergeReader,
        cancel: CancellationToken,
    ) -> Result<Vec<Record>> {
        let ops: Vec<MeasureOp> = plan
            .measure_selection
            .iter()
            .map(|&i| MeasureOp::new(plan.schema.measures()[i].kind))
            .collect();

        let mut projected: Vec<Record> = vec![];
        while let Some(record) = reader.next_group().await? {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if let (Some(deadline), now) = (query.deadline, self.time_provider.now()) {
                ensure!(now <= deadline, DeadlineExceededSnafu);
            }
            let key = PrimaryKey::new(
                plan.dimension_positions
                    .iter()
                    .map(|&p| record.key.values()[p].clone())
                    .collect(),
            );
            projected.push(Record::new(key, record.values));
        }
        projected.sort_by(|a, b| a.key.cmp(&b.key));

        let mut out: Vec<Record> = Vec::with_capacity(projected.len());
        for record in projected {
            match out.last_mut() {
                Some(last) if last.key == record.key => {
                    for ((slot, next), op) in last
                        .values
                        .iter_mut()
                        .zip(record.values.iter())
                        .zip(ops.iter())
                    {
                        op.reduce_accs(slot, next).context(ReduceSnafu)?;
                    }
                }
                _ => out.push(record),
            }
        }
        Ok(out)
    }
}

fn summarise_record(mut record: Record, ops: &[MeasureOp]) -> Record {
    record.values = record
        .values
        .into_iter()
        .zip(ops.iter())
        .map(|(value, op)| op.summarise(value))
        .collect();
    record
}

struct StreamState {
    reader: MergeReader,
    offset: usize,
    limit: Option<usize>,
    deadline: Option<Time>,
    time_provider: Arc<dyn TimeProvider>,
    cancel: CancellationToken,
    summary_ops: Option<Vec<MeasureOp>>,
}

impl StreamState {
    fn check_interrupts(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            ensure!(self.time_provider.now() <= deadline, DeadlineExceededSnafu);
        }
        Ok(())
    }

    fn summarise(&self, record: Record) -> Record {
        match &self.summary_ops {
            Some(ops) => summarise_record(record, ops),
            None => record,
        }
    }
}
