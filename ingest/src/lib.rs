//! The write path: sort-merge ingestion of raw row streams into published
//! chunks.
//!
//! A [`SortMergeWriter`] drains bounded runs from its input, sorts each run
//! by primary key, collapses duplicate keys through the measure reducers and
//! emits every run as one or more immutable chunks (one per partition prefix
//! value when partitioning is on). An [`IngestJob`] wraps the writer with
//! the revision publication protocol: all chunks of one ingest become live
//! in a single catalog revision, retried with fresh chunk ids when a publish
//! races another publisher.
//!
//! Backpressure is pull-based: the writer only takes another row once the
//! previous one is buffered, and it suspends at run boundaries while chunk
//! bytes drain to the store. Cancellation is cooperative and observed at
//! the same points; a cancelled ingest publishes nothing and leaves only
//! unreferenced bytes for external garbage collection.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chunk_store::{ChunkStore, ChunkStoreError};
use cube_catalog::Catalog;
use data_types::{AggregateId, ChunkMeta, RevisionId};
use futures::{stream::BoxStream, StreamExt};
use metric::{Metric, U64Counter};
use observability_deps::tracing::{debug, info, warn};
use reduce::{FinaliseMode, MergeReducer, PlanCache, SourceKind};
use schema::{Record, Row, Schema};
use snafu::{ensure, ResultExt, Snafu};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

mod run;

/// Ingest errors.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("row does not conform to the aggregation schema: {}", source))]
    Schema { source: schema::Error },

    #[snafu(display("reduction failed: {}", source))]
    Reduce { source: reduce::Error },

    #[snafu(display("chunk store failure: {}", source))]
    Store { source: ChunkStoreError },

    #[snafu(display("catalog failure: {}", source))]
    Catalog { source: cube_catalog::Error },

    #[snafu(display("revision publish still conflicting after {} attempts", attempts))]
    PublishExhausted { attempts: usize },

    #[snafu(display("ingest cancelled"))]
    Cancelled,

    #[snafu(display(
        "partition prefix of {} exceeds {} declared dimensions",
        prefix,
        dims
    ))]
    InvalidPartitionPrefix { prefix: usize, dims: usize },

    #[snafu(display("pre-aggregated input is not sorted: {} follows {}", key, previous))]
    UnsortedInput { key: String, previous: String },

    #[snafu(display("upstream record source failed: {}", source))]
    Upstream {
        #[snafu(source(false))]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Convenience alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Record stream type accepted by the pre-aggregated write path.
pub type RecordResultStream<'a> =
    BoxStream<'a, Result<Record, Box<dyn std::error::Error + Send + Sync>>>;

/// Tuning knobs of the sort-merge writer.
#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    /// Maximum records buffered per run before a spill.
    pub spill_threshold: usize,
    /// Length of the leading key prefix to partition emitted runs on, if
    /// any. Must not exceed the schema's dimension count.
    pub partition_prefix: Option<usize>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            spill_threshold: 64 * 1024,
            partition_prefix: None,
        }
    }
}

#[derive(Debug, Clone)]
struct WriterMetrics {
    chunks_created: U64Counter,
    records_in: U64Counter,
    records_out: U64Counter,
}

impl WriterMetrics {
    fn new(registry: &metric::Registry) -> Self {
        let chunks: Metric<U64Counter> =
            registry.register_metric("ingest_chunks_created", "chunks emitted by the write path");
        let records: Metric<U64Counter> = registry.register_metric(
            "ingest_records",
            "records flowing through the write path by direction",
        );
        Self {
            chunks_created: chunks.recorder(&[("result", "sealed")]),
            records_in: records.recorder(&[("direction", "in")]),
            records_out: records.recorder(&[("direction", "out")]),
        }
    }
}

/// Buffers, sorts, reduces and emits chunks for one aggregation.
///
/// The writer holds at most one run in memory. It does not publish; callers
/// own the revision protocol so that ingest and consolidation can commit
/// differently shaped revisions over the same emission code.
#[derive(Debug)]
pub struct SortMergeWriter {
    aggregate: AggregateId,
    schema: Arc<Schema>,
    store: Arc<dyn ChunkStore>,
    catalog: Arc<dyn Catalog>,
    config: WriterConfig,
    shutdown: CancellationToken,
    plans: Arc<PlanCache>,
    metrics: WriterMetrics,
}

impl SortMergeWriter {
    /// Build a writer. Fails when the partition prefix is longer than the
    /// schema's key order; the prefix is a *leading* prefix by
    /// construction.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        aggregate: AggregateId,
        schema: Arc<Schema>,
        store: Arc<dyn ChunkStore>,
        catalog: Arc<dyn Catalog>,
        config: WriterConfig,
        plans: Arc<PlanCache>,
        registry: &metric::Registry,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        if let Some(prefix) = config.partition_prefix {
            ensure!(
                prefix <= schema.dimensions().len(),
                InvalidPartitionPrefixSnafu {
                    prefix,
                    dims: schema.dimensions().len()
                }
            );
        }
        Ok(Self {
            aggregate,
            schema,
            store,
            catalog,
            config,
            shutdown,
            plans,
            metrics: WriterMetrics::new(registry),
        })
    }

    fn reducer(&self, source: SourceKind) -> Result<MergeReducer> {
        let measures: Vec<usize> = (0..self.schema.measures().len()).collect();
        let plan = self
            .plans
            .get_or_compile(
                &self.schema,
                self.schema.dimensions().len(),
                &measures,
                source,
                FinaliseMode::Identity,
            )
            .context(ReduceSnafu)?;
        Ok(MergeReducer::new(plan))
    }

    /// Drain a raw row stream to completion, emitting a chunk set.
    ///
    /// Returns the metadata of every sealed chunk, in emission order. An
    /// empty input produces no chunks and succeeds.
    pub async fn write_rows(&self, mut rows: BoxStream<'_, Row>) -> Result<Vec<ChunkMeta>> {
        let reducer = self.reducer(SourceKind::Raw)?;
        let mut chunks = vec![];
        let mut exhausted = false;

        while !exhausted {
            let mut buffer = Vec::with_capacity(self.config.spill_threshold.min(1024));
            while buffer.len() < self.config.spill_threshold {
                let next = tokio::select! {
                    _ = self.shutdown.cancelled() => return CancelledSnafu.fail(),
                    next = rows.next() => next,
                };
                match next {
                    Some(row) => {
                        self.schema.validate_row(&row).context(SchemaSnafu)?;
                        self.metrics.records_in.inc(1);
                        buffer.push(row);
                    }
                    None => {
                        exhausted = true;
                        break;
                    }
                }
            }
            if buffer.is_empty() {
                break;
            }
            let record_run = run::build_run(buffer, &reducer)?;
            chunks.extend(self.emit_run(record_run).await?);
        }
        Ok(chunks)
    }

    /// Drain an already sorted stream of pre-aggregated records (the
    /// consolidation path), emitting a chunk set.
    ///
    /// Input must be non-decreasing in key; equal-key neighbours are
    /// collapsed. A run never ends inside an equal-key group, so emitted
    /// chunks cannot split a group across an envelope boundary.
    pub async fn write_records(&self, mut records: RecordResultStream<'_>) -> Result<Vec<ChunkMeta>> {
        let reducer = self.reducer(SourceKind::PreAggregated)?;
        let mut chunks = vec![];
        let mut pending: Option<Record> = None;
        let mut exhausted = false;

        while !exhausted {
            let mut buffer: Vec<Record> = Vec::with_capacity(self.config.spill_threshold.min(1024));
            if let Some(record) = pending.take() {
                buffer.push(record);
            }
            loop {
                let full = buffer.len() >= self.config.spill_threshold;
                let next = tokio::select! {
                    _ = self.shutdown.cancelled() => return CancelledSnafu.fail(),
                    next = records.next() => next,
                };
                let record = match next {
                    Some(result) => result.map_err(|source| Error::Upstream { source })?,
                    None => {
                        exhausted = true;
                        break;
                    }
                };
                self.schema.validate_record(&record).context(SchemaSnafu)?;
                self.metrics.records_in.inc(1);
                if let Some(last) = buffer.last() {
                    ensure!(
                        record.key >= last.key,
                        UnsortedInputSnafu {
                            key: record.key.to_string(),
                            previous: last.key.to_string()
                        }
                    );
                    // over threshold: only keep going while the key group is
                    // still open
                    if full && record.key > last.key {
                        pending = Some(record);
                        break;
                    }
                }
                buffer.push(record);
            }
            if buffer.is_empty() {
                break;
            }
            let record_run = run::reduce_sorted_records(buffer, &reducer)?;
            chunks.extend(self.emit_run(record_run).await?);
        }
        Ok(chunks)
    }

    /// Writes one sorted, duplicate-free run out as chunks, one per
    /// partition prefix value.
    async fn emit_run(&self, record_run: Vec<Record>) -> Result<Vec<ChunkMeta>> {
        let mut chunks = vec![];
        for part in run::split_run(record_run, self.config.partition_prefix) {
            if self.shutdown.is_cancelled() {
                return CancelledSnafu.fail();
            }
            let id = self
                .catalog
                .allocate_chunk_ids(1)
                .await
                .context(CatalogSnafu)?[0];

            let min_key = part.first().expect("split parts are non-empty").key.clone();
            let max_key = part.last().expect("split parts are non-empty").key.clone();
            let record_count = part.len() as u64;

            let mut sink = self
                .store
                .writer(id, Arc::clone(&self.schema))
                .await
                .context(StoreSnafu)?;
            for record in part {
                sink.push(record).await.context(StoreSnafu)?;
                self.metrics.records_out.inc(1);
            }
            sink.finish().await.context(StoreSnafu)?;
            self.metrics.chunks_created.inc(1);

            let meta = ChunkMeta::new(id, self.aggregate, min_key, max_key, record_count)
                .expect("runs are sorted and non-empty");
            debug!(
                aggregate = %self.aggregate,
                chunk_id = %id,
                records = record_count,
                min_key = %meta.min_key,
                max_key = %meta.max_key,
                "sealed chunk"
            );
            chunks.push(meta);
        }
        Ok(chunks)
    }

    /// Re-write the bytes of already sealed chunks under fresh ids, for
    /// publish retries. The original ids are left unpublished for garbage
    /// collection.
    async fn reissue_chunks(&self, chunks: Vec<ChunkMeta>) -> Result<Vec<ChunkMeta>> {
        let mut reissued = Vec::with_capacity(chunks.len());
        for mut meta in chunks {
            let fresh = self
                .catalog
                .allocate_chunk_ids(1)
                .await
                .context(CatalogSnafu)?[0];
            let mut source = self
                .store
                .reader(meta.id, Arc::clone(&self.schema))
                .await
                .context(StoreSnafu)?;
            let mut sink = self
                .store
                .writer(fresh, Arc::clone(&self.schema))
                .await
                .context(StoreSnafu)?;
            while let Some(record) = source.next().await {
                sink.push(record.context(StoreSnafu)?)
                    .await
                    .context(StoreSnafu)?;
            }
            sink.finish().await.context(StoreSnafu)?;
            meta.id = fresh;
            reissued.push(meta);
        }
        Ok(reissued)
    }
}

/// Publication policy of one ingest.
#[derive(Debug, Clone, Copy)]
pub struct IngestConfig {
    /// Writer tuning.
    pub writer: WriterConfig,
    /// Publish attempts before giving up on a conflicting catalog.
    pub max_publish_attempts: usize,
    /// Base sleep between conflicting publish attempts; doubled per retry.
    pub conflict_backoff: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            writer: WriterConfig::default(),
            max_publish_attempts: 3,
            conflict_backoff: Duration::from_millis(20),
        }
    }
}

/// What one completed ingest produced.
#[derive(Debug)]
pub struct IngestOutcome {
    /// Sealed chunk metadata, stamped with the publishing revision.
    pub chunks: Vec<ChunkMeta>,
    /// The published revision, or `None` for an empty ingest.
    pub revision: Option<RevisionId>,
}

/// One ingest: drain a row stream through a [`SortMergeWriter`] and publish
/// the produced chunk set as a single revision.
#[derive(Debug)]
pub struct IngestJob {
    writer: SortMergeWriter,
    catalog: Arc<dyn Catalog>,
    config: IngestConfig,
    shutdown: CancellationToken,
    publish_conflicts: U64Counter,
}

impl IngestJob {
    /// Build an ingest job for one aggregation.
    pub fn new(
        aggregate: AggregateId,
        schema: Arc<Schema>,
        store: Arc<dyn ChunkStore>,
        catalog: Arc<dyn Catalog>,
        config: IngestConfig,
        plans: Arc<PlanCache>,
        registry: &metric::Registry,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let conflicts: Metric<U64Counter> = registry.register_metric(
            "ingest_publish_conflicts",
            "ingest revision publishes that raced another publisher",
        );
        let writer = SortMergeWriter::new(
            aggregate,
            schema,
            store,
            Arc::clone(&catalog),
            config.writer,
            plans,
            registry,
            shutdown.clone(),
        )?;
        Ok(Self {
            writer,
            catalog,
            config,
            shutdown,
            publish_conflicts: conflicts.recorder(&[("path", "ingest")]),
        })
    }

    /// Drain `rows` and publish. On an empty input this is a no-op that
    /// publishes no revision.
    pub async fn run(&self, rows: BoxStream<'_, Row>) -> Result<IngestOutcome> {
        let mut chunks = self.writer.write_rows(rows).await?;
        if chunks.is_empty() {
            return Ok(IngestOutcome {
                chunks,
                revision: None,
            });
        }

        let mut attempt = 0;
        loop {
            if self.shutdown.is_cancelled() {
                return CancelledSnafu.fail();
            }
            attempt += 1;
            let based_on = self.catalog.begin_revision().await.context(CatalogSnafu)?;
            match self
                .catalog
                .publish(based_on, chunks.clone(), vec![])
                .await
            {
                Ok(revision) => {
                    for meta in &mut chunks {
                        meta.created_at = revision;
                    }
                    info!(
                        aggregate = %self.writer.aggregate,
                        revision = %revision,
                        chunks = chunks.len(),
                        "ingest published"
                    );
                    return Ok(IngestOutcome {
                        chunks,
                        revision: Some(revision),
                    });
                }
                Err(cube_catalog::Error::RevisionConflict { .. }) => {
                    self.publish_conflicts.inc(1);
                    ensure!(
                        attempt < self.config.max_publish_attempts,
                        PublishExhaustedSnafu { attempts: attempt }
                    );
                    warn!(
                        aggregate = %self.writer.aggregate,
                        attempt,
                        "ingest publish conflicted, reissuing chunk ids"
                    );
                    chunks = self.writer.reissue_chunks(chunks).await?;
                    tokio::time::sleep(self.config.conflict_backoff * (1 << (attempt - 1))).await;
                }
                Err(source) => return Err(Error::Catalog { source }),
            }
        }
    }
}
