//! K-way merge-reduce over sorted chunk record streams.
//!
//! Every open chunk reader sits behind a cursor holding its current record.
//! A min-heap keyed by the record key's `K`-prefix (tie-broken by cursor
//! position, so merges are deterministic) yields one *group* at a time: all
//! records across all cursors sharing the `K`-projection. Each group is
//! folded through the [`MergeReducer`] into a single output record.
//!
//! Records are filtered against the query predicate on the way *in*, while
//! the full primary key is still present, so predicates over dimensions
//! outside the projection stay exact.

use crate::{IntegritySnafu, ReduceSnafu, Result, StoreSnafu};
use chunk_store::RecordStream;
use data_types::ChunkMeta;
use futures::StreamExt;
use predicate::Predicate;
use reduce::MergeReducer;
use schema::{PrimaryKey, Record};
use snafu::{ensure, ResultExt};
use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
};

/// One chunk reader plus its read position.
struct Cursor {
    stream: RecordStream,
    current: Option<Record>,
    /// Envelope from the catalog, re-checked against every record.
    min_key: PrimaryKey,
    max_key: PrimaryKey,
    last_key: Option<PrimaryKey>,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("current", &self.current)
            .field("min_key", &self.min_key)
            .field("max_key", &self.max_key)
            .finish_non_exhaustive()
    }
}

impl Cursor {
    /// Advance to the next record matching `filter`, verifying stored order
    /// and the catalog envelope on the way.
    async fn advance(&mut self, dim_names: &[&str], filter: &Predicate) -> Result<()> {
        loop {
            let record = match self.stream.next().await {
                Some(record) => record.context(StoreSnafu)?,
                None => {
                    self.current = None;
                    return Ok(());
                }
            };

            ensure!(
                record.key >= self.min_key && record.key <= self.max_key,
                IntegritySnafu {
                    reason: format!(
                        "record key {} outside chunk envelope [{}, {}]",
                        record.key, self.min_key, self.max_key
                    )
                }
            );
            if let Some(last) = &self.last_key {
                ensure!(
                    record.key > *last,
                    IntegritySnafu {
                        reason: format!(
                            "record key {} not above predecessor {}",
                            record.key, last
                        )
                    }
                );
            }
            self.last_key = Some(record.key.clone());

            if filter
                .matches(dim_names, &record.key)
                .context(crate::PredicateSnafu)?
            {
                self.current = Some(record);
                return Ok(());
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    prefix: PrimaryKey,
    cursor: usize,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.prefix
            .cmp(&other.prefix)
            .then_with(|| self.cursor.cmp(&other.cursor))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Streaming k-way merge with group-by-key reduction.
#[derive(Debug)]
pub struct MergeReader {
    cursors: Vec<Cursor>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    reducer: MergeReducer,
    key_len: usize,
    dim_names: Vec<String>,
    filter: Predicate,
}

impl MergeReader {
    /// Open a merge over `sources`. `dim_names` is the source aggregation's
    /// full dimension list in key order; `key_len` is the length of the
    /// grouping prefix `K`.
    ///
    /// Sources must be ordered consistently with the plan's chunk list,
    /// since the cursor position is the deterministic tie-break.
    pub async fn new(
        sources: Vec<(ChunkMeta, RecordStream)>,
        reducer: MergeReducer,
        key_len: usize,
        dim_names: Vec<String>,
        filter: Predicate,
    ) -> Result<Self> {
        let mut cursors = Vec::with_capacity(sources.len());
        for (meta, stream) in sources {
            cursors.push(Cursor {
                stream,
                current: None,
                min_key: meta.min_key,
                max_key: meta.max_key,
                last_key: None,
            });
        }

        let names: Vec<&str> = dim_names.iter().map(String::as_str).collect();
        let mut heap = BinaryHeap::with_capacity(cursors.len());
        for (index, cursor) in cursors.iter_mut().enumerate() {
            cursor.advance(&names, &filter).await?;
            if let Some(record) = &cursor.current {
                heap.push(Reverse(HeapEntry {
                    prefix: record.key.prefix(key_len),
                    cursor: index,
                }));
            }
        }

        Ok(Self {
            cursors,
            heap,
            reducer,
            key_len,
            dim_names,
            filter,
        })
    }

    /// Produce the next reduced group, or `None` when every source is
    /// drained.
    pub async fn next_group(&mut self) -> Result<Option<Record>> {
        let first = match self.heap.pop() {
            Some(Reverse(entry)) => entry,
            None => return Ok(None),
        };
        let group_prefix = first.prefix.clone();

        let record = self.cursors[first.cursor]
            .current
            .take()
            .expect("heap entries always have a current record");
        let mut acc = self.reducer.on_first_record(&record).context(ReduceSnafu)?;
        self.step(first.cursor).await?;

        while let Some(Reverse(top)) = self.heap.peek() {
            if top.prefix != group_prefix {
                break;
            }
            let entry = self.heap.pop().expect("peeked").0;
            let record = self.cursors[entry.cursor]
                .current
                .take()
                .expect("heap entries always have a current record");
            self.reducer
                .on_next_record(&mut acc, &record)
                .context(ReduceSnafu)?;
            self.step(entry.cursor).await?;
        }

        Ok(Some(self.reducer.finalise(acc)))
    }

    /// Advance one cursor and re-enter it into the heap if it still has
    /// records.
    async fn step(&mut self, index: usize) -> Result<()> {
        let names: Vec<&str> = self.dim_names.iter().map(String::as_str).collect();
        self.cursors[index].advance(&names, &self.filter).await?;
        if let Some(record) = &self.cursors[index].current {
            self.heap.push(Reverse(HeapEntry {
                prefix: record.key.prefix(self.key_len),
                cursor: index,
            }));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{AggregateId, ChunkId};
    use futures::stream;
    use reduce::{FinaliseMode, PlanCache, SourceKind};
    use schema::{KeyType, MeasureKind, MeasureValue, NumType, Schema, Value};
    use std::sync::Arc;

    fn schema() -> Schema {
        Schema::builder()
            .dimension("site", KeyType::I32)
            .dimension("page", KeyType::U16)
            .measure("clicks", MeasureKind::Sum(NumType::I64))
            .build()
            .unwrap()
    }

    fn record(site: i32, page: u16, clicks: i64) -> Record {
        Record::new(
            vec![Value::I32(site), Value::U16(page)],
            vec![MeasureValue::I64(clicks)],
        )
    }

    fn source(id: u64, records: Vec<Record>) -> (ChunkMeta, RecordStream) {
        let meta = ChunkMeta::new(
            ChunkId::new(id),
            AggregateId::new(1),
            records.first().unwrap().key.clone(),
            records.last().unwrap().key.clone(),
            records.len() as u64,
        )
        .unwrap();
        let stream = stream::iter(records.into_iter().map(Ok)).boxed();
        (meta, stream)
    }

    fn reducer(key_len: usize) -> MergeReducer {
        let plan = PlanCache::new()
            .get_or_compile(
                &schema(),
                key_len,
                &[0],
                SourceKind::PreAggregated,
                FinaliseMode::Identity,
            )
            .unwrap();
        MergeReducer::new(plan)
    }

    async fn collect(reader: &mut MergeReader) -> Vec<Record> {
        let mut out = vec![];
        while let Some(record) = reader.next_group().await.unwrap() {
            out.push(record);
        }
        out
    }

    fn names() -> Vec<String> {
        vec!["site".into(), "page".into()]
    }

    #[tokio::test]
    async fn merges_disjoint_sources_in_key_order() {
        let sources = vec![
            source(1, vec![record(3, 0, 1), record(4, 0, 2)]),
            source(2, vec![record(1, 0, 3), record(2, 0, 4)]),
        ];
        let mut reader = MergeReader::new(sources, reducer(2), 2, names(), Predicate::True)
            .await
            .unwrap();
        let out = collect(&mut reader).await;
        let sites: Vec<i32> = out
            .iter()
            .map(|r| match r.key.values()[0] {
                Value::I32(v) => v,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(sites, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn equal_keys_across_sources_reduce_to_one_group() {
        let sources = vec![
            source(1, vec![record(1, 0, 10), record(2, 0, 1)]),
            source(2, vec![record(1, 0, 32)]),
        ];
        let mut reader = MergeReader::new(sources, reducer(2), 2, names(), Predicate::True)
            .await
            .unwrap();
        let out = collect(&mut reader).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].values, vec![MeasureValue::I64(42)]);
        assert_eq!(out[1].values, vec![MeasureValue::I64(1)]);
    }

    #[tokio::test]
    async fn prefix_grouping_collapses_trailing_dimensions() {
        let sources = vec![
            source(1, vec![record(1, 1, 5), record(1, 2, 7)]),
            source(2, vec![record(1, 3, 8), record(2, 1, 1)]),
        ];
        let mut reader = MergeReader::new(sources, reducer(1), 1, names(), Predicate::True)
            .await
            .unwrap();
        let out = collect(&mut reader).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].key.len(), 1);
        assert_eq!(out[0].values, vec![MeasureValue::I64(20)]);
        assert_eq!(out[1].values, vec![MeasureValue::I64(1)]);
    }

    #[tokio::test]
    async fn filter_applies_to_full_input_keys() {
        // predicate over `page`, which the projection then collapses away
        let sources = vec![source(
            1,
            vec![record(1, 1, 5), record(1, 2, 7), record(2, 1, 3)],
        )];
        let filter = Predicate::eq("page", 1_u16);
        let mut reader = MergeReader::new(sources, reducer(1), 1, names(), filter)
            .await
            .unwrap();
        let out = collect(&mut reader).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].values, vec![MeasureValue::I64(5)]);
        assert_eq!(out[1].values, vec![MeasureValue::I64(3)]);
    }

    #[tokio::test]
    async fn empty_source_set_yields_nothing() {
        let mut reader = MergeReader::new(vec![], reducer(2), 2, names(), Predicate::True)
            .await
            .unwrap();
        assert!(reader.next_group().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn envelope_violation_is_fatal() {
        let (mut meta, stream) = source(1, vec![record(5, 0, 1), record(6, 0, 1)]);
        // catalog claims a narrower envelope than the bytes hold
        meta.max_key = PrimaryKey::new(vec![Value::I32(5), Value::U16(0)]);
        let mut reader = MergeReader::new(
            vec![(meta, stream)],
            reducer(2),
            2,
            names(),
            Predicate::True,
        )
        .await
        .unwrap();

        let mut saw_error = false;
        for _ in 0..3 {
            match reader.next_group().await {
                Err(crate::Error::Integrity { .. }) => {
                    saw_error = true;
                    break;
                }
                Ok(Some(_)) => continue,
                other => panic!("unexpected merge result: {:?}", other),
            }
        }
        assert!(saw_error);
    }
}
