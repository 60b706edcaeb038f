//! The merge reducer: a compiled, schema-specific composition of measure ops
//! applied to every group of equal-prefix records.

use crate::{
    ops::MeasureOp, InvalidKeyPrefixSnafu, InvalidMeasureIndexSnafu, Result, SourceMismatchSnafu,
};
use schema::{Record, Row, Schema};
use snafu::ensure;
use std::sync::Arc;

/// Whether a reducer's input carries raw scalars or stored accumulators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Ingest rows: measure inputs are raw values.
    Raw,
    /// Chunk records: measure inputs are accumulators.
    PreAggregated,
}

/// What [`MergeReducer::finalise`] does to the finished group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinaliseMode {
    /// Emit accumulators unchanged (storage paths).
    Identity,
    /// Collapse sketch accumulators to scalar summaries (projection paths).
    Summary,
}

/// Cache key of a compiled plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanFingerprint {
    /// [`Schema::fingerprint`] of the aggregation.
    pub schema: u64,
    /// Length of the output key prefix.
    pub key_len: usize,
    /// Selected measure positions, in output order.
    pub measures: Vec<usize>,
    /// Input source kind.
    pub source: SourceKind,
    /// Finalise behaviour.
    pub finalise: FinaliseMode,
}

/// A compiled reduction: which key prefix groups, and which measure op runs
/// at each output position. Built once per fingerprint and cached; plans are
/// immutable and shared.
#[derive(Debug)]
pub struct ReducePlan {
    fingerprint: PlanFingerprint,
    key_len: usize,
    // (input measure position, op) per output position
    ops: Vec<(usize, MeasureOp)>,
    source: SourceKind,
    finalise: FinaliseMode,
}

impl ReducePlan {
    /// Compile a plan for `schema`, grouping on the leading `key_len`
    /// dimensions and selecting `measures` (input positions, output order).
    pub fn new(
        schema: &Schema,
        key_len: usize,
        measures: &[usize],
        source: SourceKind,
        finalise: FinaliseMode,
    ) -> Result<Self> {
        ensure!(
            key_len <= schema.dimensions().len(),
            InvalidKeyPrefixSnafu {
                len: key_len,
                dims: schema.dimensions().len()
            }
        );
        let mut ops = Vec::with_capacity(measures.len());
        for &index in measures {
            let spec = schema.measures().get(index).ok_or_else(|| {
                InvalidMeasureIndexSnafu {
                    index,
                    measures: schema.measures().len(),
                }
                .build()
            })?;
            ops.push((index, MeasureOp::new(spec.kind)));
        }
        Ok(Self {
            fingerprint: PlanFingerprint {
                schema: schema.fingerprint(),
                key_len,
                measures: measures.to_vec(),
                source,
                finalise,
            },
            key_len,
            ops,
            source,
            finalise,
        })
    }

    /// The cache key this plan was compiled for.
    pub fn fingerprint(&self) -> &PlanFingerprint {
        &self.fingerprint
    }

    /// Length of the output key prefix.
    pub fn key_len(&self) -> usize {
        self.key_len
    }

    /// Number of output measure columns.
    pub fn width(&self) -> usize {
        self.ops.len()
    }
}

/// Executes a [`ReducePlan`] over the records of one group.
///
/// The caller owns group boundaries: it calls `on_first_*` for the first
/// input of a group and `on_next_*` for the rest, then `finalise` to take
/// the output record.
#[derive(Debug, Clone)]
pub struct MergeReducer {
    plan: Arc<ReducePlan>,
}

impl MergeReducer {
    /// Wrap a compiled plan.
    pub fn new(plan: Arc<ReducePlan>) -> Self {
        Self { plan }
    }

    /// The underlying plan.
    pub fn plan(&self) -> &Arc<ReducePlan> {
        &self.plan
    }

    /// Open a group from its first raw row.
    pub fn on_first_row(&self, row: &Row) -> Result<Record> {
        ensure!(
            self.plan.source == SourceKind::Raw,
            SourceMismatchSnafu {
                expected: "raw rows",
            }
        );
        let mut values = Vec::with_capacity(self.plan.ops.len());
        for (index, op) in &self.plan.ops {
            values.push(op.init_from_value(&row.values[*index])?);
        }
        Ok(Record::new(row.key.prefix(self.plan.key_len), values))
    }

    /// Fold another raw row of the same group.
    pub fn on_next_row(&self, acc: &mut Record, row: &Row) -> Result<()> {
        debug_assert_eq!(
            acc.key,
            row.key.prefix(self.plan.key_len),
            "row belongs to a different group"
        );
        for (slot, (index, op)) in acc.values.iter_mut().zip(self.plan.ops.iter()) {
            op.accumulate_value(slot, &row.values[*index])?;
        }
        Ok(())
    }

    /// Open a group from its first pre-aggregated record.
    pub fn on_first_record(&self, record: &Record) -> Result<Record> {
        ensure!(
            self.plan.source == SourceKind::PreAggregated,
            SourceMismatchSnafu {
                expected: "pre-aggregated records",
            }
        );
        let mut values = Vec::with_capacity(self.plan.ops.len());
        for (index, op) in &self.plan.ops {
            values.push(op.init_from_acc(&record.values[*index])?);
        }
        Ok(Record::new(record.key.prefix(self.plan.key_len), values))
    }

    /// Fold another pre-aggregated record of the same group.
    pub fn on_next_record(&self, acc: &mut Record, record: &Record) -> Result<()> {
        debug_assert_eq!(
            acc.key,
            record.key.prefix(self.plan.key_len),
            "record belongs to a different group"
        );
        for (slot, (index, op)) in acc.values.iter_mut().zip(self.plan.ops.iter()) {
            op.reduce_accs(slot, &record.values[*index])?;
        }
        Ok(())
    }

    /// Close the group and take its output record.
    pub fn finalise(&self, mut acc: Record) -> Record {
        if self.plan.finalise == FinaliseMode::Summary {
            acc.values = acc
                .values
                .into_iter()
                .zip(self.plan.ops.iter())
                .map(|(value, (_, op))| op.summarise(value))
                .collect();
        }
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use schema::{KeyType, MeasureKind, MeasureValue, NumType, Value};

    fn schema() -> Schema {
        Schema::builder()
            .dimension("site", KeyType::I32)
            .dimension("page", KeyType::U16)
            .measure("clicks", MeasureKind::Sum(NumType::I64))
            .measure("events", MeasureKind::Count)
            .build()
            .unwrap()
    }

    fn raw_reducer(schema: &Schema, key_len: usize) -> MergeReducer {
        MergeReducer::new(Arc::new(
            ReducePlan::new(
                schema,
                key_len,
                &[0, 1],
                SourceKind::Raw,
                FinaliseMode::Identity,
            )
            .unwrap(),
        ))
    }

    #[test]
    fn reduces_raw_rows_into_one_group() {
        let schema = schema();
        let reducer = raw_reducer(&schema, 2);

        let rows = [
            Row::new(
                vec![Value::I32(1), Value::U16(7)],
                vec![Value::I64(10), Value::I64(1)],
            ),
            Row::new(
                vec![Value::I32(1), Value::U16(7)],
                vec![Value::I64(3), Value::I64(1)],
            ),
        ];
        let mut acc = reducer.on_first_row(&rows[0]).unwrap();
        reducer.on_next_row(&mut acc, &rows[1]).unwrap();
        let out = reducer.finalise(acc);

        assert_eq!(out.key, rows[0].key);
        assert_eq!(out.values, vec![MeasureValue::I64(13), MeasureValue::U64(2)]);
    }

    #[test]
    fn key_prefix_collapses_groups() {
        let schema = schema();
        let reducer = raw_reducer(&schema, 1);

        let a = Row::new(
            vec![Value::I32(1), Value::U16(7)],
            vec![Value::I64(10), Value::I64(1)],
        );
        let b = Row::new(
            vec![Value::I32(1), Value::U16(9)],
            vec![Value::I64(5), Value::I64(1)],
        );
        let mut acc = reducer.on_first_row(&a).unwrap();
        reducer.on_next_row(&mut acc, &b).unwrap();
        let out = reducer.finalise(acc);

        assert_eq!(out.key.len(), 1);
        assert_eq!(out.values, vec![MeasureValue::I64(15), MeasureValue::U64(2)]);
    }

    #[test]
    fn pre_aggregated_path_reduces_accs() {
        let schema = schema();
        let plan = Arc::new(
            ReducePlan::new(
                &schema,
                2,
                &[0, 1],
                SourceKind::PreAggregated,
                FinaliseMode::Identity,
            )
            .unwrap(),
        );
        let reducer = MergeReducer::new(plan);

        let a = Record::new(
            vec![Value::I32(1), Value::U16(7)],
            vec![MeasureValue::I64(10), MeasureValue::U64(4)],
        );
        let b = Record::new(
            vec![Value::I32(1), Value::U16(7)],
            vec![MeasureValue::I64(32), MeasureValue::U64(1)],
        );
        let mut acc = reducer.on_first_record(&a).unwrap();
        reducer.on_next_record(&mut acc, &b).unwrap();
        let out = reducer.finalise(acc);

        assert_eq!(out.values, vec![MeasureValue::I64(42), MeasureValue::U64(5)]);
    }

    #[test]
    fn measure_selection_reorders_output() {
        let schema = schema();
        let plan = Arc::new(
            ReducePlan::new(
                &schema,
                1,
                &[1],
                SourceKind::PreAggregated,
                FinaliseMode::Identity,
            )
            .unwrap(),
        );
        let reducer = MergeReducer::new(plan);

        let record = Record::new(
            vec![Value::I32(1), Value::U16(7)],
            vec![MeasureValue::I64(10), MeasureValue::U64(4)],
        );
        let acc = reducer.on_first_record(&record).unwrap();
        assert_eq!(acc.values, vec![MeasureValue::U64(4)]);
    }

    #[test]
    fn source_kind_is_enforced() {
        let schema = schema();
        let reducer = raw_reducer(&schema, 2);
        let record = Record::new(
            vec![Value::I32(1), Value::U16(7)],
            vec![MeasureValue::I64(10), MeasureValue::U64(4)],
        );
        assert!(matches!(
            reducer.on_first_record(&record),
            Err(Error::SourceMismatch { .. })
        ));
    }

    #[test]
    fn plan_validation() {
        let schema = schema();
        assert!(matches!(
            ReducePlan::new(&schema, 3, &[0], SourceKind::Raw, FinaliseMode::Identity),
            Err(Error::InvalidKeyPrefix { .. })
        ));
        assert!(matches!(
            ReducePlan::new(&schema, 1, &[2], SourceKind::Raw, FinaliseMode::Identity),
            Err(Error::InvalidMeasureIndex { .. })
        ));
    }
}
