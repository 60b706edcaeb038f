//! Primary keys and the two record shapes flowing through the engine.

use crate::{measure::MeasureValue, Value};
use itertools::Itertools;

/// The lexicographically ordered tuple of dimension values.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PrimaryKey(Vec<Value>);

impl PrimaryKey {
    /// Wrap a tuple of dimension values.
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// The component values, in schema dimension order.
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for the zero-dimension key.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The leading `n` components as a new key.
    pub fn prefix(&self, n: usize) -> Self {
        Self(self.0[..n].to_vec())
    }

    /// Compares only the leading `n` components of both keys.
    pub fn cmp_prefix(&self, other: &Self, n: usize) -> std::cmp::Ordering {
        self.0[..n].cmp(&other.0[..n])
    }
}

impl std::fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({})", self.0.iter().map(|v| v.to_string()).join(", "))
    }
}

impl From<Vec<Value>> for PrimaryKey {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

/// A raw ingest row: key values plus one raw scalar per measure column.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Dimension values, in schema order.
    pub key: PrimaryKey,
    /// Raw measure inputs, in schema measure order.
    pub values: Vec<Value>,
}

impl Row {
    /// Assemble a row.
    pub fn new(key: impl Into<PrimaryKey>, values: Vec<Value>) -> Self {
        Self {
            key: key.into(),
            values,
        }
    }
}

/// An aggregated record: key values plus one accumulator per measure column.
///
/// This is the shape stored in chunks and produced by merges.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Dimension values, in schema order.
    pub key: PrimaryKey,
    /// Measure accumulators, in schema measure order.
    pub values: Vec<MeasureValue>,
}

impl Record {
    /// Assemble a record.
    pub fn new(key: impl Into<PrimaryKey>, values: Vec<MeasureValue>) -> Self {
        Self {
            key: key.into(),
            values,
        }
    }
}
