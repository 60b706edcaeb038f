//! Aggregate schema definition.
//!
//! A [`Schema`] is the immutable declaration of one aggregation: an ordered
//! list of dimension columns (each with a byte-comparable [`KeyType`]) and a
//! set of measure columns (each with a [`MeasureKind`] naming its combine
//! semantics and codec). Records are ordered by the lexicographic
//! [`PrimaryKey`] over the dimension columns.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use hashbrown::HashMap;
use snafu::{ensure, Snafu};
use std::hash::{Hash, Hasher};

pub mod codec;
pub mod hll;
pub mod key;
pub mod measure;
pub mod record;
mod value;

pub use hll::HllSketch;
pub use key::KeyType;
pub use measure::{MeasureKind, MeasureValue, NumType};
pub use record::{PrimaryKey, Record, Row};
pub use value::Value;

/// Schema and codec errors. Everything here means the record shape does not
/// conform to the declared aggregation schema.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("value type mismatch: expected {}, got {}", expected, got))]
    TypeMismatch { expected: String, got: String },

    #[snafu(display("string of {} bytes exceeds fixed width {}", len, max))]
    StringTooLong { len: usize, max: usize },

    #[snafu(display("enum ordinal {} out of range, cardinality {}", ordinal, cardinality))]
    EnumOutOfRange { ordinal: u16, cardinality: u16 },

    #[snafu(display("byte stream truncated: wanted {} bytes, got {}", want, got))]
    Truncated { want: usize, got: usize },

    #[snafu(display("fixed string bytes are not valid utf-8"))]
    InvalidUtf8,

    #[snafu(display("duplicate column name {:?}", name))]
    DuplicateColumn { name: String },

    #[snafu(display("schema must declare at least one dimension"))]
    NoDimensions,

    #[snafu(display("{} arity mismatch: schema has {}, record has {}", what, expected, got))]
    ArityMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },
}

/// Convenience alias for schema results.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One declared dimension column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DimensionSpec {
    /// Column name, unique within the schema.
    pub name: String,
    /// Byte-comparable key type.
    pub key_type: KeyType,
}

/// One declared measure column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MeasureSpec {
    /// Column name, unique within the schema.
    pub name: String,
    /// Combine semantics and codec.
    pub kind: MeasureKind,
}

/// The immutable schema of one aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    dimensions: Vec<DimensionSpec>,
    measures: Vec<MeasureSpec>,
    dimension_index: HashMap<String, usize>,
    measure_index: HashMap<String, usize>,
    key_width: usize,
    fingerprint: u64,
}

impl Schema {
    /// Start building a schema.
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Declared dimension columns, in key order.
    pub fn dimensions(&self) -> &[DimensionSpec] {
        &self.dimensions
    }

    /// Declared measure columns.
    pub fn measures(&self) -> &[MeasureSpec] {
        &self.measures
    }

    /// Position of the dimension named `name` in the key order.
    pub fn dimension_index(&self, name: &str) -> Option<usize> {
        self.dimension_index.get(name).copied()
    }

    /// Position of the measure named `name`.
    pub fn measure_index(&self, name: &str) -> Option<usize> {
        self.measure_index.get(name).copied()
    }

    /// Width of the fixed key image in bytes.
    pub fn key_width(&self) -> usize {
        self.key_width
    }

    /// Stable-within-process identity hash over column names and types,
    /// used to key compiled-plan caches.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Checks a raw ingest row against this schema.
    pub fn validate_row(&self, row: &Row) -> Result<()> {
        self.validate_key(&row.key)?;
        ensure!(
            row.values.len() == self.measures.len(),
            ArityMismatchSnafu {
                what: "measure",
                expected: self.measures.len(),
                got: row.values.len()
            }
        );
        for (spec, value) in self.measures.iter().zip(row.values.iter()) {
            spec.kind.validate_raw(value)?;
        }
        Ok(())
    }

    /// Checks an aggregated record against this schema.
    pub fn validate_record(&self, record: &Record) -> Result<()> {
        self.validate_key(&record.key)?;
        ensure!(
            record.values.len() == self.measures.len(),
            ArityMismatchSnafu {
                what: "measure",
                expected: self.measures.len(),
                got: record.values.len()
            }
        );
        for (spec, value) in self.measures.iter().zip(record.values.iter()) {
            spec.kind.validate_acc(value)?;
        }
        Ok(())
    }

    /// Checks a primary key against the dimension declarations.
    pub fn validate_key(&self, key: &PrimaryKey) -> Result<()> {
        ensure!(
            key.len() == self.dimensions.len(),
            ArityMismatchSnafu {
                what: "dimension",
                expected: self.dimensions.len(),
                got: key.len()
            }
        );
        for (spec, value) in self.dimensions.iter().zip(key.values().iter()) {
            spec.key_type.validate(value)?;
        }
        Ok(())
    }
}

/// Incremental [`Schema`] construction.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    dimensions: Vec<DimensionSpec>,
    measures: Vec<MeasureSpec>,
}

impl SchemaBuilder {
    /// Append a dimension column; declaration order is key order.
    pub fn dimension(mut self, name: impl Into<String>, key_type: KeyType) -> Self {
        self.dimensions.push(DimensionSpec {
            name: name.into(),
            key_type,
        });
        self
    }

    /// Append a measure column.
    pub fn measure(mut self, name: impl Into<String>, kind: MeasureKind) -> Self {
        self.measures.push(MeasureSpec {
            name: name.into(),
            kind,
        });
        self
    }

    /// Finish, verifying name uniqueness across all columns.
    pub fn build(self) -> Result<Schema> {
        ensure!(!self.dimensions.is_empty(), NoDimensionsSnafu);

        let mut dimension_index = HashMap::with_capacity(self.dimensions.len());
        let mut measure_index = HashMap::with_capacity(self.measures.len());
        for (i, spec) in self.dimensions.iter().enumerate() {
            ensure!(
                dimension_index.insert(spec.name.clone(), i).is_none(),
                DuplicateColumnSnafu { name: spec.name.as_str() }
            );
        }
        for (i, spec) in self.measures.iter().enumerate() {
            ensure!(
                !dimension_index.contains_key(&spec.name)
                    && measure_index.insert(spec.name.clone(), i).is_none(),
                DuplicateColumnSnafu { name: spec.name.as_str() }
            );
        }

        let key_width = self
            .dimensions
            .iter()
            .map(|d| d.key_type.encoded_len())
            .sum();

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.dimensions.hash(&mut hasher);
        self.measures.hash(&mut hasher);
        let fingerprint = hasher.finish();

        Ok(Schema {
            dimensions: self.dimensions,
            measures: self.measures,
            dimension_index,
            measure_index,
            key_width,
            fingerprint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example() -> Schema {
        Schema::builder()
            .dimension("date", KeyType::Date)
            .dimension("site", KeyType::I32)
            .measure("clicks", MeasureKind::Sum(NumType::I64))
            .measure("events", MeasureKind::Count)
            .build()
            .unwrap()
    }

    #[test]
    fn lookups_and_widths() {
        let schema = example();
        assert_eq!(schema.dimension_index("site"), Some(1));
        assert_eq!(schema.dimension_index("nope"), None);
        assert_eq!(schema.measure_index("events"), Some(1));
        assert_eq!(schema.key_width(), 8);
    }

    #[test]
    fn fingerprint_tracks_declarations() {
        let a = example();
        let b = example();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = Schema::builder()
            .dimension("date", KeyType::Date)
            .dimension("site", KeyType::I64)
            .measure("clicks", MeasureKind::Sum(NumType::I64))
            .measure("events", MeasureKind::Count)
            .build()
            .unwrap();
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn duplicate_names_rejected() {
        let err = Schema::builder()
            .dimension("x", KeyType::I32)
            .dimension("x", KeyType::I32)
            .measure("m", MeasureKind::Count)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateColumn { .. }));

        // a measure may not shadow a dimension either
        let err = Schema::builder()
            .dimension("x", KeyType::I32)
            .measure("x", MeasureKind::Count)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateColumn { .. }));
    }

    #[test]
    fn at_least_one_dimension() {
        let err = Schema::builder()
            .measure("m", MeasureKind::Count)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::NoDimensions));
    }

    #[test]
    fn row_validation() {
        let schema = example();
        let good = Row::new(
            vec![Value::Date(10), Value::I32(1)],
            vec![Value::I64(5), Value::I64(1)],
        );
        schema.validate_row(&good).unwrap();

        let wrong_arity = Row::new(vec![Value::Date(10)], vec![Value::I64(5), Value::I64(1)]);
        assert!(matches!(
            schema.validate_row(&wrong_arity),
            Err(Error::ArityMismatch { .. })
        ));

        let wrong_type = Row::new(
            vec![Value::Date(10), Value::I64(1)],
            vec![Value::I64(5), Value::I64(1)],
        );
        assert!(matches!(
            schema.validate_row(&wrong_type),
            Err(Error::TypeMismatch { .. })
        ));
    }
}
