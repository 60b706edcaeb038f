//! Query predicates.
//!
//! The abstract grammar is `true | eq(dim, v) | range(dim, lo?, hi?) |
//! and(pred…) | not(pred)`. Chunk selection consumes only the conjunctive
//! `eq`/`range` part, folded into [`KeyBounds`]: an equality-fixed leading
//! dimension prefix plus an optional range on the next dimension. Everything
//! the bounds cannot express is still enforced record-wise during the merge.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use schema::{PrimaryKey, Schema, Value};
use snafu::{OptionExt, Snafu};
use std::collections::BTreeSet;

/// Predicate errors.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("unknown dimension {:?}", name))]
    UnknownDimension { name: String },

    #[snafu(display("predicate value for {:?} has the wrong type: {}", name, source))]
    ValueType { name: String, source: schema::Error },
}

/// Convenience alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One endpoint of a range, with its inclusivity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// The bounding value.
    pub value: Value,
    /// Whether the bound itself is included.
    pub inclusive: bool,
}

/// A query predicate over dimension columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Matches everything.
    True,
    /// `dimension == value`.
    Eq {
        /// Dimension name.
        dimension: String,
        /// Required value.
        value: Value,
    },
    /// `lo <= dimension <= hi`, either side optional.
    Range {
        /// Dimension name.
        dimension: String,
        /// Lower endpoint, if bounded below.
        lo: Option<Endpoint>,
        /// Upper endpoint, if bounded above.
        hi: Option<Endpoint>,
    },
    /// Conjunction.
    And(Vec<Predicate>),
    /// Negation; evaluated record-wise only.
    Not(Box<Predicate>),
}

impl Predicate {
    /// `dimension == value`.
    pub fn eq(dimension: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            dimension: dimension.into(),
            value: value.into(),
        }
    }

    /// Inclusive `lo <= dimension <= hi`.
    pub fn between(
        dimension: impl Into<String>,
        lo: impl Into<Value>,
        hi: impl Into<Value>,
    ) -> Self {
        Self::Range {
            dimension: dimension.into(),
            lo: Some(Endpoint {
                value: lo.into(),
                inclusive: true,
            }),
            hi: Some(Endpoint {
                value: hi.into(),
                inclusive: true,
            }),
        }
    }

    /// Conjunction of `preds`.
    pub fn and(preds: impl IntoIterator<Item = Self>) -> Self {
        Self::And(preds.into_iter().collect())
    }

    /// Negation.
    pub fn not(pred: Self) -> Self {
        Self::Not(Box::new(pred))
    }

    /// Every dimension name referenced anywhere in the predicate.
    pub fn dimensions(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_dimensions(&mut out);
        out
    }

    fn collect_dimensions<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Self::True => {}
            Self::Eq { dimension, .. } | Self::Range { dimension, .. } => {
                out.insert(dimension);
            }
            Self::And(preds) => {
                for p in preds {
                    p.collect_dimensions(out);
                }
            }
            Self::Not(inner) => inner.collect_dimensions(out),
        }
    }

    /// Checks every referenced dimension exists in `schema` and every
    /// compared value inhabits its dimension's key type.
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        match self {
            Self::True => Ok(()),
            Self::Eq { dimension, value } => {
                let index = schema
                    .dimension_index(dimension)
                    .context(UnknownDimensionSnafu { name: dimension.as_str() })?;
                schema.dimensions()[index]
                    .key_type
                    .validate(value)
                    .map_err(|source| Error::ValueType {
                        name: dimension.clone(),
                        source,
                    })
            }
            Self::Range { dimension, lo, hi } => {
                let index = schema
                    .dimension_index(dimension)
                    .context(UnknownDimensionSnafu { name: dimension.as_str() })?;
                let key_type = schema.dimensions()[index].key_type;
                for endpoint in lo.iter().chain(hi.iter()) {
                    key_type
                        .validate(&endpoint.value)
                        .map_err(|source| Error::ValueType {
                            name: dimension.clone(),
                            source,
                        })?;
                }
                Ok(())
            }
            Self::And(preds) => preds.iter().try_for_each(|p| p.validate(schema)),
            Self::Not(inner) => inner.validate(schema),
        }
    }

    /// Evaluates the predicate against a full primary key. `dim_names` maps
    /// key positions to dimension names, in key order.
    pub fn matches(&self, dim_names: &[&str], key: &PrimaryKey) -> Result<bool> {
        let position = |name: &str| -> Result<usize> {
            dim_names
                .iter()
                .position(|n| *n == name)
                .context(UnknownDimensionSnafu { name })
        };
        let matched = match self {
            Self::True => true,
            Self::Eq { dimension, value } => key.values()[position(dimension)?] == *value,
            Self::Range { dimension, lo, hi } => {
                let v = &key.values()[position(dimension)?];
                let lo_ok = lo.as_ref().map_or(true, |e| {
                    if e.inclusive {
                        *v >= e.value
                    } else {
                        *v > e.value
                    }
                });
                let hi_ok = hi.as_ref().map_or(true, |e| {
                    if e.inclusive {
                        *v <= e.value
                    } else {
                        *v < e.value
                    }
                });
                lo_ok && hi_ok
            }
            Self::And(preds) => {
                for p in preds {
                    if !p.matches(dim_names, key)? {
                        return Ok(false);
                    }
                }
                true
            }
            Self::Not(inner) => !inner.matches(dim_names, key)?,
        };
        Ok(matched)
    }

    /// Folds the conjunctive `eq`/`range` part into chunk-selection bounds
    /// for `schema`: the maximal equality-fixed leading dimension prefix,
    /// plus at most one range on the dimension immediately after it.
    ///
    /// Constraints the bounds cannot express (equality past a gap, ranges on
    /// later dimensions, any `not`) are simply not narrowed on here; the
    /// record-wise pass keeps the result exact.
    pub fn key_bounds(&self, schema: &Schema) -> Result<KeyBounds> {
        self.validate(schema)?;

        let dims = schema.dimensions().len();
        let mut eq: Vec<Option<Value>> = vec![None; dims];
        let mut ranges: Vec<Option<(Option<Endpoint>, Option<Endpoint>)>> = vec![None; dims];
        self.collect_conjuncts(schema, &mut eq, &mut ranges);

        let mut prefix = Vec::new();
        for index in 0..dims {
            match &eq[index] {
                Some(value) => prefix.push(value.clone()),
                None => {
                    let range = ranges[index].clone().map(|(lo, hi)| RangeBound {
                        dim_index: index,
                        lo,
                        hi,
                    });
                    return Ok(KeyBounds { prefix, range });
                }
            }
        }
        Ok(KeyBounds {
            prefix,
            range: None,
        })
    }

    fn collect_conjuncts(
        &self,
        schema: &Schema,
        eq: &mut [Option<Value>],
        ranges: &mut [Option<(Option<Endpoint>, Option<Endpoint>)>],
    ) {
        match self {
            Self::Eq { dimension, value } => {
                if let Some(index) = schema.dimension_index(dimension) {
                    eq[index] = Some(value.clone());
                }
            }
            Self::Range { dimension, lo, hi } => {
                if let Some(index) = schema.dimension_index(dimension) {
                    // last conjunct wins; intersecting repeated ranges is the
                    // record-wise pass's job
                    ranges[index] = Some((lo.clone(), hi.clone()));
                }
            }
            Self::And(preds) => {
                for p in preds {
                    p.collect_conjuncts(schema, eq, ranges);
                }
            }
            Self::True | Self::Not(_) => {}
        }
    }
}

/// Range constraint on one dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeBound {
    /// Key position the range applies to.
    pub dim_index: usize,
    /// Lower endpoint.
    pub lo: Option<Endpoint>,
    /// Upper endpoint.
    pub hi: Option<Endpoint>,
}

/// Chunk-selection bounds: equality prefix plus optional next-dimension
/// range, compared against chunk key envelopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBounds {
    /// Values fixed by equality on the leading dimensions.
    pub prefix: Vec<Value>,
    /// Range on the dimension right after the prefix, if any.
    pub range: Option<RangeBound>,
}

impl KeyBounds {
    /// True when nothing is constrained (every chunk qualifies).
    pub fn is_unbounded(&self) -> bool {
        self.prefix.is_empty() && self.range.is_none()
    }

    /// Whether a chunk whose keys span `[min_key, max_key]` can contain a
    /// matching record.
    ///
    /// The matching region is a contiguous interval of the full key order
    /// (exact prefix, then a range on the next component), so the chunk
    /// misses it only by lying entirely below or entirely above.
    pub fn overlaps(&self, min_key: &PrimaryKey, max_key: &PrimaryKey) -> bool {
        use std::cmp::Ordering::*;

        let k = self.prefix.len();
        // entirely outside the equality prefix
        if !self.prefix.is_empty() {
            if max_key.values()[..k].cmp(&self.prefix) == Less {
                return false;
            }
            if min_key.values()[..k].cmp(&self.prefix) == Greater {
                return false;
            }
        }

        if let Some(range) = &self.range {
            debug_assert_eq!(range.dim_index, k);
            let bound = |endpoint: &Endpoint| -> Vec<Value> {
                self.prefix
                    .iter()
                    .cloned()
                    .chain(std::iter::once(endpoint.value.clone()))
                    .collect()
            };
            if let Some(lo) = &range.lo {
                // chunk entirely below the lower bound: every record at or
                // under max_key either misses the prefix or has its range
                // component <= lo
                let cmp = max_key.values()[..=k].cmp(&bound(lo));
                if cmp == Less || (cmp == Equal && !lo.inclusive) {
                    return false;
                }
            }
            if let Some(hi) = &range.hi {
                let cmp = min_key.values()[..=k].cmp(&bound(hi));
                if cmp == Greater || (cmp == Equal && !hi.inclusive) {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::{KeyType, MeasureKind, NumType};

    fn schema() -> Schema {
        Schema::builder()
            .dimension("date", KeyType::I32)
            .dimension("campaign", KeyType::I32)
            .measure("imp", MeasureKind::Sum(NumType::I64))
            .build()
            .unwrap()
    }

    fn key(date: i32, campaign: i32) -> PrimaryKey {
        PrimaryKey::new(vec![Value::I32(date), Value::I32(campaign)])
    }

    #[test]
    fn validate_flags_unknown_dimensions_and_bad_types() {
        let schema = schema();
        assert!(Predicate::eq("date", 5_i32).validate(&schema).is_ok());
        assert!(matches!(
            Predicate::eq("nope", 5_i32).validate(&schema),
            Err(Error::UnknownDimension { .. })
        ));
        assert!(matches!(
            Predicate::eq("date", 5_i64).validate(&schema),
            Err(Error::ValueType { .. })
        ));
    }

    #[test]
    fn record_wise_evaluation() {
        let names = ["date", "campaign"];
        let pred = Predicate::and([
            Predicate::eq("date", 5_i32),
            Predicate::between("campaign", 100_i32, 200_i32),
        ]);
        assert!(pred.matches(&names, &key(5, 150)).unwrap());
        assert!(!pred.matches(&names, &key(5, 201)).unwrap());
        assert!(!pred.matches(&names, &key(6, 150)).unwrap());

        let negated = Predicate::not(Predicate::eq("date", 5_i32));
        assert!(!negated.matches(&names, &key(5, 0)).unwrap());
        assert!(negated.matches(&names, &key(4, 0)).unwrap());
    }

    #[test]
    fn exclusive_endpoints() {
        let names = ["date", "campaign"];
        let pred = Predicate::Range {
            dimension: "date".into(),
            lo: Some(Endpoint {
                value: Value::I32(5),
                inclusive: false,
            }),
            hi: None,
        };
        assert!(!pred.matches(&names, &key(5, 0)).unwrap());
        assert!(pred.matches(&names, &key(6, 0)).unwrap());
    }

    #[test]
    fn bounds_take_equality_prefix_then_range() {
        let schema = schema();
        let pred = Predicate::and([
            Predicate::eq("date", 5_i32),
            Predicate::between("campaign", 100_i32, 200_i32),
        ]);
        let bounds = pred.key_bounds(&schema).unwrap();
        assert_eq!(bounds.prefix, vec![Value::I32(5)]);
        let range = bounds.range.unwrap();
        assert_eq!(range.dim_index, 1);
        assert_eq!(range.lo.unwrap().value, Value::I32(100));
        assert_eq!(range.hi.unwrap().value, Value::I32(200));
    }

    #[test]
    fn non_leading_equality_does_not_form_a_prefix() {
        let schema = schema();
        // equality on campaign alone: date is unconstrained, so chunk
        // selection cannot narrow
        let bounds = Predicate::eq("campaign", 7_i32).key_bounds(&schema).unwrap();
        assert!(bounds.prefix.is_empty());
        assert!(bounds.range.is_none());
        assert!(bounds.is_unbounded());
    }

    #[test]
    fn bounds_overlap_with_prefix_only() {
        let schema = schema();
        let bounds = Predicate::eq("date", 5_i32).key_bounds(&schema).unwrap();

        assert!(bounds.overlaps(&key(5, 10), &key(5, 90)));
        assert!(bounds.overlaps(&key(1, 0), &key(9, 0)));
        assert!(!bounds.overlaps(&key(6, 0), &key(9, 0)));
        assert!(!bounds.overlaps(&key(1, 0), &key(4, 1000)));
    }

    #[test]
    fn bounds_overlap_with_range() {
        let schema = schema();
        let pred = Predicate::and([
            Predicate::eq("date", 5_i32),
            Predicate::between("campaign", 100_i32, 200_i32),
        ]);
        let bounds = pred.key_bounds(&schema).unwrap();

        assert!(bounds.overlaps(&key(5, 150), &key(5, 160)));
        assert!(bounds.overlaps(&key(5, 50), &key(5, 100)));
        assert!(bounds.overlaps(&key(5, 200), &key(5, 400)));
        assert!(bounds.overlaps(&key(4, 0), &key(5, 120)));
        assert!(!bounds.overlaps(&key(5, 201), &key(5, 400)));
        assert!(!bounds.overlaps(&key(5, 10), &key(5, 99)));
    }

    #[test]
    fn unbounded_predicate_selects_everything() {
        let schema = schema();
        let bounds = Predicate::True.key_bounds(&schema).unwrap();
        assert!(bounds.is_unbounded());
        assert!(bounds.overlaps(&key(i32::MIN, i32::MIN), &key(i32::MAX, i32::MAX)));
    }
}
