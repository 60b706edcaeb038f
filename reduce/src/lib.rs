//! Measure combine primitives and the merge reducer.
//!
//! This crate turns a [`schema::Schema`] plus a selection into an executable
//! reduction: per-measure ops composed into a [`MergeReducer`] that the
//! write path (raw rows) and the read/consolidation paths (pre-aggregated
//! records) drive over each group of equal-key inputs.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use snafu::Snafu;

mod cache;
mod ops;
mod reducer;

pub use cache::PlanCache;
pub use ops::{value_hash, MeasureOp};
pub use reducer::{FinaliseMode, MergeReducer, PlanFingerprint, ReducePlan, SourceKind};

/// Reduction errors.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("record does not conform to the aggregation schema: {}", source))]
    Schema { source: schema::Error },

    #[snafu(display("key prefix of {} exceeds {} declared dimensions", len, dims))]
    InvalidKeyPrefix { len: usize, dims: usize },

    #[snafu(display("measure index {} out of range, schema has {}", index, measures))]
    InvalidMeasureIndex { index: usize, measures: usize },

    #[snafu(display("reducer was compiled for {}", expected))]
    SourceMismatch { expected: &'static str },
}

/// Convenience alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
