//! The read path: query planning and k-way merge-reduce execution.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use snafu::Snafu;

mod merge;
mod planner;

pub use merge::MergeReader;
pub use planner::{Aggregation, Query, QueryPlan, QueryPlanner};

/// Query errors.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("unknown dimension {:?}", name))]
    UnknownDimension { name: String },

    #[snafu(display("unknown measure {:?}", name))]
    UnknownMeasure { name: String },

    #[snafu(display("no aggregation can answer this query: {}", detail))]
    NoCoveringAggregation { detail: &'static str },

    #[snafu(display("predicate rejected: {}", source))]
    Predicate { source: predicate::Error },

    #[snafu(display("chunk store failure: {}", source))]
    Store { source: chunk_store::ChunkStoreError },

    #[snafu(display("reduction failed: {}", source))]
    Reduce { source: reduce::Error },

    #[snafu(display("integrity violation: {}", reason))]
    Integrity { reason: String },

    #[snafu(display("query cancelled"))]
    Cancelled,

    #[snafu(display("query deadline exceeded"))]
    DeadlineExceeded,
}

/// Convenience alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
