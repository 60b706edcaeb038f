//! This crate exists to coordinate versions of `tracing` and related crates
//! so that the workspace observes one consistent observability stack.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_docs)]

// Export tracing publicly so users do not have to take a direct dependency on
// the `tracing` crate (and pick a matching version).
pub use tracing;
