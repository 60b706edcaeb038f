//! Shared test support.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(clippy::explicit_iter_loop, clippy::use_self, clippy::clone_on_ref_ptr)]

use std::sync::Once;
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, EnvFilter};

static LOG_SETUP: Once = Once::new();

/// Enables tracing output in tests when `RUST_LOG` is set.
///
/// Safe to call from every test; initialization happens once per process.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Unconditionally installs the test subscriber.
pub fn start_logging() {
    LOG_SETUP.call_once(|| {
        LogTracer::init().expect("log tracer init");
        let subscriber = fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .finish();
        tracing::subscriber::set_global_default(subscriber).expect("subscriber install");
    });
}

// Re-exported so test code gets the workspace-pinned tracing.
pub use observability_deps::tracing;
