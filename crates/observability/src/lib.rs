//! Tracing setup for node embedders and test harnesses.
//!
//! The pipeline, store and scheduler all emit structured `tracing` events;
//! this crate owns the subscriber wiring so every embedder configures it the
//! same way. Filtering follows `RUST_LOG`, defaulting to `info`.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize process-wide JSON logging for a long-running node.
///
/// Safe to call multiple times; only the first call installs a subscriber.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .json()
        .with_current_span(false)
        .try_init();
}

/// Initialize compact, per-test-captured logging.
///
/// Output goes through the test writer, so `cargo test` swallows it for
/// passing tests and prints it for failing ones. Spans log on close, which
/// surfaces pipeline stage timing when a scenario goes wrong. Safe to call
/// from every test; repeat calls are no-ops.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .compact()
        .with_test_writer()
        .with_span_events(FmtSpan::CLOSE)
        .try_init();
}
