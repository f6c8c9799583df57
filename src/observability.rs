//! Structured logging setup for embedding applications.
//!
//! Takes the place of the teacher's `env_logger::init()` call in its
//! `bin/*/main.rs` entry points. An embedding process (the HTTP API layer)
//! calls [`init_tracing`] once at startup; the core itself never calls it,
//! so library consumers (e.g. tests) stay in control of global state.

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Initialize a process-wide `tracing` subscriber honoring `RUST_LOG`,
/// defaulting to `info` when unset.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    // Best-effort: a second call (e.g. from a test harness) should not panic.
    let _ = tracing::subscriber::set_global_default(subscriber);
}
