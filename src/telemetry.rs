//! Tracing bootstrap.
//!
//! Call [`init`] once at process start. The filter comes from `RUST_LOG`,
//! defaulting to `info` for this crate and `warn` elsewhere.

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. Safe to call more than once; later
/// calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,veritas=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}
