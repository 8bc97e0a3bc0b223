//! Structured logging bootstrap.

use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install a global `tracing` subscriber reading filter directives from
/// `RUST_LOG`, defaulting to `info` when unset. Safe to call once at process
/// start; a second call is a no-op (the underlying `set_global_default` error
/// is swallowed since tests may initialize repeatedly).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).with_target(true).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
