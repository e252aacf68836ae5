//! Telemetry initialization for the sett daemon.
//!
//! Console tracing only: a `fmt` layer filtered by `RUST_LOG` or the
//! configured level. Exporters (OTLP and friends) are deployment
//! concerns layered on from outside the store.

use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber.
///
/// Call this once at startup, before any `tracing` events are emitted.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
