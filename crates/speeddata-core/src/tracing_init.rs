//! Shared tracing/logging initialization.
//!
//! The daemon and every relay worker install the same subscriber: an
//! env-filter plus either human-readable or JSON line output. Workers are
//! spawned with piped stdio, so their lines end up in the daemon log.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Build the default filter directive for `targets` at `level`,
/// e.g. `"speeddata_daemon=info,speeddata_core=info"`.
pub fn filter_for(targets: &[&str], level: &str) -> String {
    targets
        .iter()
        .map(|t| format!("{t}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- used when `RUST_LOG` is not set.
/// * `log_json` -- emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    let registry = tracing_subscriber::registry().with(env_filter);
    if log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_ansi(false))
            .init();
    }
}
