//! Tracing subscriber initialization for binaries and tests.
//!
//! Libraries stay subscriber-agnostic; only binaries and examples install a
//! subscriber.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize a compact tracing subscriber filtered by `RUST_LOG`
/// (default: "info").
///
/// # Panics
/// Panics if a subscriber is already installed.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(false)
                .compact(),
        )
        .init();
}

/// Same as [`init_tracing`] but with a programmatic filter, e.g.
/// `"debug,raceway_transport=trace"`.
///
/// # Panics
/// Panics if a subscriber is already installed or the filter is invalid.
pub fn init_tracing_with_filter(filter: &str) {
    let env_filter = EnvFilter::new(filter);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(false)
                .compact(),
        )
        .init();
}
