//! Tracing setup
//!
//! The library only emits `tracing` events; binaries and tests call
//! [`init_tracing`] to see them.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "httptunnel=info";

/// Install a global fmt subscriber filtered by `RUST_LOG`
///
/// Safe to call more than once; only the first call installs anything.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_line_number(false),
        )
        .with(filter)
        .try_init();
}

/// Like [`init_tracing`] but writes through the test harness capture
pub fn init_test_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("httptunnel=debug"));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer().with_thread_names(true))
        .with(filter)
        .try_init();
}
