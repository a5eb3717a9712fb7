//! Tracing subscriber setup for mapserve.
//!
//! The level is taken from `RUST_LOG` when set:
//!
//! ```bash
//! # Per-connection lifecycle, dispatch and metrics snapshots
//! RUST_LOG=mapserve_core=debug mapserve 8080
//!
//! # Production
//! RUST_LOG=warn mapserve 8080
//! ```
//!
//! Call exactly one of these functions, once, at startup. A second call
//! panics because a global subscriber is already installed.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Human-readable logs at `info` unless `RUST_LOG` says otherwise.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Human-readable logs at `level` unless `RUST_LOG` says otherwise.
///
/// `level` is any `EnvFilter` directive: `"debug"`, `"mapserve_core=trace"`, ...
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .init();
}

/// JSON lines for log aggregation, at `level` unless `RUST_LOG` says otherwise.
pub fn init_logging_json(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json().with_thread_names(true))
        .init();
}
