pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod pricing;
pub mod ratelimit;
pub mod server;
pub mod signals;
pub mod telemetry;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing/logging
///
/// `RUST_LOG` takes precedence over `level`. `format` is `json` or `text`.
/// Only the first call installs a subscriber; later calls are no-ops.
pub fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let registry = tracing_subscriber::registry().with(filter);

    let result = if format == "json" {
        registry
            .with(fmt::layer().json().with_target(true).with_current_span(false))
            .try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };

    if let Err(e) = result {
        eprintln!("Warning: tracing subscriber already installed: {}", e);
    }
}
