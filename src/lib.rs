pub mod clock;
pub mod config;
pub mod error;
pub mod handlers;
pub mod headers;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod rate_limit;
pub mod record;
pub mod reporter;
pub mod server;
pub mod signals;
pub mod sinks;
pub mod store;
pub mod trace;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing/logging
///
/// `RUST_LOG` takes precedence over `level`. With `json` set, events are
/// written as one JSON object per line.
///
/// Note: This function can only be called once.
pub fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_current_span(false).with_target(true))
            .init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}
