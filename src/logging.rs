//! Logging initialization
//!
//! Structured logging through `tracing`, filterable per subsystem. The
//! status reporter emits under the `drover::status` target, so e.g.
//! `RUST_LOG=drover=warn,drover::status=info` keeps the periodic status
//! lines while silencing the rest.

use std::sync::Once;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Install the global subscriber: env filter (`RUST_LOG`) with a fallback
/// level, plus the standard fmt layer. Safe to call more than once; only
/// the first call installs.
pub fn init(default_level: &str) {
    INIT.call_once(|| {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| format!("drover={default_level},info").into()),
            )
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
