//! Tracing setup for the CLI and the agent service.
//!
//! Diagnostics go to stderr and are filtered by `RUST_LOG`. Set
//! `FORGELINE_LOG_JSON=1` for JSON lines instead of the compact format.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_JSON_ENV: &str = "FORGELINE_LOG_JSON";

/// Initialize tracing with a `warn` default.
///
/// # Example
/// ```bash
/// RUST_LOG=forgeline=debug forgeline run demo --spec spec.md
/// ```
pub fn init() {
    init_with_default("warn");
}

/// Initialize tracing, falling back to `default_directive` when `RUST_LOG` is unset.
pub fn init_with_default(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let registry = tracing_subscriber::registry().with(filter);

    if json_requested() {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).json())
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).compact())
            .init();
    }
}

fn json_requested() -> bool {
    std::env::var(LOG_JSON_ENV).is_ok_and(|value| matches!(value.trim(), "1" | "true" | "yes"))
}
