//! Logging initialization.
//!
//! Structured logging via `tracing`, with the filter taken from
//! `RUST_LOG` when set and falling back to [`DEFAULT_LOG_FILTER`].

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "agrodispatch=info,sqlx=warn";

/// Initialize the global tracing subscriber.
///
/// Safe to call once per process; subsequent calls are ignored.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
