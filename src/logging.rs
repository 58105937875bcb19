//! Logging initialization.
//!
//! Verbosity comes from `RUST_LOG`; without it the default is `info`.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Human-readable output for development.
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().with_target(true))
        .try_init();
}

/// JSON lines for log aggregation.
pub fn init_json() {
    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(fmt::layer().json().with_target(true).with_thread_ids(true))
        .try_init();
}

pub fn init_with(format: LogFormat) {
    match format {
        LogFormat::Pretty => init(),
        LogFormat::Json => init_json(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_does_not_panic() {
        init();
        init_json();
    }
}
