//! Logging bootstrap for services and tests.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format for log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, for local development.
    Pretty,
    /// One JSON object per line, for log shippers.
    Json,
}

/// Install the global tracing subscriber.
///
/// The filter comes from `RUST_LOG` when set, otherwise `default_level`.
/// Calling this twice is harmless; the second call is ignored.
pub fn init_logging(format: LogFormat, default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("logging already initialized, skipping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_init_is_harmless() {
        init_logging(LogFormat::Pretty, "info");
        init_logging(LogFormat::Json, "debug");
    }
}
