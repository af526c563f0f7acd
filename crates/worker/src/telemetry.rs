// Logging setup
//
// Console logging through tracing-subscriber, filtered by RUST_LOG, or by
// LOG_LEVEL applied to the tripwire crates.

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const DEFAULT_LOG_FILTER: &str = "tripwire_engine=info,tripwire_worker=info";

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// Full filter directive (e.g. "tripwire_engine=debug,sqlx=warn")
    pub log_filter: Option<String>,
    /// Level applied to the tripwire crates when no filter is given
    pub log_level: Option<String>,
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `RUST_LOG`: Log filter
    /// - `LOG_LEVEL`: Level for the tripwire crates (e.g. "debug")
    pub fn from_env() -> Self {
        Self {
            log_filter: std::env::var("RUST_LOG").ok(),
            log_level: std::env::var("LOG_LEVEL").ok(),
        }
    }

    /// The filter directive to install
    pub fn filter_directive(&self) -> String {
        match (&self.log_filter, &self.log_level) {
            (Some(filter), _) => filter.clone(),
            (None, Some(level)) => {
                format!("tripwire_engine={level},tripwire_worker={level}")
            }
            (None, None) => DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

/// Install the global subscriber
///
/// An unparsable filter falls back to the default one.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_new(config.filter_directive())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_filter(filter),
        )
        .try_init()
}
