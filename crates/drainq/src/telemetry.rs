//! Logging setup
//!
//! Installs a `tracing-subscriber` console layer filtered by `RUST_LOG`
//! (or `LOG_LEVEL`). Library code only emits events; binaries embedding the
//! listener call [`init_telemetry`] once at startup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer};

/// Telemetry configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name, used as the default filter target
    pub service_name: String,
    /// Log filter (e.g., "info", "drainq=debug")
    pub log_filter: Option<String>,
    /// Whether to include the event target in console output
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "drainq".to_string(),
            log_filter: None,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `OTEL_SERVICE_NAME`: Service name (default: "drainq")
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("OTEL_SERVICE_NAME")
                .unwrap_or_else(|_| "drainq".to_string()),
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            with_target: true,
        }
    }

    /// The filter this configuration resolves to
    ///
    /// Falls back to `info` when no filter is set or it doesn't parse.
    pub fn env_filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

/// Install the global tracing subscriber
///
/// Fails if a global subscriber is already set.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TryInitError> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(config.with_target)
        .with_filter(config.env_filter());

    tracing_subscriber::registry().with(console_layer).try_init()?;

    tracing::debug!(service_name = %config.service_name, "Telemetry initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn test_default_filter_is_info() {
        let config = TelemetryConfig::default();
        assert_eq!(config.env_filter().max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn test_custom_filter() {
        let config = TelemetryConfig {
            log_filter: Some("drainq=debug".into()),
            ..Default::default()
        };
        assert_eq!(config.env_filter().max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn test_invalid_filter_falls_back() {
        let config = TelemetryConfig {
            log_filter: Some("drainq=notalevel".into()),
            ..Default::default()
        };
        assert_eq!(config.env_filter().max_level_hint(), Some(LevelFilter::INFO));
    }

    #[test]
    fn test_second_init_fails() {
        let config = TelemetryConfig::default();
        let _ = init_telemetry(&config);
        assert!(init_telemetry(&config).is_err());
    }
}
