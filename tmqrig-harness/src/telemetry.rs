//! Tracing subscriber setup for the harness binary and live runs.

use tmqrig_core::{ConfigError, HarnessError, HarnessResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when neither `TMQRIG_LOG` nor `RUST_LOG` is set.
pub const DEFAULT_LOG_FILTER: &str = "tmqrig=debug,info";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Telemetry configuration from environment variables.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// `EnvFilter` directives
    pub filter: String,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: std::env::var("TMQRIG_LOG")
                .or_else(|_| std::env::var("RUST_LOG"))
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string()),
            format: match std::env::var("TMQRIG_LOG_FORMAT") {
                Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Compact,
            },
        }
    }
}

/// Install the global tracing subscriber.
///
/// Should be called once at startup; a second call returns a config error.
pub fn init_tracing(config: &TelemetryConfig) -> HarnessResult<()> {
    let env_filter = EnvFilter::try_new(&config.filter).map_err(|e| {
        HarnessError::Config(ConfigError::InvalidValue {
            field: "TMQRIG_LOG".to_string(),
            value: config.filter.clone(),
            reason: e.to_string(),
        })
    })?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).try_init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact().with_target(true))
            .try_init(),
    };
    result.map_err(|e| {
        HarnessError::Config(ConfigError::InvalidValue {
            field: "subscriber".to_string(),
            value: format!("{:?}", config.format),
            reason: format!("Failed to init subscriber: {}", e),
        })
    })?;

    tracing::info!(filter = %config.filter, format = ?config.format, "Telemetry initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_rejected() {
        let config = TelemetryConfig {
            filter: "tmqrig=notalevel[".to_string(),
            format: LogFormat::Compact,
        };
        assert!(matches!(init_tracing(&config), Err(HarnessError::Config(_))));
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }
}
