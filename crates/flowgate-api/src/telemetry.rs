//! Tracing subscriber setup
//!
//! Console output through `tracing-subscriber`, filtered by `RUST_LOG`, either as
//! human-readable text or as JSON lines.

use std::str::FromStr;

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str =
    "info,flowgate=debug,flowgate_api=debug,flowgate_queue=debug,flowgate_persist=debug,tower_http=info";

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" | "" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "flowgate".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl TelemetryConfig {
    /// Reads `FLOWGATE_LOG_FORMAT` (`text` or `json`); unknown values fall back to text
    pub fn from_env() -> Self {
        let format = std::env::var("FLOWGATE_LOG_FORMAT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default();

        Self {
            format,
            ..Default::default()
        }
    }
}

/// Install the global subscriber.
///
/// Safe to call more than once; later calls leave the first subscriber in place.
pub fn init_tracing(config: &TelemetryConfig) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match config.format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(false),
            )
            .try_init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init(),
    };

    if installed.is_ok() {
        tracing::info!(
            service = %config.service_name,
            format = ?config.format,
            "Tracing initialised"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("json".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("text".parse::<LogFormat>(), Ok(LogFormat::Text));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "flowgate");
        assert_eq!(config.format, LogFormat::Text);
    }

    #[test]
    fn test_default_filter_covers_every_crate() {
        for target in ["flowgate_api", "flowgate_queue", "flowgate_persist"] {
            assert!(
                DEFAULT_FILTER.contains(&format!("{}=debug", target)),
                "{} missing from default filter",
                target
            );
        }
        assert!(tracing_subscriber::EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = TelemetryConfig::default();
        init_tracing(&config);
        init_tracing(&config);
    }
}
