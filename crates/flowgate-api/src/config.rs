//! Configuration management for flowgate
//!
//! Everything is read from environment variables. Each section has a `Default`
//! that mirrors the documented defaults, and `GatewayConfig::from_env` rejects
//! values that do not parse instead of silently falling back.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use flowgate_queue::{RetentionPolicy, DEFAULT_MAX_ATTEMPTS};

use crate::circuit_breaker::CircuitConfig;
use crate::rate_limiter::RateLimitConfig;

/// Error types for configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
        }
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" | "test" | "staging" => Ok(Self::Development),
            other => Err(ConfigError::Invalid(format!(
                "FLOWGATE_ENV must be 'development' or 'production', got '{}'",
                other
            ))),
        }
    }
}

/// Ingestion authentication settings
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Pre-shared key expected in `X-API-Key` (env: FLOWGATE_API_KEY)
    pub api_key: Option<String>,
    /// Explicit opt-in to accept unauthenticated ingestion when no key is set
    /// (env: FLOWGATE_ALLOW_UNAUTHENTICATED). Ignored in production.
    pub allow_unauthenticated: bool,
}

/// Outbound workflow-engine settings
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Base URL of the workflow engine (env: FLOWGATE_WEBHOOK_URL)
    pub base_url: String,
    /// Per-event path overrides (env: FLOWGATE_WEBHOOK_ROUTES, `EVENT=/path,...`)
    pub routes: BTreeMap<String, String>,
    /// Key forwarded to the engine (env: FLOWGATE_WEBHOOK_API_KEY)
    pub api_key: Option<String>,
    /// Per-delivery timeout (env: FLOWGATE_WEBHOOK_TIMEOUT_MS)
    pub timeout: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5678".to_string(),
            routes: BTreeMap::new(),
            api_key: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Queue and worker settings
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// `memory` or a sqlx SQLite URL (env: DATABASE_URL)
    pub database_url: String,
    pub concurrency: usize,
    pub max_attempts: u32,
    /// First retry delay; later retries double it
    pub backoff_base: Duration,
    pub retention: RetentionPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            database_url: "sqlite:flowgate.db?mode=rwc".to_string(),
            concurrency: 10,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base: Duration::from_millis(2000),
            retention: RetentionPolicy::default(),
        }
    }
}

impl QueueSettings {
    pub fn uses_memory_backend(&self) -> bool {
        self.database_url.eq_ignore_ascii_case("memory")
    }
}

/// Alerting sink settings
#[derive(Debug, Clone, Default)]
pub struct AlertConfig {
    /// Chat-ops incoming webhook (env: FLOWGATE_ALERT_WEBHOOK_URL)
    pub webhook_url: Option<String>,
}

/// Full gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub addr: SocketAddr,
    pub environment: Environment,
    pub request_timeout: Duration,
    pub max_body_size: usize,
    /// Allowed browser origins for the dashboard (env: FLOWGATE_CORS_ORIGINS)
    pub cors_origins: Vec<String>,
    pub auth: AuthConfig,
    pub webhook: WebhookConfig,
    pub queue: QueueSettings,
    pub breaker: CircuitConfig,
    pub rate_limit: RateLimitConfig,
    pub alerting: AlertConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            environment: Environment::default(),
            request_timeout: Duration::from_secs(30),
            max_body_size: 1024 * 1024,
            cors_origins: Vec::new(),
            auth: AuthConfig::default(),
            webhook: WebhookConfig::default(),
            queue: QueueSettings::default(),
            breaker: CircuitConfig::default(),
            rate_limit: RateLimitConfig::default(),
            alerting: AlertConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port: u16 = match get("FLOWGATE_PORT").or_else(|| get("PORT")) {
            Some(raw) => parse_value("FLOWGATE_PORT", &raw)?,
            None => defaults.addr.port(),
        };

        let environment = match get("FLOWGATE_ENV") {
            Some(raw) => raw.parse()?,
            None => Environment::default(),
        };

        let config = Self {
            addr: SocketAddr::from(([0, 0, 0, 0], port)),
            environment,
            request_timeout: Duration::from_secs(parse_or(
                &get,
                "FLOWGATE_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )?),
            max_body_size: parse_or(&get, "FLOWGATE_MAX_BODY_BYTES", defaults.max_body_size)?,
            cors_origins: get("FLOWGATE_CORS_ORIGINS")
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            auth: AuthConfig {
                api_key: get("FLOWGATE_API_KEY"),
                allow_unauthenticated: parse_bool(&get, "FLOWGATE_ALLOW_UNAUTHENTICATED")?,
            },
            webhook: WebhookConfig {
                base_url: get("FLOWGATE_WEBHOOK_URL").unwrap_or(defaults.webhook.base_url),
                routes: match get("FLOWGATE_WEBHOOK_ROUTES") {
                    Some(raw) => parse_routes(&raw)?,
                    None => BTreeMap::new(),
                },
                api_key: get("FLOWGATE_WEBHOOK_API_KEY"),
                timeout: Duration::from_millis(parse_or(
                    &get,
                    "FLOWGATE_WEBHOOK_TIMEOUT_MS",
                    defaults.webhook.timeout.as_millis() as u64,
                )?),
            },
            queue: QueueSettings {
                database_url: get("DATABASE_URL").unwrap_or(defaults.queue.database_url),
                concurrency: parse_or(&get, "FLOWGATE_QUEUE_CONCURRENCY", defaults.queue.concurrency)?,
                max_attempts: parse_or(
                    &get,
                    "FLOWGATE_QUEUE_MAX_ATTEMPTS",
                    defaults.queue.max_attempts,
                )?,
                backoff_base: Duration::from_millis(parse_or(
                    &get,
                    "FLOWGATE_QUEUE_BACKOFF_MS",
                    defaults.queue.backoff_base.as_millis() as u64,
                )?),
                retention: RetentionPolicy {
                    keep_completed: parse_or(
                        &get,
                        "FLOWGATE_QUEUE_KEEP_COMPLETED",
                        defaults.queue.retention.keep_completed,
                    )?,
                    keep_failed: parse_or(
                        &get,
                        "FLOWGATE_QUEUE_KEEP_FAILED",
                        defaults.queue.retention.keep_failed,
                    )?,
                },
            },
            breaker: CircuitConfig {
                failure_threshold: parse_or(
                    &get,
                    "FLOWGATE_BREAKER_THRESHOLD",
                    defaults.breaker.failure_threshold,
                )?,
                reset_timeout: Duration::from_millis(parse_or(
                    &get,
                    "FLOWGATE_BREAKER_TIMEOUT_MS",
                    defaults.breaker.reset_timeout.as_millis() as u64,
                )?),
            },
            rate_limit: RateLimitConfig {
                window: Duration::from_millis(parse_or(
                    &get,
                    "FLOWGATE_RATE_LIMIT_WINDOW_MS",
                    defaults.rate_limit.window.as_millis() as u64,
                )?),
                max_requests: parse_or(
                    &get,
                    "FLOWGATE_RATE_LIMIT_MAX",
                    defaults.rate_limit.max_requests,
                )?,
            },
            alerting: AlertConfig {
                webhook_url: get("FLOWGATE_ALERT_WEBHOOK_URL"),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that are unsafe or cannot work
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environment.is_production() && self.auth.api_key.is_none() {
            return Err(ConfigError::MissingEnvVar(
                "FLOWGATE_API_KEY (required in production)".to_string(),
            ));
        }
        if self.queue.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "FLOWGATE_QUEUE_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        if self.queue.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "FLOWGATE_QUEUE_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "FLOWGATE_BREAKER_THRESHOLD must be at least 1".to_string(),
            ));
        }
        if self.rate_limit.max_requests == 0 || self.rate_limit.window.is_zero() {
            return Err(ConfigError::Invalid(
                "rate limit window and max must be positive".to_string(),
            ));
        }
        if !self.webhook.base_url.starts_with("http://")
            && !self.webhook.base_url.starts_with("https://")
        {
            return Err(ConfigError::Invalid(format!(
                "FLOWGATE_WEBHOOK_URL must be an http(s) URL, got '{}'",
                self.webhook.base_url
            )));
        }
        Ok(())
    }

    /// Whether ingestion accepts requests without a key
    pub fn auth_bypass_enabled(&self) -> bool {
        !self.environment.is_production()
            && self.auth.api_key.is_none()
            && self.auth.allow_unauthenticated
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{} has invalid value '{}'", key, raw)))
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn parse_bool<G>(get: &G, key: &str) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.trim().to_lowercase()) {
        None => Ok(false),
        Some(v) if v == "1" || v == "true" || v == "yes" => Ok(true),
        Some(v) if v == "0" || v == "false" || v == "no" => Ok(false),
        Some(v) => Err(ConfigError::Invalid(format!(
            "{} must be a boolean, got '{}'",
            key, v
        ))),
    }
}

/// Parse `EVENT=/path,OTHER=/other` into a route table
pub fn parse_routes(raw: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut routes = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (event, path) = pair.split_once('=').ok_or_else(|| {
            ConfigError::Invalid(format!(
                "FLOWGATE_WEBHOOK_ROUTES entry '{}' is not EVENT=/path",
                pair
            ))
        })?;
        let (event, path) = (event.trim(), path.trim());
        if event.is_empty() || path.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "FLOWGATE_WEBHOOK_ROUTES entry '{}' is not EVENT=/path",
                pair
            )));
        }
        routes.insert(event.to_string(), path.to_string());
    }
    Ok(routes)
}
