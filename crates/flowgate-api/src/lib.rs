//! # flowgate API
//!
//! Integration layer between internal services and a workflow automation engine.
//!
//! Features:
//! - Axum ingestion endpoint with payload validation, API-key auth and rate limiting
//! - Durable queue-backed webhook delivery behind per-target circuit breakers
//! - Prometheus-style metrics, operator dashboard and job status endpoints
//! - Best-effort alerting to a chat-ops webhook
//! - Graceful shutdown

pub mod alerting;
pub mod auth;
pub mod circuit_breaker;
pub mod config;
pub mod delivery;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod rate_limiter;
pub mod routes;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod validator;

pub use alerting::{Alert, AlertSink, Alerter, Severity, SlackSink};
pub use auth::ApiKeyAuth;
pub use circuit_breaker::{BreakerRegistry, CircuitBreaker, CircuitConfig, CircuitError, CircuitState};
pub use config::{ConfigError, GatewayConfig};
pub use delivery::{DeliveryError, HttpDelivery, WebhookDelivery, WebhookJobHandler};
pub use error::{ApiError, ApiResult};
pub use metrics::{Metrics, MetricsSnapshot};
pub use rate_limiter::{FixedWindowLimiter, RateLimitConfig};
pub use server::FlowgateServer;
pub use validator::{validate_trigger, ValidationError};
