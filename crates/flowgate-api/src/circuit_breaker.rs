//! Circuit breaker for resilient service calls

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::alerting::{Alert, Alerter, Severity};
use crate::metrics::Metrics;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed,
    /// Circuit tripped - requests fail immediately
    Open,
    /// Cooldown elapsed - calls are let through to probe recovery
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding: 0=CLOSED, 1=OPEN, 2=HALF_OPEN
    pub fn gauge_value(&self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,
    /// Time to stay open before letting a probe through
    pub reset_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    /// While open, calls before this instant are rejected
    next_attempt: Instant,
}

/// Thread-safe circuit breaker for one named target.
///
/// State changes happen under a mutex; the wrapped call itself runs without
/// holding it, so concurrent callers are not serialised.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<BreakerState>,
    metrics: Option<Arc<Metrics>>,
    alerter: Option<Alerter>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(name: &str, config: CircuitConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                next_attempt: Instant::now(),
            }),
            metrics: None,
            alerter: None,
        }
    }

    /// Publish state changes to the `circuit_breaker_state` gauge
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        metrics.set_circuit_state(&self.name, CircuitState::Closed);
        self.metrics = Some(metrics);
        self
    }

    /// Send a critical alert whenever the circuit opens
    pub fn with_alerter(mut self, alerter: Alerter) -> Self {
        self.alerter = Some(alerter);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        inner.state = to;
        if let Some(metrics) = &self.metrics {
            metrics.set_circuit_state(&self.name, to);
        }
    }

    /// Check if a call may proceed, moving OPEN to HALF_OPEN once the timeout passed
    pub async fn allow(&self) -> bool {
        let mut inner = self.inner.lock().await;

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if Instant::now() >= inner.next_attempt {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    tracing::info!(circuit = %self.name, "Circuit transitioned to HalfOpen");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call
    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.failure_count = 0;

        if inner.state == CircuitState::HalfOpen {
            self.transition(&mut inner, CircuitState::Closed);
            tracing::info!(circuit = %self.name, "Circuit recovered - now Closed");
        }
    }

    /// Record a failed call
    pub async fn record_failure(&self, error: &str) {
        let opened_until = {
            let mut inner = self.inner.lock().await;
            inner.failure_count = inner.failure_count.saturating_add(1);

            tracing::warn!(
                circuit = %self.name,
                failures = inner.failure_count,
                error = %error,
                "Circuit breaker recorded failure"
            );

            if inner.failure_count >= self.config.failure_threshold {
                let was_open = inner.state == CircuitState::Open;
                inner.next_attempt = Instant::now() + self.config.reset_timeout;
                self.transition(&mut inner, CircuitState::Open);
                let reopen_at = Utc::now()
                    + chrono::Duration::from_std(self.config.reset_timeout)
                        .unwrap_or_else(|_| chrono::Duration::zero());

                tracing::error!(
                    circuit = %self.name,
                    failures = inner.failure_count,
                    next_attempt = %reopen_at.to_rfc3339(),
                    "Circuit tripped - now Open"
                );
                (!was_open).then_some((reopen_at, inner.failure_count))
            } else {
                None
            }
        };

        if let (Some((reopen_at, failures)), Some(alerter)) = (opened_until, &self.alerter) {
            let alert = Alert::new(
                Severity::Critical,
                format!("Circuit breaker {} opened", self.name),
                format!("Calls to {} are short-circuited until the breaker recovers", self.name),
            )
            .with_field("circuit", &self.name)
            .with_field("failures", failures)
            .with_field("nextAttempt", reopen_at.to_rfc3339());
            alerter.send_alert(alert);
        }
    }

    /// Get current state
    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn failure_count(&self) -> u32 {
        self.inner.lock().await.failure_count
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().await;
        let next_attempt = (inner.state == CircuitState::Open).then(|| {
            let remaining = inner.next_attempt.saturating_duration_since(Instant::now());
            Utc::now()
                + chrono::Duration::from_std(remaining)
                    .unwrap_or_else(|_| chrono::Duration::zero())
        });
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            threshold: self.config.failure_threshold,
            next_attempt,
        }
    }

    /// Execute with circuit breaker protection.
    ///
    /// While open the future is dropped without being polled.
    pub async fn call<F, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        if !self.allow().await {
            return Err(CircuitError::Open {
                name: self.name.clone(),
            });
        }

        match f.await {
            Ok(result) => {
                self.record_success().await;
                Ok(result)
            }
            Err(e) => {
                self.record_failure(&e.to_string()).await;
                Err(CircuitError::Failed(e))
            }
        }
    }
}

/// Point-in-time view of a breaker for the dashboard
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub threshold: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt: Option<DateTime<Utc>>,
}

/// Circuit breaker error
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    #[error("Circuit breaker {name} is OPEN")]
    Open { name: String },
    #[error("Call failed: {0}")]
    Failed(#[source] E),
}

/// Process-wide set of breakers, one per named target
#[derive(Debug)]
pub struct BreakerRegistry {
    config: CircuitConfig,
    metrics: Arc<Metrics>,
    alerter: Alerter,
    breakers: RwLock<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitConfig, metrics: Arc<Metrics>, alerter: Alerter) -> Self {
        Self {
            config,
            metrics,
            alerter,
            breakers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Get or create the breaker for `name`
    pub async fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        // Fast path: check if exists
        {
            let breakers = self.breakers.read().await;
            if let Some(breaker) = breakers.get(name) {
                return breaker.clone();
            }
        }

        let mut breakers = self.breakers.write().await;

        // Double-check after acquiring write lock
        if let Some(breaker) = breakers.get(name) {
            return breaker.clone();
        }

        let breaker = Arc::new(
            CircuitBreaker::new(name, self.config)
                .with_metrics(self.metrics.clone())
                .with_alerter(self.alerter.clone()),
        );
        breakers.insert(name.to_string(), breaker.clone());
        breaker
    }

    pub async fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            snapshots.push(breaker.snapshot().await);
        }
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_trips() {
        let config = CircuitConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_millis(100),
        };
        let cb = CircuitBreaker::new("test", config);

        // Should be closed initially
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert!(cb.allow().await);

        cb.record_failure("boom").await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        cb.record_failure("boom").await;
        assert_eq!(cb.state().await, CircuitState::Open);

        // Should reject in open state
        assert!(!cb.allow().await);

        tokio::time::advance(Duration::from_millis(150)).await;

        // Should transition to half-open
        assert!(cb.allow().await);
        assert_eq!(cb.state().await, CircuitState::HalfOpen);

        // Success should close it
        cb.record_success().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.failure_count().await, 0);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new("test", CircuitConfig::default());
        for _ in 0..4 {
            cb.record_failure("boom").await;
        }
        cb.record_success().await;
        cb.record_failure("boom").await;
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.failure_count().await, 1);
    }

    #[tokio::test]
    async fn test_registry_shares_breakers() {
        let registry = BreakerRegistry::new(
            CircuitConfig::default(),
            Arc::new(Metrics::new()),
            Alerter::disabled(),
        );
        let a = registry.get_or_create("engine").await;
        let b = registry.get_or_create("engine").await;
        assert!(Arc::ptr_eq(&a, &b));

        registry.get_or_create("other").await;
        let names: Vec<String> = registry
            .snapshot()
            .await
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["engine".to_string(), "other".to_string()]);
    }
}
