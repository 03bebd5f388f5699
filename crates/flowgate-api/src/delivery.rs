//! Webhook delivery to the workflow engine
//!
//! `HttpDelivery` performs the outbound POST; `WebhookJobHandler` plugs it into
//! the worker pool behind a circuit breaker and records metrics and alerts.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flowgate_queue::{JobEntry, JobHandler, JobResult};
use serde::Serialize;
use tokio::time::Instant;

use crate::alerting::{Alert, Alerter, Severity};
use crate::circuit_breaker::{BreakerRegistry, CircuitError};
use crate::config::WebhookConfig;
use crate::metrics::{CallStatus, JobOutcome, Metrics};

/// Header carrying the engine API key
pub const ENGINE_API_KEY_HEADER: &str = "X-N8N-API-KEY";
/// Header identifying this service as the sender
pub const SOURCE_HEADER: &str = "X-Flowgate-Source";

/// Why a delivery attempt failed
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Workflow engine responded with HTTP {0}")]
    Status(u16),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Delivery timed out after {0:?}")]
    Timeout(Duration),
    #[error("Circuit breaker {0} is OPEN")]
    CircuitOpen(String),
}

/// Outbound delivery of one trigger
#[async_trait]
pub trait WebhookDelivery: Send + Sync {
    /// Name of the downstream target, used to pick its circuit breaker
    fn target(&self) -> &str;

    /// Deliver `{eventName, payload}`; any non-2xx outcome is an error
    async fn deliver(&self, event_name: &str, payload: &serde_json::Value)
        -> Result<(), DeliveryError>;
}

/// Base URL plus optional per-event paths
#[derive(Debug, Clone)]
pub struct WebhookRoutes {
    base_url: String,
    paths: BTreeMap<String, String>,
}

impl WebhookRoutes {
    pub fn new(base_url: &str, paths: BTreeMap<String, String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            paths,
        }
    }

    /// URL for `event_name`; unmapped events go to the base URL
    pub fn url_for(&self, event_name: &str) -> String {
        match self.paths.get(event_name) {
            Some(path) => format!("{}/{}", self.base_url, path.trim_start_matches('/')),
            None => self.base_url.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeliveryBody<'a> {
    event_name: &'a str,
    payload: &'a serde_json::Value,
}

/// reqwest-backed delivery
#[derive(Debug, Clone)]
pub struct HttpDelivery {
    target: String,
    routes: WebhookRoutes,
    api_key: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpDelivery {
    pub fn new(config: &WebhookConfig) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        Ok(Self {
            target: "workflow-engine".to_string(),
            routes: WebhookRoutes::new(&config.base_url, config.routes.clone()),
            api_key: config.api_key.clone(),
            timeout: config.timeout,
            client,
        })
    }

    pub fn routes(&self) -> &WebhookRoutes {
        &self.routes
    }
}

#[async_trait]
impl WebhookDelivery for HttpDelivery {
    fn target(&self) -> &str {
        &self.target
    }

    async fn deliver(
        &self,
        event_name: &str,
        payload: &serde_json::Value,
    ) -> Result<(), DeliveryError> {
        let url = self.routes.url_for(event_name);
        tracing::debug!(event = %event_name, url = %url, "Delivering trigger");

        let mut request = self
            .client
            .post(&url)
            .header(SOURCE_HEADER, "flowgate")
            .header("X-Timestamp", chrono::Utc::now().to_rfc3339())
            .json(&DeliveryBody {
                event_name,
                payload,
            });

        if let Some(key) = &self.api_key {
            request = request.header(ENGINE_API_KEY_HEADER, key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DeliveryError::Timeout(self.timeout)
            } else {
                DeliveryError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// Worker-pool handler that delivers jobs through the breaker for their target
pub struct WebhookJobHandler {
    delivery: Arc<dyn WebhookDelivery>,
    breakers: Arc<BreakerRegistry>,
    metrics: Arc<Metrics>,
    alerter: Alerter,
}

impl WebhookJobHandler {
    pub fn new(
        delivery: Arc<dyn WebhookDelivery>,
        breakers: Arc<BreakerRegistry>,
        metrics: Arc<Metrics>,
        alerter: Alerter,
    ) -> Self {
        Self {
            delivery,
            breakers,
            metrics,
            alerter,
        }
    }
}

#[async_trait]
impl JobHandler for WebhookJobHandler {
    async fn execute(&self, job: &JobEntry) -> JobResult {
        let breaker = self.breakers.get_or_create(self.delivery.target()).await;
        let started = Instant::now();

        match breaker
            .call(self.delivery.deliver(&job.event_name, &job.payload))
            .await
        {
            Ok(()) => {
                self.metrics.record_webhook_call(
                    &job.event_name,
                    CallStatus::Success,
                    Some(started.elapsed()),
                );
                JobResult::Success
            }
            Err(CircuitError::Open { name }) => {
                self.metrics
                    .record_webhook_call(&job.event_name, CallStatus::Failure, None);
                tracing::debug!(job_id = %job.id, circuit = %name, "Delivery short-circuited");
                JobResult::Retry(DeliveryError::CircuitOpen(name).to_string())
            }
            Err(CircuitError::Failed(e)) => {
                self.metrics.record_webhook_call(
                    &job.event_name,
                    CallStatus::Failure,
                    Some(started.elapsed()),
                );
                JobResult::Retry(e.to_string())
            }
        }
    }

    async fn on_retry(&self, job: &JobEntry, _attempt: u32, _delay: Duration, _error: &str) {
        self.metrics.record_retry(&job.event_name);
    }

    async fn on_completed(&self, job: &JobEntry) {
        self.metrics
            .record_job_finished(&job.event_name, JobOutcome::Completed);
    }

    async fn on_failed(&self, job: &JobEntry, error: &str) {
        self.metrics
            .record_job_finished(&job.event_name, JobOutcome::Failed);

        let alert = Alert::new(
            Severity::Error,
            "Workflow trigger failed permanently",
            format!(
                "Job {} for event {} exhausted {} attempts",
                job.id, job.event_name, job.max_attempts
            ),
        )
        .with_field("jobId", job.id)
        .with_field("event", &job.event_name)
        .with_field("attempts", job.attempts)
        .with_field("error", error);
        self.alerter.send_alert(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_mapping_normalises_slashes() {
        let mut paths = BTreeMap::new();
        paths.insert("LEAD_CREATED".to_string(), "/webhook/lead-created".to_string());
        paths.insert("USER_CREATED".to_string(), "webhook/user-created".to_string());
        let routes = WebhookRoutes::new("http://engine:5678/", paths);

        assert_eq!(
            routes.url_for("LEAD_CREATED"),
            "http://engine:5678/webhook/lead-created"
        );
        assert_eq!(
            routes.url_for("USER_CREATED"),
            "http://engine:5678/webhook/user-created"
        );
        assert_eq!(routes.url_for("SOMETHING_ELSE"), "http://engine:5678");
    }

    #[test]
    fn test_body_shape() {
        let payload = serde_json::json!({"event": "x", "data": {"id": 1}});
        let body = serde_json::to_value(DeliveryBody {
            event_name: "x",
            payload: &payload,
        })
        .unwrap();
        assert_eq!(body["eventName"], "x");
        assert_eq!(body["payload"]["data"]["id"], 1);
    }
}
