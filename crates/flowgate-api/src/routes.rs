//! HTTP routes: trigger ingestion, metrics, dashboard and job status

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    middleware::from_fn_with_state,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use flowgate_queue::{JobState, QueueCounts};
use serde::Serialize;
use utoipa::OpenApi;
use uuid::Uuid;

use crate::circuit_breaker::{BreakerSnapshot, CircuitState};
use crate::error::{ApiError, ApiResult, ErrorBody, ErrorResponse};
use crate::metrics::{MetricsSnapshot, RejectionReason};
use crate::middleware::{api_key_middleware, rate_limit_middleware};
use crate::state::AppState;
use crate::validator::validate_trigger;

/// Content type of the Prometheus text exposition format
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Health check response
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    })
}

/// Documented shape of an ingestion request
#[derive(Debug, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    pub event: String,
    #[schema(value_type = Object)]
    pub data: serde_json::Value,
    pub workflow_id: Option<String>,
    /// ISO 8601
    pub timestamp: Option<String>,
}

/// Returned when a trigger has been queued
#[derive(Debug, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TriggerAccepted {
    pub job_id: Uuid,
}

/// Accept a workflow trigger for asynchronous delivery.
///
/// The body is `{ event, data, workflowId?, timestamp? }`; unknown fields are
/// forwarded untouched.
#[utoipa::path(
    post,
    path = "/webhooks/trigger",
    request_body(content = TriggerRequest, content_type = "application/json"),
    responses(
        (status = 202, description = "Trigger queued", body = TriggerAccepted),
        (status = 400, description = "Malformed payload", body = ErrorResponse),
        (status = 401, description = "Missing or invalid API key", body = ErrorResponse),
        (status = 429, description = "Rate limit exceeded", body = ErrorResponse),
        (status = 503, description = "Job store unavailable", body = ErrorResponse)
    ),
    security(
        ("api_key" = [])
    )
)]
pub async fn trigger_webhook(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<TriggerAccepted>)> {
    let reject = |e: ApiError| {
        state
            .metrics()
            .record_ingest_rejection(RejectionReason::Validation);
        e
    };

    let document: serde_json::Value =
        serde_json::from_slice(&body).map_err(|e| reject(e.into()))?;

    let envelope = validate_trigger(document).map_err(|e| {
        tracing::warn!(field = %e.field, reason = %e.reason, "Rejected invalid trigger payload");
        reject(e.into())
    })?;

    let job_id = state
        .queue()
        .enqueue(&envelope.event, envelope.document, state.enqueue_defaults())
        .await?;
    state.metrics().record_job_enqueued(&envelope.event);

    tracing::info!(
        job_id = %job_id,
        event = %envelope.event,
        workflow_id = envelope.workflow_id.as_deref().unwrap_or("-"),
        "Trigger queued"
    );

    Ok((StatusCode::ACCEPTED, Json(TriggerAccepted { job_id })))
}

/// Prometheus metrics handler
#[utoipa::path(
    get,
    path = "/metrics",
    responses(
        (status = 200, description = "Prometheus formatted metrics", body = String)
    )
)]
pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.metrics().snapshot().to_prometheus(),
    )
}

/// Jobs per state
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct QueueDepth {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

impl From<QueueCounts> for QueueDepth {
    fn from(c: QueueCounts) -> Self {
        Self {
            waiting: c.waiting,
            active: c.active,
            completed: c.completed,
            failed: c.failed,
            delayed: c.delayed,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct DashboardResponse {
    pub queue: QueueDepth,
    #[schema(value_type = Object)]
    pub metrics: MetricsSnapshot,
    pub breakers: Vec<BreakerSnapshot>,
    /// `healthy`, or `degraded` while any breaker is open
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

#[utoipa::path(
    get,
    path = "/api/v1/dashboard",
    responses(
        (status = 200, description = "Queue depth, metrics and breaker states", body = DashboardResponse),
        (status = 401, description = "Missing or invalid API key", body = ErrorResponse)
    ),
    security(
        ("api_key" = [])
    )
)]
pub async fn dashboard(State(state): State<AppState>) -> ApiResult<Json<DashboardResponse>> {
    let counts = state.queue().counts().await?;
    let breakers = state.breakers().snapshot().await;

    let status = if breakers.iter().any(|b| b.state == CircuitState::Open) {
        "degraded"
    } else {
        "healthy"
    };

    Ok(Json(DashboardResponse {
        queue: counts.into(),
        metrics: state.metrics().snapshot(),
        breakers,
        status: status.to_string(),
        timestamp: Utc::now(),
    }))
}

/// Job status response
#[derive(Debug, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub event_name: String,
    pub state: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/jobs/{id}",
    params(
        ("id" = Uuid, Path, description = "Job ID returned by the trigger endpoint")
    ),
    responses(
        (status = 200, description = "Job status", body = JobStatusResponse),
        (status = 400, description = "Malformed job id", body = ErrorResponse),
        (status = 404, description = "Job not found or already pruned", body = ErrorResponse)
    ),
    security(
        ("api_key" = [])
    )
)]
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobStatusResponse>> {
    let job_id = Uuid::parse_str(&id)
        .map_err(|_| ApiError::BadRequest(format!("'{}' is not a valid job id", id)))?;

    let job = state.queue().get_job(job_id).await?;

    let next_attempt_at = matches!(job.state, JobState::Waiting | JobState::Delayed)
        .then_some(job.visible_at);

    Ok(Json(JobStatusResponse {
        job_id: job.id,
        event_name: job.event_name,
        state: job.state.as_str().to_string(),
        attempts: job.attempts,
        max_attempts: job.max_attempts,
        created_at: job.created_at,
        next_attempt_at,
        completed_at: job.completed_at,
        failed_at: job.failed_at,
        last_error: job.last_error,
    }))
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        trigger_webhook,
        prometheus_metrics,
        dashboard,
        get_job_status,
    ),
    components(
        schemas(
            HealthResponse, TriggerRequest, TriggerAccepted,
            QueueDepth, DashboardResponse, JobStatusResponse,
            BreakerSnapshot, CircuitState,
            ErrorResponse, ErrorBody,
        )
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        use utoipa::openapi::security::{ApiKey, ApiKeyValue, SecurityScheme};

        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "api_key",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new(
                    crate::auth::API_KEY_HEADER,
                ))),
            )
        }
    }
}

/// Build the API router.
///
/// Ingestion is rate limited before authentication; the dashboard and job
/// status routes require a key but are not rate limited.
pub fn api_router(state: AppState) -> Router {
    let ingest = Router::new()
        .route("/webhooks/trigger", post(trigger_webhook))
        .route_layer(from_fn_with_state(state.clone(), api_key_middleware))
        .route_layer(from_fn_with_state(state.clone(), rate_limit_middleware));

    let operator = Router::new()
        .route("/api/v1/dashboard", get(dashboard))
        .route("/api/v1/jobs/{id}", get(get_job_status))
        .route_layer(from_fn_with_state(state.clone(), api_key_middleware));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/api-docs/openapi.json", get(openapi_json))
        .merge(ingest)
        .merge(operator)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_depth_from_counts() {
        let mut counts = QueueCounts::default();
        counts.add(JobState::Waiting, 3);
        counts.add(JobState::Failed, 1);
        let depth = QueueDepth::from(counts);
        assert_eq!(depth.waiting, 3);
        assert_eq!(depth.failed, 1);
        assert_eq!(depth.active, 0);
    }

    #[test]
    fn test_openapi_lists_every_route() {
        let doc = ApiDoc::openapi();
        for path in [
            "/health",
            "/webhooks/trigger",
            "/metrics",
            "/api/v1/dashboard",
            "/api/v1/jobs/{id}",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {}", path);
        }
        let schemes = doc.components.map(|c| c.security_schemes).unwrap_or_default();
        assert!(schemes.contains_key("api_key"));
    }
}
