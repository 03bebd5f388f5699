//! flowgate server with graceful shutdown

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{middleware, Router};
use flowgate_persist::{SqliteConfig, SqliteQueue};
use flowgate_queue::{
    BackoffStrategy, EnqueueOptions, MemoryQueue, QueueBackend, WorkerConfig, WorkerPool,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tower_http::compression::CompressionLayer;

use crate::alerting::{Alerter, SlackSink};
use crate::auth::ApiKeyAuth;
use crate::circuit_breaker::BreakerRegistry;
use crate::config::GatewayConfig;
use crate::delivery::{HttpDelivery, WebhookDelivery, WebhookJobHandler};
use crate::error::ApiError;
use crate::metrics::Metrics;
use crate::middleware::{
    body_limit_layer, cors_layer, request_id_middleware, timeout_layer, tracing_middleware,
};
use crate::rate_limiter::FixedWindowLimiter;
use crate::routes::api_router;
use crate::state::AppState;

/// Grace added on top of the HTTP timeout before a job attempt is abandoned
const JOB_TIMEOUT_GRACE: Duration = Duration::from_secs(5);
const ALERT_TIMEOUT: Duration = Duration::from_secs(10);

/// Worker settings derived from the gateway configuration.
///
/// The lease outlives the per-attempt timeout, so a live worker never loses its
/// job to redelivery.
pub fn worker_config(config: &GatewayConfig) -> WorkerConfig {
    let job_timeout = config.webhook.timeout + JOB_TIMEOUT_GRACE;
    WorkerConfig {
        max_concurrency: config.queue.concurrency.max(1),
        job_timeout,
        lease: job_timeout * 2,
        backoff: BackoffStrategy::Exponential {
            initial_millis: config.queue.backoff_base.as_millis() as u64,
            multiplier: 2.0,
        },
        ..WorkerConfig::default()
    }
}

/// flowgate server: HTTP surface plus the delivery worker pool
pub struct FlowgateServer {
    config: GatewayConfig,
    state: AppState,
    worker: Arc<WorkerPool<dyn QueueBackend>>,
}

impl FlowgateServer {
    /// Build the production wiring: queue backend, engine client and alert sink
    pub async fn new(config: GatewayConfig) -> Result<Self, ApiError> {
        let queue: Arc<dyn QueueBackend> = if config.queue.uses_memory_backend() {
            tracing::warn!("Using in-memory queue - jobs do not survive a restart");
            Arc::new(MemoryQueue::with_retention(config.queue.retention))
        } else {
            let sqlite = SqliteQueue::new_with_config(SqliteConfig {
                url: config.queue.database_url.clone(),
                retention: config.queue.retention,
                ..SqliteConfig::default()
            })
            .await
            .map_err(|e| ApiError::Internal(format!("Queue init failed: {}", e)))?;
            Arc::new(sqlite)
        };

        let alerter = match &config.alerting.webhook_url {
            Some(url) => {
                let sink = SlackSink::new(url, ALERT_TIMEOUT)
                    .map_err(|e| ApiError::Internal(format!("Alert sink init failed: {}", e)))?;
                tracing::info!("Alert delivery enabled");
                Alerter::new(Arc::new(sink))
            }
            None => {
                tracing::info!("FLOWGATE_ALERT_WEBHOOK_URL not set, alerts are only logged");
                Alerter::disabled()
            }
        };

        let delivery = HttpDelivery::new(&config.webhook)
            .map_err(|e| ApiError::Internal(format!("Webhook client init failed: {}", e)))?;

        Ok(Self::from_parts(config, queue, Arc::new(delivery), alerter))
    }

    /// Assemble a server from explicit collaborators
    pub fn from_parts(
        config: GatewayConfig,
        queue: Arc<dyn QueueBackend>,
        delivery: Arc<dyn WebhookDelivery>,
        alerter: Alerter,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let breakers = Arc::new(BreakerRegistry::new(
            config.breaker,
            metrics.clone(),
            alerter.clone(),
        ));

        let handler = Arc::new(WebhookJobHandler::new(
            delivery,
            breakers.clone(),
            metrics.clone(),
            alerter,
        ));
        let worker = Arc::new(WorkerPool::new_with_arc(
            queue.clone(),
            handler,
            worker_config(&config),
        ));

        let state = AppState::new(
            ApiKeyAuth::from_config(&config),
            Arc::new(FixedWindowLimiter::new(config.rate_limit)),
            metrics,
            breakers,
            queue,
            EnqueueOptions::default().with_max_attempts(config.queue.max_attempts),
        );

        Self {
            config,
            state,
            worker,
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn worker(&self) -> Arc<WorkerPool<dyn QueueBackend>> {
        self.worker.clone()
    }

    /// Router with the full middleware stack
    pub fn router(&self) -> Router {
        api_router(self.state.clone())
            .layer(CompressionLayer::new())
            .layer(body_limit_layer(self.config.max_body_size))
            .layer(timeout_layer(self.config.request_timeout))
            .layer(cors_layer(&self.config.cors_origins))
            .layer(middleware::from_fn(tracing_middleware))
            .layer(middleware::from_fn(request_id_middleware))
    }

    /// Serve on `listener` until `shutdown` resolves, running the worker pool alongside
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), ApiError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let worker = self.worker.clone();
        let worker_task = tokio::spawn(async move {
            worker
                .run_until(async move {
                    let _ = stop_rx.wait_for(|stopped| *stopped).await;
                })
                .await;
        });

        tracing::info!(
            addr = %listener.local_addr()?,
            environment = self.config.environment.as_str(),
            "flowgate listening"
        );

        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await;

        let _ = stop_tx.send(true);
        if let Err(e) = worker_task.await {
            tracing::error!(error = %e, "Worker pool task ended abnormally");
        }

        served.map_err(|e| ApiError::Internal(format!("Server error: {}", e)))?;
        tracing::info!("Server shutdown complete");
        Ok(())
    }

    /// Bind the configured address and serve until SIGINT or SIGTERM
    pub async fn run(self) -> Result<(), ApiError> {
        let listener = TcpListener::bind(self.config.addr).await?;
        self.serve(listener, shutdown_signal()).await
    }
}

/// Graceful shutdown signal handler
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
