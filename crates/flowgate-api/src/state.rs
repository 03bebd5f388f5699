//! Application State
//!
//! Centralizes access to the queue, resilience and monitoring services.

use std::sync::Arc;

use flowgate_queue::{EnqueueOptions, QueueBackend};

use crate::auth::ApiKeyAuth;
use crate::circuit_breaker::BreakerRegistry;
use crate::metrics::Metrics;
use crate::rate_limiter::FixedWindowLimiter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    auth: ApiKeyAuth,
    rate_limiter: Arc<FixedWindowLimiter>,
    metrics: Arc<Metrics>,
    breakers: Arc<BreakerRegistry>,
    queue: Arc<dyn QueueBackend>,
    enqueue_defaults: EnqueueOptions,
}

impl AppState {
    pub fn new(
        auth: ApiKeyAuth,
        rate_limiter: Arc<FixedWindowLimiter>,
        metrics: Arc<Metrics>,
        breakers: Arc<BreakerRegistry>,
        queue: Arc<dyn QueueBackend>,
        enqueue_defaults: EnqueueOptions,
    ) -> Self {
        Self {
            auth,
            rate_limiter,
            metrics,
            breakers,
            queue,
            enqueue_defaults,
        }
    }

    pub fn auth(&self) -> &ApiKeyAuth {
        &self.auth
    }

    /// Get rate limiter (cloned Arc for sharing)
    pub fn rate_limiter(&self) -> Arc<FixedWindowLimiter> {
        self.rate_limiter.clone()
    }

    /// Get metrics collector (cloned Arc for sharing)
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn breakers(&self) -> Arc<BreakerRegistry> {
        self.breakers.clone()
    }

    /// Get queue backend (cloned Arc for sharing)
    pub fn queue(&self) -> Arc<dyn QueueBackend> {
        self.queue.clone()
    }

    /// Options applied to every ingested trigger
    pub fn enqueue_defaults(&self) -> EnqueueOptions {
        self.enqueue_defaults
    }
}
