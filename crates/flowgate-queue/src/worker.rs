//! Worker Pool for processing trigger jobs

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::backend::{QueueBackend, QueueError};
use crate::job::{BackoffStrategy, JobEntry, JobHandler, JobResult};

#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub max_concurrency: usize,
    pub poll_interval: Duration,
    /// How long a dequeued job stays leased before another worker may take it
    pub lease: Duration,
    /// Upper bound on a single `execute` call
    pub job_timeout: Duration,
    pub backoff: BackoffStrategy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            poll_interval: Duration::from_millis(100),
            lease: Duration::from_secs(90),
            job_timeout: Duration::from_secs(45),
            backoff: BackoffStrategy::default(),
        }
    }
}

pub struct WorkerPool<B: QueueBackend + ?Sized> {
    pub backend: Arc<B>,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
}

impl<B: QueueBackend + 'static> WorkerPool<B> {
    pub fn new(backend: B, handler: Arc<dyn JobHandler>, config: WorkerConfig) -> Self {
        Self::new_with_arc(Arc::new(backend), handler, config)
    }
}

impl<B: QueueBackend + ?Sized + 'static> WorkerPool<B> {
    /// Create new worker pool from existing Arc backend (supports dyn dispatch)
    pub fn new_with_arc(backend: Arc<B>, handler: Arc<dyn JobHandler>, config: WorkerConfig) -> Self {
        Self {
            backend,
            handler,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Dequeue and process at most one job on the calling task.
    ///
    /// Returns `false` when nothing was eligible.
    pub async fn process_next(&self) -> Result<bool, QueueError> {
        match self.backend.dequeue(self.config.lease).await? {
            Some(entry) => {
                process_entry(&*self.backend, &*self.handler, &self.config, entry).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Run the pool until `shutdown` resolves.
    ///
    /// In-flight jobs keep running on their own tasks after this returns; any that
    /// do not finish keep their lease and are re-delivered once it expires.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        tokio::pin!(shutdown);

        info!(
            "Worker pool started with concurrency {}",
            self.config.max_concurrency
        );

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let idle = match self.backend.dequeue(self.config.lease).await {
                Ok(Some(entry)) => {
                    let backend = self.backend.clone();
                    let handler = self.handler.clone();
                    let config = self.config;

                    tokio::spawn(async move {
                        process_entry(&*backend, &*handler, &config, entry).await;
                        drop(permit);
                    });
                    None
                }
                Ok(None) => Some(self.config.poll_interval),
                Err(e) => {
                    error!("Queue error: {}", e);
                    Some(Duration::from_secs(1))
                }
            };

            if let Some(wait) = idle {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }

        info!("Worker pool stopped taking new jobs");
    }
}

async fn process_entry<B: QueueBackend + ?Sized>(
    backend: &B,
    handler: &dyn JobHandler,
    config: &WorkerConfig,
    mut entry: JobEntry,
) {
    debug!(job_id = %entry.id, event = %entry.event_name, attempt = entry.attempts + 1, "Processing job");

    let result = match tokio::time::timeout(config.job_timeout, handler.execute(&entry)).await {
        Ok(result) => result,
        Err(_) => JobResult::Retry(format!(
            "attempt timed out after {}ms",
            config.job_timeout.as_millis()
        )),
    };

    match result {
        JobResult::Success => match backend.complete(entry.id).await {
            Ok(true) => {
                entry.attempts += 1;
                info!(job_id = %entry.id, event = %entry.event_name, attempts = entry.attempts, "Job completed");
                handler.on_completed(&entry).await;
            }
            Ok(false) => debug!(job_id = %entry.id, "Job already finalised, ignoring completion"),
            Err(e) => error!(job_id = %entry.id, error = %e, "Failed to mark job completed"),
        },
        JobResult::Retry(err) => {
            let attempt = entry.attempts + 1;

            if attempt < entry.max_attempts {
                let delay = config.backoff.delay(attempt);
                match backend.retry(entry.id, &err, delay).await {
                    Ok(true) => {
                        warn!(
                            job_id = %entry.id,
                            event = %entry.event_name,
                            attempt = attempt,
                            max_attempts = entry.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "Job failed, scheduling retry with backoff"
                        );
                        entry.attempts = attempt;
                        entry.last_error = Some(err.clone());
                        handler.on_retry(&entry, attempt, delay, &err).await;
                    }
                    Ok(false) => debug!(job_id = %entry.id, "Job already finalised, ignoring retry"),
                    Err(e) => error!(job_id = %entry.id, error = %e, "Failed to reschedule job"),
                }
            } else {
                match backend.fail(entry.id, &err).await {
                    Ok(true) => {
                        error!(
                            job_id = %entry.id,
                            event = %entry.event_name,
                            attempts = attempt,
                            error = %err,
                            "Job failed permanently"
                        );
                        entry.attempts = attempt;
                        entry.last_error = Some(err.clone());
                        handler.on_failed(&entry, &err).await;
                    }
                    Ok(false) => debug!(job_id = %entry.id, "Job already finalised, ignoring failure"),
                    Err(e) => error!(job_id = %entry.id, error = %e, "Failed to mark job failed"),
                }
            }
        }
    }
}
