//! Queue Backend Trait

use crate::job::{EnqueueOptions, JobEntry, JobId, QueueCounts};
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Job not found")]
    NotFound,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Storage behind the workflow queue.
///
/// Implementations must be safe under concurrent enqueue/dequeue and give
/// at-least-once delivery: a dequeued job is leased, and if the lease runs out
/// before `complete`/`retry`/`fail` the job becomes eligible again.
///
/// `complete`, `retry` and `fail` only apply to jobs currently `active`; on any
/// other state they change nothing and return `Ok(false)`.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Persist a new `waiting` job and return its id
    async fn enqueue(
        &self,
        event_name: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError>;

    /// Lease the next eligible job for `lease`, marking it `active`
    async fn dequeue(&self, lease: Duration) -> Result<Option<JobEntry>, QueueError>;

    /// Count the successful attempt and mark an active job `completed`
    async fn complete(&self, id: JobId) -> Result<bool, QueueError>;

    /// Count a failed attempt and park the job as `delayed` for `delay`
    async fn retry(&self, id: JobId, error: &str, delay: Duration) -> Result<bool, QueueError>;

    /// Count a failed attempt and mark the job terminally `failed`
    async fn fail(&self, id: JobId, error: &str) -> Result<bool, QueueError>;

    /// Fetch a job by id
    async fn get_job(&self, id: JobId) -> Result<JobEntry, QueueError>;

    /// Job counts by state
    async fn counts(&self) -> Result<QueueCounts, QueueError>;
}
