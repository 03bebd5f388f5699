//! # flowgate queue
//!
//! Durable, concurrency-bounded queue for workflow trigger jobs.
//!
//! Features:
//! - `JobHandler` trait for delivery plus lifecycle hooks
//! - Pluggable backend (`MemoryQueue` here, SQLite in `flowgate-persist`)
//! - Worker pool with concurrency control and per-attempt timeout
//! - Retry with exponential backoff, lease-based redelivery, bounded retention

pub mod backend;
pub mod job;
pub mod memory;
pub mod worker;

pub use backend::{QueueBackend, QueueError};
pub use job::{
    BackoffStrategy, EnqueueOptions, JobEntry, JobHandler, JobId, JobResult, JobState,
    QueueCounts, RetentionPolicy, DEFAULT_MAX_ATTEMPTS,
};
pub use memory::MemoryQueue;
pub use worker::{WorkerConfig, WorkerPool};
