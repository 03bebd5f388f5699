//! In-memory queue implementation with time-ordered scheduling

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::backend::{QueueBackend, QueueError};
use crate::job::{EnqueueOptions, JobEntry, JobId, JobState, QueueCounts, RetentionPolicy};

/// Heap entry - orders by run_at time (earliest first), then insertion order
#[derive(Debug, Clone, Eq, PartialEq)]
struct ScheduleEntry {
    run_at: DateTime<Utc>,
    seq: u64,
    id: JobId,
}

impl Ord for ScheduleEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order: earlier run_at = higher priority
        other
            .run_at
            .cmp(&self.run_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ScheduleEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, JobEntry>,
    schedule: BinaryHeap<ScheduleEntry>,
    seq: u64,
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
}

impl Inner {
    fn schedule(&mut self, run_at: DateTime<Utc>, id: JobId) {
        self.seq += 1;
        self.schedule.push(ScheduleEntry {
            run_at,
            seq: self.seq,
            id,
        });
    }
}

/// Process-local queue backend.
///
/// Heap entries are never removed eagerly; an entry is honoured only if it still
/// matches the job's current schedule (`visible_at`, or the lease expiry while active).
#[derive(Debug, Default, Clone)]
pub struct MemoryQueue {
    inner: Arc<RwLock<Inner>>,
    retention: RetentionPolicy,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: RetentionPolicy) -> Self {
        Self {
            inner: Arc::default(),
            retention,
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn enqueue(
        &self,
        event_name: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        let entry = JobEntry::new(event_name, payload, options);
        let id = entry.id;
        let run_at = entry.visible_at;

        let mut inner = self.inner.write().await;
        inner.jobs.insert(id, entry);
        inner.schedule(run_at, id);

        Ok(id)
    }

    async fn dequeue(&self, lease: Duration) -> Result<Option<JobEntry>, QueueError> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let now = Utc::now();

        while inner.schedule.peek().is_some_and(|top| top.run_at <= now) {
            let Some(top) = inner.schedule.pop() else {
                break;
            };
            // Pruned jobs leave their heap entries behind
            let Some(job) = inner.jobs.get_mut(&top.id) else {
                continue;
            };

            let scheduled = match job.state {
                JobState::Active => job.lease_expires_at,
                _ => Some(job.visible_at),
            };
            if scheduled != Some(top.run_at) || !job.is_eligible(now) {
                continue;
            }

            if job.state == JobState::Active {
                tracing::warn!(
                    job_id = %job.id,
                    event = %job.event_name,
                    "Lease expired, re-delivering job"
                );
            }

            let lease_expires_at = now + to_chrono(lease);
            job.state = JobState::Active;
            job.lease_expires_at = Some(lease_expires_at);
            let entry = job.clone();

            inner.schedule(lease_expires_at, entry.id);
            return Ok(Some(entry));
        }

        Ok(None)
    }

    async fn complete(&self, id: JobId) -> Result<bool, QueueError> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let job = inner.jobs.get_mut(&id).ok_or(QueueError::NotFound)?;

        if job.state != JobState::Active {
            return Ok(false);
        }
        job.attempts += 1;
        job.state = JobState::Completed;
        job.completed_at = Some(Utc::now());
        job.lease_expires_at = None;

        inner.completed.push_back(id);
        while inner.completed.len() > self.retention.keep_completed {
            if let Some(old) = inner.completed.pop_front() {
                inner.jobs.remove(&old);
            }
        }

        Ok(true)
    }

    async fn retry(&self, id: JobId, error: &str, delay: Duration) -> Result<bool, QueueError> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let job = inner.jobs.get_mut(&id).ok_or(QueueError::NotFound)?;

        if job.state != JobState::Active {
            return Ok(false);
        }
        let visible_at = Utc::now() + to_chrono(delay);
        job.attempts += 1;
        job.state = JobState::Delayed;
        job.visible_at = visible_at;
        job.lease_expires_at = None;
        job.last_error = Some(error.to_string());

        tracing::debug!(
            job_id = %id,
            attempts = job.attempts,
            delay_ms = delay.as_millis() as u64,
            "Re-queuing job with backoff"
        );

        inner.schedule(visible_at, id);
        Ok(true)
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<bool, QueueError> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let job = inner.jobs.get_mut(&id).ok_or(QueueError::NotFound)?;

        if job.state != JobState::Active {
            return Ok(false);
        }
        job.attempts += 1;
        job.state = JobState::Failed;
        job.failed_at = Some(Utc::now());
        job.lease_expires_at = None;
        job.last_error = Some(error.to_string());

        inner.failed.push_back(id);
        while inner.failed.len() > self.retention.keep_failed {
            if let Some(old) = inner.failed.pop_front() {
                inner.jobs.remove(&old);
            }
        }

        Ok(true)
    }

    async fn get_job(&self, id: JobId) -> Result<JobEntry, QueueError> {
        let inner = self.inner.read().await;
        inner.jobs.get(&id).cloned().ok_or(QueueError::NotFound)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let inner = self.inner.read().await;
        let mut counts = QueueCounts::default();
        for job in inner.jobs.values() {
            counts.add(job.state, 1);
        }
        Ok(counts)
    }
}
