//! Trigger job definitions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Job Identifier
pub type JobId = Uuid;

/// Default ceiling on delivery attempts per job
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Lifecycle state of a trigger job.
///
/// `waiting -> active -> completed`, or on failure
/// `active -> delayed -> active ... -> failed`. `completed` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Enqueued, eligible once `visible_at` passes
    Waiting,
    /// Leased by a worker
    Active,
    /// Delivered successfully
    Completed,
    /// Exhausted its attempts
    Failed,
    /// Waiting out a retry backoff
    Delayed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Delayed => "delayed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "delayed" => Ok(Self::Delayed),
            other => Err(format!("unknown job state '{}'", other)),
        }
    }
}

/// Per-job options accepted at enqueue time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Defer first eligibility by this long (scheduled delivery)
    pub delay: Option<Duration>,
    /// Attempt ceiling for this job
    pub max_attempts: u32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            delay: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl EnqueueOptions {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

/// Result of one delivery attempt
#[derive(Debug)]
pub enum JobResult {
    /// Delivered
    Success,
    /// Attempt failed; the queue decides between retry and terminal failure
    Retry(String),
}

/// Retry backoff strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    Constant { millis: u64 },
    Exponential { initial_millis: u64, multiplier: f64 },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_millis: 2000,
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Delay before the retry that follows failed attempt number `attempt` (1-based).
    ///
    /// Exponential: `initial * multiplier^(attempt - 1)`, so attempts 1, 2, 3 wait
    /// `initial`, `2 * initial`, `4 * initial` with the default multiplier.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Constant { millis } => Duration::from_millis(*millis),
            Self::Exponential {
                initial_millis,
                multiplier,
            } => {
                let exp = attempt.saturating_sub(1).min(30) as i32;
                let millis = (*initial_millis as f64 * multiplier.powi(exp)) as u64;
                Duration::from_millis(millis)
            }
        }
    }
}

/// How many terminal jobs stay queryable before pruning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_completed: 100,
            keep_failed: 500,
        }
    }
}

/// A persisted trigger job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEntry {
    pub id: JobId,
    pub event_name: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    /// Finished delivery attempts, successful or not
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    /// Earliest time a worker may pick the job up
    pub visible_at: DateTime<Utc>,
    /// Set while `active`; past this instant the job is re-eligible
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl JobEntry {
    pub fn new(event_name: &str, payload: serde_json::Value, options: EnqueueOptions) -> Self {
        let now = Utc::now();
        let delay = options
            .delay
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .unwrap_or_else(chrono::Duration::zero);
        // Scheduled jobs count as delayed until they first become visible
        let state = if delay > chrono::Duration::zero() {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        Self {
            id: Uuid::new_v4(),
            event_name: event_name.to_string(),
            payload,
            state,
            attempts: 0,
            max_attempts: options.max_attempts.max(1),
            created_at: now,
            visible_at: now + delay,
            lease_expires_at: None,
            completed_at: None,
            failed_at: None,
            last_error: None,
        }
    }

    /// Whether a dequeue at `now` may claim this job
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Waiting | JobState::Delayed => self.visible_at <= now,
            JobState::Active => self.lease_expires_at.is_some_and(|t| t <= now),
            JobState::Completed | JobState::Failed => false,
        }
    }
}

/// Per-state job counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

impl QueueCounts {
    pub fn add(&mut self, state: JobState, n: u64) {
        match state {
            JobState::Waiting => self.waiting += n,
            JobState::Active => self.active += n,
            JobState::Completed => self.completed += n,
            JobState::Failed => self.failed += n,
            JobState::Delayed => self.delayed += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.completed + self.failed + self.delayed
    }
}

/// Processes dequeued jobs on behalf of the worker pool.
///
/// The lifecycle hooks run after the backend accepted the matching transition.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Make one delivery attempt
    async fn execute(&self, job: &JobEntry) -> JobResult;

    /// Attempt `attempt` failed and the job was rescheduled after `delay`
    async fn on_retry(&self, _job: &JobEntry, _attempt: u32, _delay: Duration, _error: &str) {}

    async fn on_completed(&self, _job: &JobEntry) {}

    /// The job exhausted `max_attempts` and is now terminally failed
    async fn on_failed(&self, _job: &JobEntry, _error: &str) {}
}
