//! Durable queue backend using SQLite

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowgate_queue::{
    EnqueueOptions, JobEntry, JobId, JobState, QueueBackend, QueueCounts, QueueError,
    RetentionPolicy,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, event_name, payload, state, attempts, max_attempts, created_at, \
     visible_at, lease_expires_at, completed_at, failed_at, last_error";

/// SQLite configuration options
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database URL (e.g., "sqlite:flowgate.db?mode=rwc" or "sqlite::memory:")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Enable WAL journal mode for better concurrency
    pub wal_mode: bool,
    /// Busy timeout in seconds
    pub busy_timeout_secs: u32,
    pub retention: RetentionPolicy,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:flowgate.db?mode=rwc".to_string(),
            max_connections: 5,
            wal_mode: true,
            busy_timeout_secs: 30,
            retention: RetentionPolicy::default(),
        }
    }
}

impl SqliteConfig {
    /// Create config for in-memory database (testing)
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            wal_mode: false,
            busy_timeout_secs: 5,
            retention: RetentionPolicy::default(),
        }
    }

    fn is_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}

fn backend_err(e: sqlx::Error) -> QueueError {
    QueueError::Backend(e.to_string())
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, QueueError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| QueueError::Backend(format!("Invalid timestamp {}", ms)))
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, QueueError> {
    ms.map(from_millis).transpose()
}

fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX / 2)
}

fn row_to_entry(row: &SqliteRow) -> Result<JobEntry, QueueError> {
    let id_str: String = row.try_get("id").map_err(backend_err)?;
    let id = Uuid::parse_str(&id_str).map_err(|_| QueueError::Backend("Invalid UUID".into()))?;
    let payload: String = row.try_get("payload").map_err(backend_err)?;
    let state: String = row.try_get("state").map_err(backend_err)?;
    let attempts: i64 = row.try_get("attempts").map_err(backend_err)?;
    let max_attempts: i64 = row.try_get("max_attempts").map_err(backend_err)?;

    Ok(JobEntry {
        id,
        event_name: row.try_get("event_name").map_err(backend_err)?,
        payload: serde_json::from_str(&payload)?,
        state: JobState::from_str(&state).map_err(QueueError::Backend)?,
        attempts: attempts as u32,
        max_attempts: max_attempts as u32,
        created_at: from_millis(row.try_get("created_at").map_err(backend_err)?)?,
        visible_at: from_millis(row.try_get("visible_at").map_err(backend_err)?)?,
        lease_expires_at: opt_from_millis(row.try_get("lease_expires_at").map_err(backend_err)?)?,
        completed_at: opt_from_millis(row.try_get("completed_at").map_err(backend_err)?)?,
        failed_at: opt_from_millis(row.try_get("failed_at").map_err(backend_err)?)?,
        last_error: row.try_get("last_error").map_err(backend_err)?,
    })
}

/// Durable queue backend using SQLite.
///
/// Dequeue is a single `UPDATE ... RETURNING` so concurrent workers never lease the
/// same row; rows left `active` past `lease_expires_at` (crashed worker, restart)
/// are picked up again.
#[derive(Debug, Clone)]
pub struct SqliteQueue {
    pool: SqlitePool,
    retention: RetentionPolicy,
}

impl SqliteQueue {
    /// Connect and run migrations
    pub async fn new_with_config(config: SqliteConfig) -> Result<Self, QueueError> {
        let mut options = SqliteConnectOptions::from_str(&config.url)
            .map_err(backend_err)?
            .pragma("busy_timeout", (config.busy_timeout_secs * 1000).to_string());

        if config.wal_mode {
            options = options.pragma("journal_mode", "WAL");
        }

        let mut pool_options = SqlitePoolOptions::new().max_connections(config.max_connections);
        if config.is_memory() {
            // Every connection to :memory: is a separate database
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(backend_err)?;

        info!(url = %config.url, wal = config.wal_mode, "Connected to SQLite job store");

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| QueueError::Backend(format!("Migration failed: {}", e)))?;

        Ok(Self {
            pool,
            retention: config.retention,
        })
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn prune(&self, state: JobState, keep: usize) -> Result<(), QueueError> {
        let order_column = match state {
            JobState::Completed => "completed_at",
            _ => "failed_at",
        };
        let sql = format!(
            "DELETE FROM jobs WHERE state = ? AND id NOT IN \
             (SELECT id FROM jobs WHERE state = ? ORDER BY {} DESC LIMIT ?)",
            order_column
        );

        let removed = sqlx::query(&sql)
            .bind(state.as_str())
            .bind(state.as_str())
            .bind(keep as i64)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?
            .rows_affected();

        if removed > 0 {
            debug!(state = %state, removed = removed, "Pruned finished jobs");
        }
        Ok(())
    }

    /// Retention runs after the transition has committed, so a failed prune
    /// must not turn a finished job into an error. The next finish retries it.
    async fn prune_finished(&self, state: JobState, keep: usize) {
        if let Err(e) = self.prune(state, keep).await {
            warn!(state = %state, error = %e, "Failed to prune finished jobs");
        }
    }
}

#[async_trait]
impl QueueBackend for SqliteQueue {
    async fn enqueue(
        &self,
        event_name: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        let entry = JobEntry::new(event_name, payload, options);
        let payload = serde_json::to_string(&entry.payload)?;

        sqlx::query(
            "INSERT INTO jobs (id, event_name, payload, state, attempts, max_attempts, created_at, visible_at) \
             VALUES (?, ?, ?, ?, 0, ?, ?, ?)",
        )
        .bind(entry.id.to_string())
        .bind(&entry.event_name)
        .bind(payload)
        .bind(entry.state.as_str())
        .bind(entry.max_attempts as i64)
        .bind(entry.created_at.timestamp_millis())
        .bind(entry.visible_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        Ok(entry.id)
    }

    async fn dequeue(&self, lease: Duration) -> Result<Option<JobEntry>, QueueError> {
        let now = Utc::now().timestamp_millis();
        let sql = format!(
            r#"
            UPDATE jobs
            SET state = 'active', lease_expires_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE (state IN ('waiting', 'delayed') AND visible_at <= ?)
                   OR (state = 'active' AND lease_expires_at <= ?)
                ORDER BY visible_at ASC, created_at ASC
                LIMIT 1
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(now.saturating_add(duration_millis(lease)))
            .bind(now)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;

        row.as_ref().map(row_to_entry).transpose()
    }

    async fn complete(&self, id: JobId) -> Result<bool, QueueError> {
        let updated = sqlx::query(
            "UPDATE jobs SET state = 'completed', attempts = attempts + 1, completed_at = ?, \
             lease_expires_at = NULL \
             WHERE id = ? AND state = 'active'",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?
        .rows_affected();

        if updated == 0 {
            // Distinguish unknown ids from already-finalised jobs
            self.get_job(id).await?;
            return Ok(false);
        }

        self.prune_finished(JobState::Completed, self.retention.keep_completed)
            .await;
        Ok(true)
    }

    async fn retry(&self, id: JobId, error: &str, delay: Duration) -> Result<bool, QueueError> {
        let visible_at = Utc::now()
            .timestamp_millis()
            .saturating_add(duration_millis(delay));

        let updated = sqlx::query(
            "UPDATE jobs SET state = 'delayed', attempts = attempts + 1, visible_at = ?, \
             lease_expires_at = NULL, last_error = ? WHERE id = ? AND state = 'active'",
        )
        .bind(visible_at)
        .bind(error)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?
        .rows_affected();

        if updated == 0 {
            self.get_job(id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn fail(&self, id: JobId, error: &str) -> Result<bool, QueueError> {
        let updated = sqlx::query(
            "UPDATE jobs SET state = 'failed', attempts = attempts + 1, failed_at = ?, \
             lease_expires_at = NULL, last_error = ? WHERE id = ? AND state = 'active'",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(error)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?
        .rows_affected();

        if updated == 0 {
            self.get_job(id).await?;
            return Ok(false);
        }

        self.prune_finished(JobState::Failed, self.retention.keep_failed)
            .await;
        Ok(true)
    }

    async fn get_job(&self, id: JobId) -> Result<JobEntry, QueueError> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?
            .ok_or(QueueError::NotFound)?;

        row_to_entry(&row)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(backend_err)?;
            let n: i64 = row.try_get("n").map_err(backend_err)?;
            counts.add(JobState::from_str(&state).map_err(QueueError::Backend)?, n as u64);
        }
        Ok(counts)
    }
}
