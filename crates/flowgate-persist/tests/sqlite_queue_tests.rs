//! SqliteQueue against in-memory and on-disk databases

use std::time::Duration;

use flowgate_persist::{SqliteConfig, SqliteQueue};
use flowgate_queue::{EnqueueOptions, JobState, QueueBackend, QueueError, RetentionPolicy};
use serde_json::json;

async fn memory_queue() -> SqliteQueue {
    SqliteQueue::new_with_config(SqliteConfig::memory())
        .await
        .expect("in-memory sqlite")
}

fn file_config(dir: &tempfile::TempDir) -> SqliteConfig {
    SqliteConfig {
        url: format!("sqlite:{}?mode=rwc", dir.path().join("jobs.db").display()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_enqueue_and_dequeue_round_trip() {
    let queue = memory_queue().await;
    let payload = json!({"event": "lead_created", "data": {"id": 7}});

    let id = queue
        .enqueue("lead_created", payload.clone(), EnqueueOptions::default())
        .await
        .unwrap();

    let job = queue.get_job(id).await.unwrap();
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_attempts, 3);

    let leased = queue
        .dequeue(Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(leased.id, id);
    assert_eq!(leased.state, JobState::Active);
    assert_eq!(leased.payload, payload);
    assert!(leased.lease_expires_at.is_some());

    assert!(queue.dequeue(Duration::from_secs(30)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_delayed_job_is_not_leased_early() {
    let queue = memory_queue().await;
    queue
        .enqueue(
            "later",
            json!({}),
            EnqueueOptions::default().with_delay(Duration::from_secs(60)),
        )
        .await
        .unwrap();

    assert!(queue.dequeue(Duration::from_secs(30)).await.unwrap().is_none());
    assert_eq!(queue.counts().await.unwrap().delayed, 1);
}

#[tokio::test]
async fn test_retry_then_fail_tracks_attempts() {
    let queue = memory_queue().await;
    let id = queue
        .enqueue("x", json!({}), EnqueueOptions::default().with_max_attempts(2))
        .await
        .unwrap();

    queue.dequeue(Duration::from_secs(30)).await.unwrap().unwrap();
    assert!(queue.retry(id, "HTTP 500", Duration::ZERO).await.unwrap());

    let job = queue.get_job(id).await.unwrap();
    assert_eq!(job.state, JobState::Delayed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("HTTP 500"));

    let again = queue
        .dequeue(Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.id, id);
    assert!(queue.fail(id, "HTTP 502").await.unwrap());

    let job = queue.get_job(id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 2);
    assert!(job.failed_at.is_some());
}

#[tokio::test]
async fn test_transitions_on_inactive_job_are_ignored() {
    let queue = memory_queue().await;
    let id = queue
        .enqueue("x", json!({}), EnqueueOptions::default())
        .await
        .unwrap();

    // Still waiting, never leased
    assert!(!queue.complete(id).await.unwrap());

    queue.dequeue(Duration::from_secs(30)).await.unwrap().unwrap();
    assert!(queue.complete(id).await.unwrap());
    assert!(!queue.complete(id).await.unwrap());
    assert!(!queue.fail(id, "late").await.unwrap());

    let job = queue.get_job(id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let queue = memory_queue().await;
    let missing = uuid::Uuid::new_v4();
    assert!(matches!(
        queue.get_job(missing).await,
        Err(QueueError::NotFound)
    ));
    assert!(matches!(
        queue.complete(missing).await,
        Err(QueueError::NotFound)
    ));
}

#[tokio::test]
async fn test_expired_lease_is_redelivered() {
    let queue = memory_queue().await;
    let id = queue
        .enqueue("x", json!({}), EnqueueOptions::default())
        .await
        .unwrap();

    queue
        .dequeue(Duration::from_millis(10))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let redelivered = queue
        .dequeue(Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(redelivered.id, id);
    assert_eq!(redelivered.attempts, 0);
}

#[tokio::test]
async fn test_retention_keeps_newest_completed_jobs() {
    let queue = SqliteQueue::new_with_config(SqliteConfig {
        retention: RetentionPolicy {
            keep_completed: 2,
            keep_failed: 500,
        },
        ..SqliteConfig::memory()
    })
    .await
    .unwrap();

    let mut ids = Vec::new();
    for i in 0..4 {
        let id = queue
            .enqueue("x", json!({ "n": i }), EnqueueOptions::default())
            .await
            .unwrap();
        queue.dequeue(Duration::from_secs(30)).await.unwrap().unwrap();
        assert!(queue.complete(id).await.unwrap());
        ids.push(id);
        // completed_at has millisecond resolution
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(queue.counts().await.unwrap().completed, 2);
    assert!(queue.get_job(ids[0]).await.is_err());
    assert!(queue.get_job(ids[3]).await.is_ok());
}

#[tokio::test]
async fn test_finish_succeeds_when_pruning_fails() {
    let queue = SqliteQueue::new_with_config(SqliteConfig {
        retention: RetentionPolicy {
            keep_completed: 0,
            keep_failed: 0,
        },
        ..SqliteConfig::memory()
    })
    .await
    .unwrap();

    sqlx::query(
        "CREATE TRIGGER block_prune BEFORE DELETE ON jobs \
         BEGIN SELECT RAISE(ABORT, 'database is locked'); END",
    )
    .execute(queue.pool())
    .await
    .unwrap();

    let done = queue
        .enqueue("done", json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    queue.dequeue(Duration::from_secs(30)).await.unwrap().unwrap();
    assert!(queue.complete(done).await.unwrap());

    let dead = queue
        .enqueue("dead", json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    queue.dequeue(Duration::from_secs(30)).await.unwrap().unwrap();
    assert!(queue.fail(dead, "boom").await.unwrap());

    assert_eq!(queue.get_job(done).await.unwrap().state, JobState::Completed);
    assert_eq!(queue.get_job(dead).await.unwrap().state, JobState::Failed);
}

#[tokio::test]
async fn test_jobs_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();

    let (waiting, leased) = {
        let queue = SqliteQueue::new_with_config(file_config(&dir)).await.unwrap();
        let a = queue
            .enqueue("first", json!({"n": 1}), EnqueueOptions::default())
            .await
            .unwrap();
        let b = queue
            .enqueue("second", json!({"n": 2}), EnqueueOptions::default())
            .await
            .unwrap();
        // Lease `a` and "crash" before finishing it
        let job = queue
            .dequeue(Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, a);
        queue.pool().close().await;
        (b, a)
    };

    tokio::time::sleep(Duration::from_millis(40)).await;

    let queue = SqliteQueue::new_with_config(file_config(&dir)).await.unwrap();
    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.total(), 2);

    let mut seen = Vec::new();
    while let Some(job) = queue.dequeue(Duration::from_secs(30)).await.unwrap() {
        seen.push(job.id);
    }
    seen.sort();
    let mut expected = vec![waiting, leased];
    expected.sort();
    assert_eq!(seen, expected);
}
