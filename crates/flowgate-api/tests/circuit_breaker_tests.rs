use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flowgate_api::alerting::{Alert, AlertError, AlertSink, Alerter, Severity};
use flowgate_api::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState};
use flowgate_api::metrics::Metrics;

fn config(threshold: u32, timeout_ms: u64) -> CircuitConfig {
    CircuitConfig {
        failure_threshold: threshold,
        reset_timeout: Duration::from_millis(timeout_ms),
    }
}

/// Counts how often the protected action actually ran
#[derive(Default)]
struct Spy {
    calls: AtomicU32,
}

impl Spy {
    async fn fail(&self) -> Result<(), String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err("downstream error".to_string())
    }

    async fn succeed(&self) -> Result<&'static str, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("ok")
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct RecordingSink {
    alerts: Mutex<Vec<Alert>>,
}

#[async_trait]
impl AlertSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), AlertError> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

impl RecordingSink {
    /// Alert delivery is detached, so wait for `n` alerts to land
    async fn wait_for(&self, n: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.alerts.lock().unwrap().len() < n {
            assert!(tokio::time::Instant::now() < deadline, "alerts never arrived");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_opens_on_threshold_and_stays_open_for_timeout() {
    let breaker = CircuitBreaker::new("engine", config(5, 60_000));
    let spy = Spy::default();

    for i in 1..=5 {
        assert!(matches!(
            breaker.call(spy.fail()).await,
            Err(CircuitError::Failed(_))
        ));
        let expected = if i < 5 {
            CircuitState::Closed
        } else {
            CircuitState::Open
        };
        assert_eq!(breaker.state().await, expected, "after failure {}", i);
    }

    tokio::time::advance(Duration::from_millis(59_999)).await;
    assert!(!breaker.allow().await);
    assert_eq!(breaker.state().await, CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_never_invokes_action() {
    let breaker = CircuitBreaker::new("engine", config(2, 1_000));
    let spy = Spy::default();

    let _ = breaker.call(spy.fail()).await;
    let _ = breaker.call(spy.fail()).await;
    assert_eq!(spy.calls(), 2);

    for _ in 0..10 {
        match breaker.call(spy.succeed()).await {
            Err(CircuitError::Open { name }) => assert_eq!(name, "engine"),
            other => panic!("expected fast-fail, got {:?}", other.map(|_| ())),
        }
    }
    assert_eq!(spy.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_recovers_through_half_open() {
    let breaker = CircuitBreaker::new("engine", config(2, 500));
    let spy = Spy::default();

    let _ = breaker.call(spy.fail()).await;
    let _ = breaker.call(spy.fail()).await;
    assert_eq!(breaker.state().await, CircuitState::Open);

    tokio::time::advance(Duration::from_millis(500)).await;

    assert_eq!(breaker.call(spy.succeed()).await.unwrap(), "ok");
    assert_eq!(breaker.state().await, CircuitState::Closed);
    assert_eq!(breaker.failure_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_failure_reopens_immediately() {
    let breaker = CircuitBreaker::new("engine", config(3, 500));
    let spy = Spy::default();

    for _ in 0..3 {
        let _ = breaker.call(spy.fail()).await;
    }
    tokio::time::advance(Duration::from_millis(600)).await;
    assert!(breaker.allow().await);
    assert_eq!(breaker.state().await, CircuitState::HalfOpen);

    let _ = breaker.call(spy.fail()).await;
    assert_eq!(breaker.state().await, CircuitState::Open);
    assert!(!breaker.allow().await);
}

#[tokio::test(start_paused = true)]
async fn test_state_gauge_follows_transitions() {
    let metrics = Arc::new(Metrics::new());
    let breaker = CircuitBreaker::new("engine", config(1, 100)).with_metrics(metrics.clone());
    assert_eq!(metrics.snapshot().circuit_state("engine"), Some(0));

    breaker.record_failure("boom").await;
    assert_eq!(metrics.snapshot().circuit_state("engine"), Some(1));

    tokio::time::advance(Duration::from_millis(100)).await;
    assert!(breaker.allow().await);
    assert_eq!(metrics.snapshot().circuit_state("engine"), Some(2));

    breaker.record_success().await;
    assert_eq!(metrics.snapshot().circuit_state("engine"), Some(0));
}

#[tokio::test]
async fn test_opening_sends_one_critical_alert() {
    let sink = Arc::new(RecordingSink::default());
    let breaker =
        CircuitBreaker::new("engine", config(2, 60_000)).with_alerter(Alerter::new(sink.clone()));

    breaker.record_failure("boom").await;
    assert!(sink.alerts.lock().unwrap().is_empty());

    breaker.record_failure("boom").await;
    breaker.record_failure("late failure while open").await;
    sink.wait_for(1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let alerts = sink.alerts.lock().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, Severity::Critical);
    assert_eq!(alerts[0].metadata.get("circuit").map(String::as_str), Some("engine"));
    assert!(alerts[0].metadata.contains_key("nextAttempt"));
}

#[tokio::test]
async fn test_concurrent_failures_are_counted_exactly() {
    let breaker = Arc::new(CircuitBreaker::new("engine", config(1_000, 60_000)));

    let mut handles = Vec::new();
    for _ in 0..50 {
        let breaker = breaker.clone();
        handles.push(tokio::spawn(async move {
            breaker.record_failure("boom").await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(breaker.failure_count().await, 50);
    assert_eq!(breaker.state().await, CircuitState::Closed);
}
