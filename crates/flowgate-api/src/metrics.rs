//! Metrics registry for webhook delivery
//!
//! Hand-rolled atomics grouped into labelled families, exported in the
//! Prometheus text exposition format. Every update happens at the point of
//! observation, so a scrape always sees current values.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;

use crate::circuit_breaker::CircuitState;

/// Upper bounds (seconds) of the webhook duration histogram
pub const DURATION_BUCKETS: [f64; BUCKET_COUNT] = [0.1, 0.5, 1.0, 2.0, 5.0, 10.0];

const BUCKET_COUNT: usize = 6;

const PREFIX: &str = "flowgate";

/// Distinct label sets kept per event-labelled family
pub const MAX_LABEL_SETS: usize = 256;

/// Event label that absorbs new event names once a family is full
pub const OVERFLOW_EVENT: &str = "other";

/// Outcome label of a webhook call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Failure,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Terminal job outcome label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Why the ingestion endpoint turned a request away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    Validation,
    Unauthorized,
    RateLimited,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Unauthorized => "unauthorized",
            Self::RateLimited => "rate_limited",
        }
    }
}

#[derive(Debug, Default)]
struct Histogram {
    /// Non-cumulative count per bucket; the last slot is `+Inf`
    buckets: [AtomicU64; BUCKET_COUNT + 1],
    count: AtomicU64,
    /// Sum of observations as f64 bits
    sum_bits: AtomicU64,
}

impl Histogram {
    fn observe(&self, seconds: f64) {
        let slot = DURATION_BUCKETS
            .iter()
            .position(|bound| seconds <= *bound)
            .unwrap_or(BUCKET_COUNT);
        self.buckets[slot].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .sum_bits
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f64::from_bits(bits) + seconds).to_bits())
            });
    }

    fn snapshot(&self) -> HistogramValue {
        let mut cumulative = 0;
        let buckets = DURATION_BUCKETS
            .iter()
            .enumerate()
            .map(|(i, bound)| {
                cumulative += self.buckets[i].load(Ordering::Relaxed);
                (*bound, cumulative)
            })
            .collect();
        HistogramValue {
            buckets,
            count: self.count.load(Ordering::Relaxed),
            sum: f64::from_bits(self.sum_bits.load(Ordering::Relaxed)),
        }
    }
}

/// One labelled metric family.
///
/// Event names come from clients, so families with an `event` label hold at
/// most `MAX_LABEL_SETS` children; new events past that are counted under
/// `event="other"`.
#[derive(Debug)]
struct Family<T> {
    label_names: &'static [&'static str],
    event_label: Option<usize>,
    children: RwLock<BTreeMap<Vec<String>, Arc<T>>>,
}

impl<T: Default> Family<T> {
    fn new(label_names: &'static [&'static str]) -> Self {
        Self {
            label_names,
            event_label: label_names.iter().position(|name| *name == "event"),
            children: RwLock::new(BTreeMap::new()),
        }
    }

    fn with(&self, values: &[&str]) -> Arc<T> {
        let mut key: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        {
            let children = self.children.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(child) = children.get(&key) {
                return child.clone();
            }
        }
        let mut children = self.children.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = self.event_label {
            if !children.contains_key(&key) && children.len() >= MAX_LABEL_SETS {
                key[slot] = OVERFLOW_EVENT.to_string();
            }
        }
        children.entry(key).or_default().clone()
    }

    fn collect<V>(&self, read: impl Fn(&T) -> V) -> Vec<Sample<V>> {
        let children = self.children.read().unwrap_or_else(PoisonError::into_inner);
        children
            .iter()
            .map(|(values, child)| Sample {
                labels: self
                    .label_names
                    .iter()
                    .zip(values)
                    .map(|(name, value)| (name.to_string(), value.clone()))
                    .collect(),
                value: read(child),
            })
            .collect()
    }
}

/// Process-wide metrics for the trigger pipeline
#[derive(Debug)]
pub struct Metrics {
    webhook_calls: Family<AtomicU64>,
    webhook_duration: Family<Histogram>,
    retry_attempts: Family<AtomicU64>,
    circuit_breaker_state: Family<AtomicI64>,
    jobs_enqueued: Family<AtomicU64>,
    jobs_finished: Family<AtomicU64>,
    ingest_rejections: Family<AtomicU64>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> Self {
        Self {
            webhook_calls: Family::new(&["event", "status"]),
            webhook_duration: Family::new(&["event"]),
            retry_attempts: Family::new(&["event"]),
            circuit_breaker_state: Family::new(&["name"]),
            jobs_enqueued: Family::new(&["event"]),
            jobs_finished: Family::new(&["event", "outcome"]),
            ingest_rejections: Family::new(&["reason"]),
        }
    }

    /// Record a delivery attempt. Short-circuited attempts carry no duration.
    pub fn record_webhook_call(&self, event: &str, status: CallStatus, duration: Option<Duration>) {
        self.webhook_calls
            .with(&[event, status.as_str()])
            .fetch_add(1, Ordering::Relaxed);
        if let Some(duration) = duration {
            self.webhook_duration
                .with(&[event])
                .observe(duration.as_secs_f64());
        }
    }

    pub fn record_retry(&self, event: &str) {
        self.retry_attempts
            .with(&[event])
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_circuit_state(&self, name: &str, state: CircuitState) {
        self.circuit_breaker_state
            .with(&[name])
            .store(state.gauge_value(), Ordering::Relaxed);
    }

    pub fn record_job_enqueued(&self, event: &str) {
        self.jobs_enqueued
            .with(&[event])
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_finished(&self, event: &str, outcome: JobOutcome) {
        self.jobs_finished
            .with(&[event, outcome.as_str()])
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ingest_rejection(&self, reason: RejectionReason) {
        self.ingest_rejections
            .with(&[reason.as_str()])
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);
        MetricsSnapshot {
            webhook_calls: self.webhook_calls.collect(load),
            webhook_duration_seconds: self.webhook_duration.collect(Histogram::snapshot),
            retry_attempts: self.retry_attempts.collect(load),
            circuit_breaker_state: self
                .circuit_breaker_state
                .collect(|v| v.load(Ordering::Relaxed)),
            jobs_enqueued: self.jobs_enqueued.collect(load),
            jobs_finished: self.jobs_finished.collect(load),
            ingest_rejections: self.ingest_rejections.collect(load),
        }
    }
}

/// A labelled value
#[derive(Debug, Clone, Serialize)]
pub struct Sample<V> {
    pub labels: BTreeMap<String, String>,
    pub value: V,
}

impl<V> Sample<V> {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }
}

/// Histogram state with cumulative buckets
#[derive(Debug, Clone, Serialize)]
pub struct HistogramValue {
    /// `(upper bound, cumulative count)`
    pub buckets: Vec<(f64, u64)>,
    pub count: u64,
    pub sum: f64,
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub webhook_calls: Vec<Sample<u64>>,
    pub webhook_duration_seconds: Vec<Sample<HistogramValue>>,
    pub retry_attempts: Vec<Sample<u64>>,
    pub circuit_breaker_state: Vec<Sample<i64>>,
    pub jobs_enqueued: Vec<Sample<u64>>,
    pub jobs_finished: Vec<Sample<u64>>,
    pub ingest_rejections: Vec<Sample<u64>>,
}

impl MetricsSnapshot {
    /// Look up a counter sample by its label values
    pub fn counter(samples: &[Sample<u64>], labels: &[(&str, &str)]) -> u64 {
        samples
            .iter()
            .find(|s| labels.iter().all(|(k, v)| s.label(k) == Some(*v)))
            .map(|s| s.value)
            .unwrap_or(0)
    }

    pub fn webhook_calls(&self, event: &str, status: CallStatus) -> u64 {
        Self::counter(
            &self.webhook_calls,
            &[("event", event), ("status", status.as_str())],
        )
    }

    pub fn retries(&self, event: &str) -> u64 {
        Self::counter(&self.retry_attempts, &[("event", event)])
    }

    pub fn circuit_state(&self, name: &str) -> Option<i64> {
        self.circuit_breaker_state
            .iter()
            .find(|s| s.label("name") == Some(name))
            .map(|s| s.value)
    }

    /// Export metrics in Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        write_counter(
            &mut output,
            "webhook_calls_total",
            "Total webhook calls to the workflow engine",
            &self.webhook_calls,
        );

        let name = format!("{}_webhook_duration_seconds", PREFIX);
        output.push_str(&format!(
            "# HELP {} Webhook call duration in seconds\n# TYPE {} histogram\n",
            name, name
        ));
        for sample in &self.webhook_duration_seconds {
            for (bound, count) in &sample.value.buckets {
                let labels = render_labels(&sample.labels, Some(("le", &bound.to_string())));
                output.push_str(&format!("{}_bucket{} {}\n", name, labels, count));
            }
            let labels = render_labels(&sample.labels, Some(("le", "+Inf")));
            output.push_str(&format!("{}_bucket{} {}\n", name, labels, sample.value.count));
            let labels = render_labels(&sample.labels, None);
            output.push_str(&format!("{}_sum{} {}\n", name, labels, sample.value.sum));
            output.push_str(&format!("{}_count{} {}\n", name, labels, sample.value.count));
        }

        write_counter(
            &mut output,
            "retry_attempts_total",
            "Total delivery retries scheduled",
            &self.retry_attempts,
        );

        let name = format!("{}_circuit_breaker_state", PREFIX);
        output.push_str(&format!(
            "# HELP {} Circuit breaker state (0=CLOSED, 1=OPEN, 2=HALF_OPEN)\n# TYPE {} gauge\n",
            name, name
        ));
        for sample in &self.circuit_breaker_state {
            output.push_str(&format!(
                "{}{} {}\n",
                name,
                render_labels(&sample.labels, None),
                sample.value
            ));
        }

        write_counter(
            &mut output,
            "jobs_enqueued_total",
            "Trigger jobs accepted into the queue",
            &self.jobs_enqueued,
        );
        write_counter(
            &mut output,
            "jobs_finished_total",
            "Trigger jobs that reached a terminal state",
            &self.jobs_finished,
        );
        write_counter(
            &mut output,
            "ingest_rejections_total",
            "Ingestion requests rejected before enqueue",
            &self.ingest_rejections,
        );

        output
    }
}

fn write_counter(output: &mut String, suffix: &str, help: &str, samples: &[Sample<u64>]) {
    let name = format!("{}_{}", PREFIX, suffix);
    output.push_str(&format!("# HELP {} {}\n# TYPE {} counter\n", name, help, name));
    for sample in samples {
        output.push_str(&format!(
            "{}{} {}\n",
            name,
            render_labels(&sample.labels, None),
            sample.value
        ));
    }
}

fn render_labels(labels: &BTreeMap<String, String>, extra: Option<(&str, &str)>) -> String {
    let rendered: Vec<String> = labels
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .chain(extra)
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
        .collect();
    if rendered.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", rendered.join(","))
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
