//! Alerting channel
//!
//! `Alerter::send_alert` is best-effort: `info` alerts are only logged and the
//! rest go to the configured sink on a detached task. Delivery failures are
//! logged and swallowed.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Alert severity, ordered from least to most severe
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }

    /// Whether alerts of this severity leave the process
    pub fn is_forwarded(&self) -> bool {
        *self >= Self::Warning
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub metadata: BTreeMap<String, String>,
}

impl Alert {
    pub fn new(severity: Severity, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            severity,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("Alert sink responded with HTTP {0}")]
    Status(u16),
    #[error("Alert transport error: {0}")]
    Transport(String),
}

/// External notification target
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// Chat-ops incoming webhook (`{text, attachments}` body)
#[derive(Debug, Clone)]
pub struct SlackSink {
    url: String,
    client: reqwest::Client,
}

impl SlackSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, AlertError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AlertError::Transport(e.to_string()))?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }

    /// Message body for an alert
    pub fn body(alert: &Alert) -> serde_json::Value {
        let color = if alert.severity == Severity::Critical {
            "#ff0000"
        } else {
            "#ffa500"
        };
        let fields: Vec<serde_json::Value> = alert
            .metadata
            .iter()
            .map(|(k, v)| serde_json::json!({ "title": k, "value": v, "short": true }))
            .collect();

        serde_json::json!({
            "text": format!(
                "*{}: {}*\n{}",
                alert.severity.as_str().to_uppercase(),
                alert.title,
                alert.message
            ),
            "attachments": [{ "color": color, "fields": fields }],
        })
    }
}

#[async_trait]
impl AlertSink for SlackSink {
    fn name(&self) -> &str {
        "slack"
    }

    async fn deliver(&self, alert: &Alert) -> Result<(), AlertError> {
        let response = self
            .client
            .post(&self.url)
            .json(&Self::body(alert))
            .send()
            .await
            .map_err(|e| AlertError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AlertError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Fan-out point for operational alerts
#[derive(Clone, Default)]
pub struct Alerter {
    sink: Option<Arc<dyn AlertSink>>,
}

impl fmt::Debug for Alerter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Alerter")
            .field("sink", &self.sink.as_ref().map(|s| s.name().to_string()))
            .finish()
    }
}

impl Alerter {
    pub fn new(sink: Arc<dyn AlertSink>) -> Self {
        Self { sink: Some(sink) }
    }

    /// Alerts are logged but never delivered
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Hand the alert to the sink on a background task.
    ///
    /// Returns the delivery task, or `None` when nothing is sent. The caller
    /// never waits on the sink, so a slow or failing sink cannot stall it.
    pub fn send_alert(&self, alert: Alert) -> Option<JoinHandle<()>> {
        info!(
            title = %alert.title,
            severity = %alert.severity,
            "Processing alert"
        );

        if !alert.severity.is_forwarded() {
            return None;
        }

        let Some(sink) = self.sink.clone() else {
            debug!(title = %alert.title, "Alert delivery disabled, no sink configured");
            return None;
        };

        Some(tokio::spawn(async move {
            if let Err(e) = sink.deliver(&alert).await {
                error!(sink = sink.name(), title = %alert.title, error = %e, "Failed to deliver alert");
            }
        }))
    }
}
