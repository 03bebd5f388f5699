//! Fixed-window rate limiting keyed by client identity
//!
//! A window opens on a client's first request and lasts `window`; at most
//! `max_requests` are admitted inside it. Bursts of up to `2 * max_requests` are
//! therefore possible across a window boundary. Window state lives in a moka
//! cache whose TTL equals the window, so idle clients cost nothing.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tokio::time::Instant;

/// Rate limiter configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 100,
        }
    }
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: AtomicU32,
}

impl Window {
    fn new(started: Instant) -> Self {
        Self {
            started,
            count: AtomicU32::new(0),
        }
    }
}

/// Per-client fixed-window limiter
pub struct FixedWindowLimiter {
    config: RateLimitConfig,
    windows: Cache<String, Arc<Window>>,
}

impl std::fmt::Debug for FixedWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedWindowLimiter")
            .field("config", &self.config)
            .field("clients", &self.windows.entry_count())
            .finish()
    }
}

impl Default for FixedWindowLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl FixedWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let windows = Cache::builder()
            .max_capacity(100_000)
            .time_to_live(config.window)
            .build();
        Self { config, windows }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count a request from `client`.
    ///
    /// Returns the time until the client's window resets when the request is over
    /// the limit.
    pub async fn check(&self, client: &str) -> Result<(), Duration> {
        let now = Instant::now();
        let window_len = self.config.window;

        // Upserts are serialised per key, so only one caller can roll the window
        let window = self
            .windows
            .entry(client.to_string())
            .and_upsert_with(|current| {
                let window = match current {
                    Some(entry) if now.duration_since(entry.value().started) < window_len => {
                        entry.into_value()
                    }
                    _ => Arc::new(Window::new(now)),
                };
                std::future::ready(window)
            })
            .await
            .into_value();

        let count = window.count.fetch_add(1, Ordering::SeqCst) + 1;
        if count > self.config.max_requests {
            let resets_at = window.started + self.config.window;
            return Err(resets_at.saturating_duration_since(now));
        }
        Ok(())
    }
}
