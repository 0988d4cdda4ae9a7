//! Fixed-window request rate limiting.
//!
//! Windows are aligned to multiples of the window length since the Unix epoch, so
//! every instance agrees on where a window starts. A burst straddling a boundary
//! can see up to twice the limit; that is accepted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::time::{interval, MissedTickBehavior};

use pagecredit_store::{Store, StoreError};

/// Answer for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Requests left in the current window.
    pub remaining: u32,
    /// Seconds until the current window ends.
    pub retry_after_secs: u64,
}

/// Window geometry shared by the implementations.
#[derive(Debug, Clone, Copy)]
pub struct RateWindow {
    /// Requests allowed per window.
    pub max_requests: u32,
    /// Window length in seconds.
    pub window_secs: u64,
}

impl RateWindow {
    /// Start of the window containing `now_secs`.
    #[must_use]
    pub fn start(&self, now_secs: i64) -> i64 {
        let len = self.len();
        now_secs - now_secs.rem_euclid(len)
    }

    fn len(&self) -> i64 {
        i64::try_from(self.window_secs.max(1)).unwrap_or(i64::MAX)
    }

    fn decide(&self, count: u32, now_secs: i64) -> RateDecision {
        let ends_at = self.start(now_secs) + self.len();
        RateDecision {
            allowed: count <= self.max_requests,
            remaining: self.max_requests.saturating_sub(count),
            retry_after_secs: u64::try_from(ends_at - now_secs).unwrap_or(0).max(1),
        }
    }
}

/// Counts requests per identity.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one request by `identity` at `now_secs` (Unix seconds).
    ///
    /// # Errors
    ///
    /// Returns a storage error when the shared counter is unavailable.
    async fn check_at(&self, identity: &str, now_secs: i64) -> Result<RateDecision, StoreError>;

    /// Count one request by `identity` now.
    ///
    /// # Errors
    ///
    /// See [`RateLimiter::check_at`].
    async fn check(&self, identity: &str) -> Result<RateDecision, StoreError> {
        self.check_at(identity, Utc::now().timestamp()).await
    }

    /// Count one request and say whether it may proceed.
    ///
    /// A failing counter denies the request.
    async fn allow(&self, identity: &str) -> bool {
        match self.check(identity).await {
            Ok(decision) => decision.allowed,
            Err(e) => {
                tracing::error!(identity, error = %e, "Rate limit counter unavailable");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LocalWindow {
    start: i64,
    count: u32,
}

/// In-process limiter.
///
/// Counters live in this process only, so several instances each allow the full
/// limit. Use [`StoreRateLimiter`] when that matters.
#[derive(Debug, Clone)]
pub struct LocalRateLimiter {
    window: RateWindow,
    entries: Arc<DashMap<String, LocalWindow>>,
}

impl LocalRateLimiter {
    /// Create a limiter allowing `max_requests` per `window_secs`.
    #[must_use]
    pub fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            window: RateWindow {
                max_requests,
                window_secs,
            },
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Drop identities whose window ended before `now_secs`.
    pub fn sweep_stale(&self, now_secs: i64) -> usize {
        let current = self.window.start(now_secs);
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.start >= current);
        before - self.entries.len()
    }

    /// Number of tracked identities.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }

    /// Sweep stale windows once per window length in the background.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(limiter.window.window_secs.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let removed = limiter.sweep_stale(Utc::now().timestamp());
                if removed > 0 {
                    tracing::debug!(removed, "Swept stale rate limit windows");
                }
            }
        })
    }
}

#[async_trait]
impl RateLimiter for LocalRateLimiter {
    async fn check_at(&self, identity: &str, now_secs: i64) -> Result<RateDecision, StoreError> {
        let start = self.window.start(now_secs);
        let count = {
            let mut entry = self
                .entries
                .entry(identity.to_string())
                .or_insert(LocalWindow { start, count: 0 });
            if entry.start != start {
                *entry = LocalWindow { start, count: 0 };
            }
            entry.count = entry.count.saturating_add(1);
            entry.count
        };
        Ok(self.window.decide(count, now_secs))
    }
}

/// Limiter backed by a shared counter in the store, consistent across instances.
#[derive(Clone)]
pub struct StoreRateLimiter {
    window: RateWindow,
    store: Arc<dyn Store>,
}

impl StoreRateLimiter {
    /// Create a limiter allowing `max_requests` per `window_secs`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, max_requests: u32, window_secs: u64) -> Self {
        Self {
            window: RateWindow {
                max_requests,
                window_secs,
            },
            store,
        }
    }
}

#[async_trait]
impl RateLimiter for StoreRateLimiter {
    async fn check_at(&self, identity: &str, now_secs: i64) -> Result<RateDecision, StoreError> {
        let count = self
            .store
            .increment_window(identity, self.window.start(now_secs))
            .await?;
        Ok(self.window.decide(count, now_secs))
    }
}
