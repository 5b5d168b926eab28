// Rate limiting for outbound REST calls.
//
// One bucket per resource key, each behind its own async mutex. A global pause
// (signalled by the remote side) holds every bucket until it elapses. Waiting only
// ever suspends the calling task.

mod headers;

pub use headers::RateLimitHeaders;

use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

/// Outcome of asking a bucket for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    WaitUntil(Instant),
}

/// Request budget for a single resource.
///
/// `remaining` is unsigned and only decremented after checking it is positive, so it
/// can never go negative. Whenever `remaining` is zero, `reset_at` is set.
#[derive(Debug, Clone)]
pub struct RateLimitBucket {
    pub key: String,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: Option<Instant>,
    /// Authoritative override from a 429 response.
    pub retry_after: Option<Instant>,
    window: Duration,
}

impl RateLimitBucket {
    pub fn new(key: impl Into<String>, limit: u32, window: Duration) -> Self {
        let limit = limit.max(1);
        Self {
            key: key.into(),
            limit,
            remaining: limit,
            reset_at: None,
            retry_after: None,
            window,
        }
    }

    /// Try to consume one call at `now`.
    pub fn try_admit(&mut self, now: Instant) -> Admission {
        if let Some(until) = self.retry_after {
            if now < until {
                return Admission::WaitUntil(until);
            }
            self.retry_after = None;
            self.remaining = self.limit;
            self.reset_at = None;
        }

        if let Some(reset) = self.reset_at {
            if now >= reset {
                self.remaining = self.limit;
                self.reset_at = None;
            }
        }

        if self.remaining > 0 {
            // First call of a window opens it
            if self.reset_at.is_none() {
                self.reset_at = Some(now + self.window);
            }
            self.remaining -= 1;
            Admission::Admitted
        } else {
            Admission::WaitUntil(self.reset_at.unwrap_or(now + self.window))
        }
    }

    /// Apply authoritative budget information from response headers.
    pub fn update(&mut self, info: &RateLimitHeaders, now: Instant) {
        if let Some(limit) = info.limit {
            self.limit = limit.max(1);
        }
        if let Some(remaining) = info.remaining {
            self.remaining = remaining.min(self.limit);
        }
        if let Some(reset_after) = info.reset_after {
            self.reset_at = Some(now + reset_after);
        }
        if self.remaining == 0 && self.reset_at.is_none() {
            self.reset_at = Some(now + self.window);
        }
    }

    /// Block the bucket until `now + retry_after`.
    pub fn penalize(&mut self, retry_after: Duration, now: Instant) {
        let until = now + retry_after;
        self.remaining = 0;
        self.retry_after = Some(until);
        self.reset_at = Some(until);
    }
}

/// Per-resource rate limiter.
///
/// Buckets are created lazily on first use with the default budget and are replaced
/// by authoritative values as responses arrive. State is in-memory only.
pub struct RateLimiter {
    buckets: DashMap<String, Arc<tokio::sync::Mutex<RateLimitBucket>>>,
    global_until: Mutex<Option<Instant>>,
    default_budget: u32,
    default_window: Duration,
}

impl RateLimiter {
    pub fn new(default_budget: u32, default_window: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            global_until: Mutex::new(None),
            default_budget,
            default_window,
        }
    }

    fn bucket(&self, key: &str) -> Arc<tokio::sync::Mutex<RateLimitBucket>> {
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(tokio::sync::Mutex::new(RateLimitBucket::new(
                    key,
                    self.default_budget,
                    self.default_window,
                )))
            })
            .clone()
    }

    /// Suspend until one call on `key` is admitted, then consume it.
    pub async fn acquire(&self, key: &str) {
        loop {
            self.wait_global().await;

            let bucket = self.bucket(key);
            let admission = {
                let mut guard = bucket.lock().await;
                guard.try_admit(Instant::now())
            };

            match admission {
                Admission::Admitted => return,
                Admission::WaitUntil(until) => {
                    debug!(
                        resource = %key,
                        wait_ms = until.saturating_duration_since(Instant::now()).as_millis() as u64,
                        "Bucket exhausted, waiting for reset"
                    );
                    sleep_until(until).await;
                }
            }
        }
    }

    async fn wait_global(&self) {
        loop {
            let until = *self.global_until.lock().unwrap();
            match until {
                Some(t) if t > Instant::now() => sleep_until(t).await,
                _ => return,
            }
        }
    }

    /// Apply response headers to the bucket for `key`.
    pub async fn update(&self, key: &str, info: &RateLimitHeaders) {
        let bucket = self.bucket(key);
        let mut guard = bucket.lock().await;
        guard.update(info, Instant::now());
    }

    /// Apply a 429 retry-after to one bucket.
    pub async fn penalize(&self, key: &str, retry_after: Duration) {
        let bucket = self.bucket(key);
        let mut guard = bucket.lock().await;
        guard.penalize(retry_after, Instant::now());
    }

    /// Pause every bucket until `retry_after` has elapsed.
    pub fn pause_all(&self, retry_after: Duration) {
        let until = Instant::now() + retry_after;
        let mut global = self.global_until.lock().unwrap();
        if global.map_or(true, |current| until > current) {
            warn!(retry_after_ms = retry_after.as_millis() as u64, "Global rate limit hit, pausing all buckets");
            *global = Some(until);
        }
    }

    /// Remaining budget for `key`, if the bucket exists.
    pub async fn remaining(&self, key: &str) -> Option<u32> {
        let bucket = self.buckets.get(key).map(|b| b.clone())?;
        let guard = bucket.lock().await;
        Some(guard.remaining)
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests;
