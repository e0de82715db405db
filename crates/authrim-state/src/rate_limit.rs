//! Fixed-window rate limiter.
//!
//! Buckets are named (`authorize`, `par`, `email-code`, …) and each key
//! within a bucket tracks `(count, window_start)`. Rejections surface the
//! seconds remaining in the current window as `retry_after`.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use authrim_config::RateLimitBucket;
use authrim_core::time::now_unix;

use crate::StateResult;

/// Outcome of a rate-limit increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether this request is allowed.
    pub allowed: bool,
    /// Requests remaining in the current window.
    pub remaining: u32,
    /// Seconds until the window resets. Zero when allowed.
    pub retry_after: u64,
}

/// The rate-limiter actor interface.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Counts one request against `(bucket, key)` and decides.
    async fn increment(
        &self,
        bucket: &str,
        key: &str,
        params: RateLimitBucket,
    ) -> StateResult<RateLimitDecision>;
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    window_start: i64,
}

/// In-memory fixed-window implementation.
#[derive(Default)]
pub struct InMemoryRateLimiter {
    windows: Mutex<HashMap<(String, String), Window>>,
}

impl InMemoryRateLimiter {
    /// Creates an empty limiter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn increment(
        &self,
        bucket: &str,
        key: &str,
        params: RateLimitBucket,
    ) -> StateResult<RateLimitDecision> {
        let now = now_unix();
        let window_seconds = params.window_seconds.max(1) as i64;
        let mut windows = self.windows.lock().await;
        let entry = windows
            .entry((bucket.to_string(), key.to_string()))
            .or_insert(Window {
                count: 0,
                window_start: now,
            });

        if now - entry.window_start >= window_seconds {
            entry.count = 0;
            entry.window_start = now;
        }

        if entry.count >= params.max_requests {
            let retry_after = (entry.window_start + window_seconds - now).max(1) as u64;
            return Ok(RateLimitDecision {
                allowed: false,
                remaining: 0,
                retry_after,
            });
        }

        entry.count += 1;
        Ok(RateLimitDecision {
            allowed: true,
            remaining: params.max_requests - entry.count,
            retry_after: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUCKET: RateLimitBucket = RateLimitBucket {
        window_seconds: 900,
        max_requests: 3,
    };

    #[tokio::test]
    async fn test_allows_up_to_limit() {
        let limiter = InMemoryRateLimiter::new();
        for i in 0..3 {
            let decision = limiter.increment("email-code", "u@x", BUCKET).await.unwrap();
            assert!(decision.allowed, "request {i} should be allowed");
            assert_eq!(decision.remaining, 2 - i);
        }
    }

    #[tokio::test]
    async fn test_rejects_over_limit_with_retry_after() {
        let limiter = InMemoryRateLimiter::new();
        for _ in 0..3 {
            limiter.increment("email-code", "u@x", BUCKET).await.unwrap();
        }
        let decision = limiter.increment("email-code", "u@x", BUCKET).await.unwrap();
        assert!(!decision.allowed);
        assert!(decision.retry_after > 0);
        assert!(decision.retry_after <= 900);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = InMemoryRateLimiter::new();
        for _ in 0..3 {
            limiter.increment("email-code", "a@x", BUCKET).await.unwrap();
        }
        let decision = limiter.increment("email-code", "b@x", BUCKET).await.unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn test_buckets_are_independent() {
        let limiter = InMemoryRateLimiter::new();
        for _ in 0..3 {
            limiter.increment("email-code", "u@x", BUCKET).await.unwrap();
        }
        let decision = limiter.increment("authorize", "u@x", BUCKET).await.unwrap();
        assert!(decision.allowed);
    }
}
