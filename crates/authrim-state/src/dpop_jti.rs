//! DPoP proof replay prevention.
//!
//! Each accepted proof's `jti` is recorded against the proof key's
//! thumbprint for the maximum proof age. A second proof reusing the same
//! `(jkt, jti)` inside that window is a replay.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use authrim_core::time::now_unix;

use crate::StateResult;

/// The DPoP jti actor interface.
#[async_trait]
pub trait DpopJtiStore: Send + Sync {
    /// Atomically records `(jkt, jti)` if unseen.
    ///
    /// Returns `true` on first use, `false` on replay. Expired markers do
    /// not count as seen.
    async fn mark_used(&self, jkt: &str, jti: &str, ttl_secs: i64) -> StateResult<bool>;
}

/// In-memory implementation with opportunistic cleanup.
#[derive(Default)]
pub struct InMemoryDpopJtiStore {
    seen: Mutex<HashMap<(String, String), i64>>,
}

impl InMemoryDpopJtiStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DpopJtiStore for InMemoryDpopJtiStore {
    async fn mark_used(&self, jkt: &str, jti: &str, ttl_secs: i64) -> StateResult<bool> {
        let now = now_unix();
        let mut seen = self.seen.lock().await;
        // Drop expired markers while the lock is held; the map stays small
        // because TTLs are on the order of a minute.
        seen.retain(|_, expires_at| *expires_at > now);

        let key = (jkt.to_string(), jti.to_string());
        if seen.contains_key(&key) {
            return Ok(false);
        }
        seen.insert(key, now + ttl_secs);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_use_then_replay() {
        let store = InMemoryDpopJtiStore::new();
        assert!(store.mark_used("jkt-1", "jti-1", 60).await.unwrap());
        assert!(!store.mark_used("jkt-1", "jti-1", 60).await.unwrap());
    }

    #[tokio::test]
    async fn test_same_jti_different_key_allowed() {
        let store = InMemoryDpopJtiStore::new();
        assert!(store.mark_used("jkt-1", "jti-1", 60).await.unwrap());
        assert!(store.mark_used("jkt-2", "jti-1", 60).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_marker_reusable() {
        let store = InMemoryDpopJtiStore::new();
        assert!(store.mark_used("jkt-1", "jti-1", -1).await.unwrap());
        assert!(store.mark_used("jkt-1", "jti-1", 60).await.unwrap());
    }
}
