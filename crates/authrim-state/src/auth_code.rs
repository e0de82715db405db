//! Authorization-code shards.
//!
//! Codes are single-use: `consume_code` is an atomic read-and-delete, and a
//! second consume of the same code observes [`StateError::NotFound`]. Each
//! (user, client) pair holds at most `max_codes_per_user` live codes;
//! storing beyond the cap evicts the oldest.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use authrim_core::id::AuthCode;
use authrim_core::time::now_unix;

use crate::error::StateError;
use crate::StateResult;

/// Everything bound to an authorization code at issuance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthCodeRecord {
    /// Client the code was issued to.
    pub client_id: String,
    /// Redirect URI the code was delivered to; must match at redemption.
    pub redirect_uri: String,
    /// Authenticated user.
    pub user_id: String,
    /// Granted scope (space-separated).
    pub scope: String,
    /// PKCE challenge (S256).
    pub code_challenge: Option<String>,
    /// PKCE challenge method.
    pub code_challenge_method: Option<String>,
    /// OIDC nonce, echoed into the ID token.
    pub nonce: Option<String>,
    /// Request state (not redeemed, kept for diagnostics).
    pub state: Option<String>,
    /// The `claims` request parameter, sanitized.
    pub claims: Option<serde_json::Value>,
    /// Granted `authorization_details`, sanitized.
    pub authorization_details: Option<serde_json::Value>,
    /// When the user authenticated (unix seconds).
    pub auth_time: i64,
    /// Authentication context class reference.
    pub acr: Option<String>,
    /// DPoP key thumbprint the code is bound to.
    pub dpop_jkt: Option<String>,
    /// Session id for logout linkage (`sid` claim).
    pub sid: Option<String>,
    /// Issuance time (unix seconds).
    pub issued_at: i64,
    /// Expiry (unix seconds).
    pub expires_at: i64,
}

/// Per-shard status snapshot for liveness and warm-up checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardStatus {
    /// Shard index.
    pub shard: u32,
    /// Number of live codes.
    pub live_codes: usize,
    /// Configured per-(user, client) cap.
    pub max_codes_per_user: u32,
}

/// The authorization-code actor interface.
#[async_trait]
pub trait AuthCodeStore: Send + Sync {
    /// Stores a new code.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::AlreadyExists`] if the code is already present.
    async fn store_code(&self, code: &AuthCode, record: AuthCodeRecord) -> StateResult<()>;

    /// Atomically consumes a code, returning its record.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`] if the code does not exist, has
    /// expired, or was already consumed.
    async fn consume_code(&self, code: &AuthCode) -> StateResult<AuthCodeRecord>;

    /// Status snapshot of one shard.
    async fn get_status(&self, shard: u32) -> StateResult<ShardStatus>;

    /// Applies a new per-user cap, returning `(previous, current)`.
    async fn reload_config(&self, max_codes_per_user: u32) -> StateResult<(u32, u32)>;
}

/// In-memory sharded implementation.
///
/// One mutex per shard keeps writes serialized per shard while shards stay
/// independent, matching the single-writer actor contract.
pub struct InMemoryAuthCodeShards {
    shards: Vec<Mutex<HashMap<String, AuthCodeRecord>>>,
    max_codes_per_user: Mutex<u32>,
}

impl InMemoryAuthCodeShards {
    /// Creates stores for `shard_count` shards.
    #[must_use]
    pub fn new(shard_count: u32, max_codes_per_user: u32) -> Self {
        Self {
            shards: (0..shard_count.max(1)).map(|_| Mutex::new(HashMap::new())).collect(),
            max_codes_per_user: Mutex::new(max_codes_per_user.max(1)),
        }
    }

    fn shard(&self, index: u32) -> &Mutex<HashMap<String, AuthCodeRecord>> {
        // Ids minted under a larger shard count still resolve: fold the
        // embedded index onto the allocated shards.
        let i = (index as usize) % self.shards.len();
        &self.shards[i]
    }
}

#[async_trait]
impl AuthCodeStore for InMemoryAuthCodeShards {
    async fn store_code(&self, code: &AuthCode, record: AuthCodeRecord) -> StateResult<()> {
        let cap = *self.max_codes_per_user.lock().await;
        let mut shard = self.shard(code.shard).lock().await;

        let key = code.to_string();
        if shard.contains_key(&key) {
            return Err(StateError::AlreadyExists);
        }

        // Evict oldest codes for this (user, client) beyond the cap. The
        // incoming code counts toward it.
        let mut existing: Vec<(String, i64)> = shard
            .iter()
            .filter(|(_, r)| r.user_id == record.user_id && r.client_id == record.client_id)
            .map(|(k, r)| (k.clone(), r.issued_at))
            .collect();
        if existing.len() + 1 > cap as usize {
            existing.sort_by_key(|(_, issued_at)| *issued_at);
            let excess = existing.len() + 1 - cap as usize;
            for (k, _) in existing.into_iter().take(excess) {
                shard.remove(&k);
                tracing::debug!(shard = code.shard, "evicted oldest authorization code");
            }
        }

        shard.insert(key, record);
        Ok(())
    }

    async fn consume_code(&self, code: &AuthCode) -> StateResult<AuthCodeRecord> {
        let mut shard = self.shard(code.shard).lock().await;
        let record = shard.remove(&code.to_string()).ok_or(StateError::NotFound)?;
        if record.expires_at <= now_unix() {
            // Expired entries behave exactly like absent ones.
            return Err(StateError::NotFound);
        }
        Ok(record)
    }

    async fn get_status(&self, shard: u32) -> StateResult<ShardStatus> {
        let live_codes = self.shard(shard).lock().await.len();
        Ok(ShardStatus {
            shard,
            live_codes,
            max_codes_per_user: *self.max_codes_per_user.lock().await,
        })
    }

    async fn reload_config(&self, max_codes_per_user: u32) -> StateResult<(u32, u32)> {
        let mut cap = self.max_codes_per_user.lock().await;
        let previous = *cap;
        *cap = max_codes_per_user.max(1);
        Ok((previous, *cap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(user: &str, client: &str, issued_at: i64) -> AuthCodeRecord {
        AuthCodeRecord {
            client_id: client.to_string(),
            redirect_uri: "https://rp.example/cb".to_string(),
            user_id: user.to_string(),
            scope: "openid".to_string(),
            code_challenge: None,
            code_challenge_method: None,
            nonce: None,
            state: None,
            claims: None,
            authorization_details: None,
            auth_time: issued_at,
            acr: None,
            dpop_jkt: None,
            sid: None,
            issued_at,
            expires_at: now_unix() + 600,
        }
    }

    #[tokio::test]
    async fn test_store_and_consume() {
        let store = InMemoryAuthCodeShards::new(8, 1);
        let code = AuthCode::generate(3);
        store.store_code(&code, record("u", "c", now_unix())).await.unwrap();

        let consumed = store.consume_code(&code).await.unwrap();
        assert_eq!(consumed.user_id, "u");
    }

    #[tokio::test]
    async fn test_second_consume_is_not_found() {
        let store = InMemoryAuthCodeShards::new(8, 1);
        let code = AuthCode::generate(3);
        store.store_code(&code, record("u", "c", now_unix())).await.unwrap();

        store.consume_code(&code).await.unwrap();
        assert!(matches!(
            store.consume_code(&code).await.unwrap_err(),
            StateError::NotFound
        ));
    }

    #[tokio::test]
    async fn test_duplicate_store_rejected() {
        let store = InMemoryAuthCodeShards::new(8, 2);
        let code = AuthCode::generate(0);
        store.store_code(&code, record("u", "c", now_unix())).await.unwrap();
        assert!(matches!(
            store.store_code(&code, record("u", "c", now_unix())).await.unwrap_err(),
            StateError::AlreadyExists
        ));
    }

    #[tokio::test]
    async fn test_expired_code_not_found() {
        let store = InMemoryAuthCodeShards::new(8, 1);
        let code = AuthCode::generate(0);
        let mut rec = record("u", "c", now_unix() - 700);
        rec.expires_at = now_unix() - 100;
        store.store_code(&code, rec).await.unwrap();

        assert!(matches!(
            store.consume_code(&code).await.unwrap_err(),
            StateError::NotFound
        ));
    }

    #[tokio::test]
    async fn test_per_user_client_eviction() {
        let store = InMemoryAuthCodeShards::new(1, 1);
        let old = AuthCode::generate(0);
        let new = AuthCode::generate(0);
        store.store_code(&old, record("u", "c", 100)).await.unwrap();
        store.store_code(&new, record("u", "c", 200)).await.unwrap();

        // The old code was evicted by the cap of one per (user, client).
        assert!(store.consume_code(&old).await.is_err());
        assert!(store.consume_code(&new).await.is_ok());
    }

    #[tokio::test]
    async fn test_eviction_scoped_to_user_client_pair() {
        let store = InMemoryAuthCodeShards::new(1, 1);
        let a = AuthCode::generate(0);
        let b = AuthCode::generate(0);
        store.store_code(&a, record("u1", "c", 100)).await.unwrap();
        store.store_code(&b, record("u2", "c", 200)).await.unwrap();

        // Different users: both survive.
        assert!(store.consume_code(&a).await.is_ok());
        assert!(store.consume_code(&b).await.is_ok());
    }

    #[tokio::test]
    async fn test_reload_config() {
        let store = InMemoryAuthCodeShards::new(1, 1);
        assert_eq!(store.reload_config(5).await.unwrap(), (1, 5));
        assert_eq!(store.get_status(0).await.unwrap().max_codes_per_user, 5);
    }

    #[tokio::test]
    async fn test_code_from_larger_shard_count_still_resolves() {
        // Shard count shrank from 16 to 4 mid-flight; a code on shard 13
        // must still be consumable.
        let store = InMemoryAuthCodeShards::new(4, 1);
        let code = AuthCode::generate(13);
        store.store_code(&code, record("u", "c", now_unix())).await.unwrap();
        assert!(store.consume_code(&code).await.is_ok());
    }
}
