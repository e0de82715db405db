//! Pushed-authorization-request store.
//!
//! A PAR record is a parameter snapshot keyed by an opaque request URI. It
//! is strictly single-use: the authorize entry consumes it atomically, and
//! any later consume fails with [`StateError::NotFound`].

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use authrim_core::id::ParRequestUri;
use authrim_core::time::now_unix;

use crate::StateResult;
use crate::error::StateError;

/// A stored pushed authorization request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParRecord {
    /// Client that pushed the request. Consumption is bound to it.
    pub client_id: String,
    /// The pushed parameters, verbatim. The authorize entry substitutes
    /// these for its own parameters and re-runs validation.
    pub params: BTreeMap<String, String>,
    /// DPoP key thumbprint captured at the PAR endpoint, if any.
    pub dpop_jkt: Option<String>,
    /// Creation time (unix seconds).
    pub created_at: i64,
    /// Expiry (unix seconds).
    pub expires_at: i64,
}

/// The PAR actor interface.
#[async_trait]
pub trait ParRequestStore: Send + Sync {
    /// Stores a request under its URI.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::AlreadyExists`] on URI collision.
    async fn store_request(&self, uri: &ParRequestUri, record: ParRecord) -> StateResult<()>;

    /// Atomically consumes a request.
    ///
    /// The caller's `client_id` must equal the stored one; a mismatch reads
    /// as absent so a stolen URI leaks nothing about its owner.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`] for missing, expired, consumed or
    /// differently-bound records.
    async fn consume_request(&self, uri: &ParRequestUri, client_id: &str)
    -> StateResult<ParRecord>;
}

/// In-memory sharded implementation; the shard index comes from the URI.
pub struct InMemoryParRequestStore {
    shards: Vec<Mutex<HashMap<String, ParRecord>>>,
}

impl InMemoryParRequestStore {
    /// Creates stores for `shard_count` shards.
    #[must_use]
    pub fn new(shard_count: u32) -> Self {
        Self {
            shards: (0..shard_count.max(1)).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, uri: &ParRequestUri) -> &Mutex<HashMap<String, ParRecord>> {
        let i = (uri.shard as usize) % self.shards.len();
        &self.shards[i]
    }
}

#[async_trait]
impl ParRequestStore for InMemoryParRequestStore {
    async fn store_request(&self, uri: &ParRequestUri, record: ParRecord) -> StateResult<()> {
        let mut shard = self.shard(uri).lock().await;
        let key = uri.to_string();
        if shard.contains_key(&key) {
            return Err(StateError::AlreadyExists);
        }
        shard.insert(key, record);
        Ok(())
    }

    async fn consume_request(
        &self,
        uri: &ParRequestUri,
        client_id: &str,
    ) -> StateResult<ParRecord> {
        let mut shard = self.shard(uri).lock().await;
        let key = uri.to_string();
        // Check the binding before removing so a mismatched client cannot
        // burn another client's pushed request.
        let matches = shard
            .get(&key)
            .is_some_and(|record| record.client_id == client_id);
        if !matches {
            return Err(StateError::NotFound);
        }
        let record = shard.remove(&key).ok_or(StateError::NotFound)?;
        if record.expires_at <= now_unix() {
            return Err(StateError::NotFound);
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn par_record(client_id: &str, ttl: i64) -> ParRecord {
        let mut params = BTreeMap::new();
        params.insert("client_id".to_string(), client_id.to_string());
        params.insert("redirect_uri".to_string(), "https://rp.example/cb".to_string());
        params.insert("response_type".to_string(), "code".to_string());
        params.insert("scope".to_string(), "openid".to_string());
        ParRecord {
            client_id: client_id.to_string(),
            params,
            dpop_jkt: None,
            created_at: now_unix(),
            expires_at: now_unix() + ttl,
        }
    }

    #[tokio::test]
    async fn test_roundtrip_preserves_snapshot() {
        let store = InMemoryParRequestStore::new(8);
        let uri = ParRequestUri::new(1, "us", 3);
        let record = par_record("cid1", 600);
        store.store_request(&uri, record.clone()).await.unwrap();

        let consumed = store.consume_request(&uri, "cid1").await.unwrap();
        assert_eq!(consumed, record);
    }

    #[tokio::test]
    async fn test_single_use() {
        let store = InMemoryParRequestStore::new(8);
        let uri = ParRequestUri::new(1, "us", 3);
        store.store_request(&uri, par_record("cid1", 600)).await.unwrap();

        store.consume_request(&uri, "cid1").await.unwrap();
        assert!(matches!(
            store.consume_request(&uri, "cid1").await.unwrap_err(),
            StateError::NotFound
        ));
    }

    #[tokio::test]
    async fn test_client_binding_enforced_without_burning() {
        let store = InMemoryParRequestStore::new(8);
        let uri = ParRequestUri::new(1, "us", 0);
        store.store_request(&uri, par_record("cid1", 600)).await.unwrap();

        // Wrong client: absent, and the record survives for its owner.
        assert!(store.consume_request(&uri, "cid2").await.is_err());
        assert!(store.consume_request(&uri, "cid1").await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_not_found() {
        let store = InMemoryParRequestStore::new(8);
        let uri = ParRequestUri::new(1, "us", 0);
        store.store_request(&uri, par_record("cid1", -1)).await.unwrap();

        assert!(matches!(
            store.consume_request(&uri, "cid1").await.unwrap_err(),
            StateError::NotFound
        ));
    }

    #[tokio::test]
    async fn test_collision_rejected() {
        let store = InMemoryParRequestStore::new(8);
        let uri = ParRequestUri::new(1, "us", 0);
        store.store_request(&uri, par_record("cid1", 600)).await.unwrap();
        assert!(matches!(
            store.store_request(&uri, par_record("cid1", 600)).await.unwrap_err(),
            StateError::AlreadyExists
        ));
    }
}
