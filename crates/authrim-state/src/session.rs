//! Browser-session store.
//!
//! Sessions are created at credential verification and destroyed at logout
//! or TTL. The shard index is embedded in the session id; the router only
//! chooses a shard when a new session is allocated.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use authrim_core::id::SessionId;
use authrim_core::time::now_unix;

use crate::StateResult;
use crate::error::StateError;

/// A live browser session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Authenticated user.
    pub user_id: String,
    /// Expiry (unix seconds).
    pub expires_at: i64,
    /// When the user authenticated (unix seconds).
    pub auth_time: i64,
    /// Authentication methods used (`pwd`, `otp`, `passkey`, `saml`, `did`).
    pub amr: Vec<String>,
    /// Authentication context class reference.
    pub acr: Option<String>,
    /// Whether this is an anonymous session.
    pub anonymous: bool,
    /// Free-form session data (email, upgrade nonce for anonymous-to-full
    /// transitions). Patched with merge semantics.
    pub data: serde_json::Value,
}

impl SessionRecord {
    /// Returns `true` if the session is still live.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.expires_at > now_unix()
    }
}

/// The session actor interface.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Creates a session.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::AlreadyExists`] on id collision.
    async fn create_session(&self, id: &SessionId, record: SessionRecord) -> StateResult<()>;

    /// Fetches a session. Expired sessions read as absent.
    async fn get_session(&self, id: &SessionId) -> StateResult<Option<SessionRecord>>;

    /// Merges `patch` into the session's data blob. Top-level keys in the
    /// patch replace existing keys; a `null` value removes the key.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`] for absent or expired sessions.
    async fn update_session_data(
        &self,
        id: &SessionId,
        patch: serde_json::Value,
    ) -> StateResult<()>;

    /// Deletes a session if present. Idempotent.
    async fn delete_session(&self, id: &SessionId) -> StateResult<()>;
}

/// In-memory sharded implementation.
pub struct InMemorySessionStore {
    shards: Vec<Mutex<HashMap<String, SessionRecord>>>,
}

impl InMemorySessionStore {
    /// Creates stores for `shard_count` shards.
    #[must_use]
    pub fn new(shard_count: u32) -> Self {
        Self {
            shards: (0..shard_count.max(1)).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, id: &SessionId) -> &Mutex<HashMap<String, SessionRecord>> {
        let i = (id.shard as usize) % self.shards.len();
        &self.shards[i]
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(&self, id: &SessionId, record: SessionRecord) -> StateResult<()> {
        let mut shard = self.shard(id).lock().await;
        let key = id.to_string();
        if shard.contains_key(&key) {
            return Err(StateError::AlreadyExists);
        }
        shard.insert(key, record);
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> StateResult<Option<SessionRecord>> {
        let shard = self.shard(id).lock().await;
        Ok(shard
            .get(&id.to_string())
            .filter(|record| record.is_active())
            .cloned())
    }

    async fn update_session_data(
        &self,
        id: &SessionId,
        patch: serde_json::Value,
    ) -> StateResult<()> {
        let mut shard = self.shard(id).lock().await;
        let record = shard.get_mut(&id.to_string()).ok_or(StateError::NotFound)?;
        if !record.is_active() {
            return Err(StateError::NotFound);
        }

        if !record.data.is_object() {
            record.data = serde_json::Value::Object(serde_json::Map::new());
        }
        let data = record
            .data
            .as_object_mut()
            .ok_or_else(|| StateError::storage("session data is not an object"))?;
        if let serde_json::Value::Object(patch) = patch {
            for (key, value) in patch {
                if value.is_null() {
                    data.remove(&key);
                } else {
                    data.insert(key, value);
                }
            }
        }
        Ok(())
    }

    async fn delete_session(&self, id: &SessionId) -> StateResult<()> {
        self.shard(id).lock().await.remove(&id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session(ttl: i64) -> SessionRecord {
        SessionRecord {
            user_id: "user-1".to_string(),
            expires_at: now_unix() + ttl,
            auth_time: now_unix(),
            amr: vec!["pwd".to_string()],
            acr: None,
            anonymous: false,
            data: json!({"email": "u@example.com"}),
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = InMemorySessionStore::new(8);
        let id = SessionId::new(2);
        store.create_session(&id, session(3600)).await.unwrap();

        let fetched = store.get_session(&id).await.unwrap().unwrap();
        assert_eq!(fetched.user_id, "user-1");
        assert!(fetched.is_active());
    }

    #[tokio::test]
    async fn test_expired_reads_as_absent() {
        let store = InMemorySessionStore::new(8);
        let id = SessionId::new(0);
        store.create_session(&id, session(-1)).await.unwrap();
        assert!(store.get_session(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_merges_and_removes() {
        let store = InMemorySessionStore::new(8);
        let id = SessionId::new(0);
        store.create_session(&id, session(3600)).await.unwrap();

        store
            .update_session_data(&id, json!({"upgrade_nonce": "n1", "email": null}))
            .await
            .unwrap();

        let fetched = store.get_session(&id).await.unwrap().unwrap();
        assert_eq!(fetched.data["upgrade_nonce"], "n1");
        assert!(fetched.data.get("email").is_none());
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let store = InMemorySessionStore::new(8);
        let id = SessionId::new(0);
        assert!(matches!(
            store.update_session_data(&id, json!({})).await.unwrap_err(),
            StateError::NotFound
        ));
    }

    #[tokio::test]
    async fn test_delete_idempotent() {
        let store = InMemorySessionStore::new(8);
        let id = SessionId::new(0);
        store.create_session(&id, session(3600)).await.unwrap();
        store.delete_session(&id).await.unwrap();
        store.delete_session(&id).await.unwrap();
        assert!(store.get_session(&id).await.unwrap().is_none());
    }
}
