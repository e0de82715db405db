//! Challenge store.
//!
//! A challenge is a single-use ephemeral token holding a snapshot of an
//! in-progress flow: an authorization request parked while the user logs in
//! or consents, a WebAuthn or DID challenge string, or a hashed email code.
//!
//! Consumption checks the expected challenge type and expiry, and collapses
//! every failure mode (not found, expired, already consumed, type mismatch)
//! into the single [`StateError::InvalidChallenge`] error so the error
//! channel cannot be used for enumeration.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use authrim_core::time::now_unix;

use crate::StateResult;
use crate::error::StateError;
use crate::router::stable_shard;

/// Snapshot of an authorization request parked in a challenge.
///
/// This is the normalized parameter set after source merging (query/body,
/// PAR, request object); the flow re-enters with exactly these values once
/// the UI hands control back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthRequestSnapshot {
    /// Client identifier.
    pub client_id: String,
    /// Redirect URI (already validated against the registration).
    pub redirect_uri: String,
    /// Requested response type.
    pub response_type: String,
    /// Requested scope (space-separated).
    pub scope: String,
    /// Client state, echoed on every response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// OIDC nonce.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Requested response mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_mode: Option<String>,
    /// PKCE challenge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_challenge: Option<String>,
    /// PKCE challenge method.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_challenge_method: Option<String>,
    /// The `claims` request parameter, validated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claims: Option<serde_json::Value>,
    /// Sanitized `authorization_details`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_details: Option<serde_json::Value>,
    /// Maximum authentication age in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_age: Option<i64>,
    /// Prompt tokens as requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Requested ACR values (space-separated).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acr_values: Option<String>,
    /// Login hint forwarded to the login UI.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_hint: Option<String>,
    /// DPoP key thumbprint captured at the authorization endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dpop_jkt: Option<String>,
}

/// Discriminant of a challenge, used for the consume-time type check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    /// Initial login.
    Login,
    /// Re-authentication (`prompt=login` or stale `max_age`).
    Reauth,
    /// Consent collection.
    Consent,
    /// WebAuthn credential registration.
    PasskeyRegistration,
    /// WebAuthn assertion.
    PasskeyAuthentication,
    /// Email one-time code.
    EmailCode,
    /// DID-based authentication.
    DidAuthentication,
    /// Linking a new DID.
    DidRegistration,
}

/// A stored challenge with its typed payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChallengePayload {
    /// Authorization request parked for login.
    Login {
        /// The parked request.
        request: AuthRequestSnapshot,
    },
    /// Authorization request parked for re-authentication.
    Reauth {
        /// The parked request.
        request: AuthRequestSnapshot,
        /// The currently authenticated user being re-confirmed.
        user_id: String,
    },
    /// Authorization request parked for consent.
    Consent {
        /// The parked request.
        request: AuthRequestSnapshot,
        /// The authenticated user granting consent.
        user_id: String,
    },
    /// WebAuthn registration ceremony.
    PasskeyRegistration {
        /// User the credential will belong to.
        user_id: String,
        /// Base64url challenge the authenticator must sign over.
        challenge: String,
    },
    /// WebAuthn authentication ceremony.
    PasskeyAuthentication {
        /// Known user for non-discoverable flows, if any.
        user_id: Option<String>,
        /// Base64url challenge the authenticator must sign over.
        challenge: String,
    },
    /// Email one-time code. Only the HMAC of the code is stored.
    EmailCode {
        /// Destination address.
        email: String,
        /// HMAC-SHA256 of the code under the server OTP key, hex-encoded.
        code_hash: String,
        /// The OTP session id bound to the browser cookie.
        otp_session_id: String,
        /// When the code was issued (part of the HMAC salt).
        issued_at: i64,
    },
    /// DID authentication challenge.
    DidAuthentication {
        /// The DID being authenticated.
        did: String,
        /// Nonce the proof JWS must echo.
        nonce: String,
    },
    /// DID registration (linking) challenge.
    DidRegistration {
        /// The DID being linked.
        did: String,
        /// Nonce the proof JWS must echo.
        nonce: String,
        /// User the DID will be linked to.
        user_id: String,
    },
}

impl ChallengePayload {
    /// The discriminant for consume-time type checks.
    #[must_use]
    pub fn kind(&self) -> ChallengeKind {
        match self {
            Self::Login { .. } => ChallengeKind::Login,
            Self::Reauth { .. } => ChallengeKind::Reauth,
            Self::Consent { .. } => ChallengeKind::Consent,
            Self::PasskeyRegistration { .. } => ChallengeKind::PasskeyRegistration,
            Self::PasskeyAuthentication { .. } => ChallengeKind::PasskeyAuthentication,
            Self::EmailCode { .. } => ChallengeKind::EmailCode,
            Self::DidAuthentication { .. } => ChallengeKind::DidAuthentication,
            Self::DidRegistration { .. } => ChallengeKind::DidRegistration,
        }
    }
}

/// A challenge record: id, typed payload, lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeRecord {
    /// Challenge id (UUID).
    pub id: String,
    /// Typed payload.
    pub payload: ChallengePayload,
    /// Creation time (unix seconds).
    pub created_at: i64,
    /// Expiry (unix seconds).
    pub expires_at: i64,
}

impl ChallengeRecord {
    /// Creates a record with a fresh UUID id and the given TTL.
    #[must_use]
    pub fn new(payload: ChallengePayload, ttl_secs: i64) -> Self {
        let now = now_unix();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            created_at: now,
            expires_at: now + ttl_secs,
        }
    }
}

/// The challenge actor interface.
#[async_trait]
pub trait ChallengeStore: Send + Sync {
    /// Stores a challenge.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::AlreadyExists`] on id collision.
    async fn store_challenge(&self, record: ChallengeRecord) -> StateResult<()>;

    /// Non-consuming peek, used to render client metadata on login pages.
    /// Expired challenges read as absent.
    async fn get_challenge(&self, id: &str) -> StateResult<Option<ChallengeRecord>>;

    /// Atomically consumes a challenge after checking its type and expiry.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InvalidChallenge`] for every failure mode:
    /// not found, expired, already consumed, or wrong type. The caller must
    /// surface the same generic message in all cases.
    async fn consume_challenge(
        &self,
        id: &str,
        expected: ChallengeKind,
    ) -> StateResult<ChallengeRecord>;

    /// Deletes a challenge if present. Idempotent.
    async fn delete_challenge(&self, id: &str) -> StateResult<()>;
}

/// In-memory sharded implementation. Shard selection hashes the id.
pub struct InMemoryChallengeStore {
    shards: Vec<Mutex<HashMap<String, ChallengeRecord>>>,
}

impl InMemoryChallengeStore {
    /// Creates stores for `shard_count` shards.
    #[must_use]
    pub fn new(shard_count: u32) -> Self {
        Self {
            shards: (0..shard_count.max(1)).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, id: &str) -> &Mutex<HashMap<String, ChallengeRecord>> {
        let i = stable_shard(id, self.shards.len() as u32) as usize;
        &self.shards[i]
    }
}

#[async_trait]
impl ChallengeStore for InMemoryChallengeStore {
    async fn store_challenge(&self, record: ChallengeRecord) -> StateResult<()> {
        let mut shard = self.shard(&record.id).lock().await;
        if shard.contains_key(&record.id) {
            return Err(StateError::AlreadyExists);
        }
        shard.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_challenge(&self, id: &str) -> StateResult<Option<ChallengeRecord>> {
        let shard = self.shard(id).lock().await;
        Ok(shard
            .get(id)
            .filter(|record| record.expires_at > now_unix())
            .cloned())
    }

    async fn consume_challenge(
        &self,
        id: &str,
        expected: ChallengeKind,
    ) -> StateResult<ChallengeRecord> {
        let mut shard = self.shard(id).lock().await;
        // Remove-first keeps the consume atomic; a mismatch must not leave
        // the challenge reusable, so it is not reinserted.
        let record = shard.remove(id).ok_or(StateError::InvalidChallenge)?;
        if record.expires_at <= now_unix() || record.payload.kind() != expected {
            return Err(StateError::InvalidChallenge);
        }
        Ok(record)
    }

    async fn delete_challenge(&self, id: &str) -> StateResult<()> {
        self.shard(id).lock().await.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login_challenge(ttl: i64) -> ChallengeRecord {
        ChallengeRecord::new(
            ChallengePayload::Login {
                request: AuthRequestSnapshot {
                    client_id: "cid1".to_string(),
                    redirect_uri: "https://rp.example/cb".to_string(),
                    response_type: "code".to_string(),
                    scope: "openid".to_string(),
                    state: Some("xyz".to_string()),
                    ..AuthRequestSnapshot::default()
                },
            },
            ttl,
        )
    }

    #[tokio::test]
    async fn test_store_and_consume() {
        let store = InMemoryChallengeStore::new(8);
        let record = login_challenge(300);
        let id = record.id.clone();
        store.store_challenge(record).await.unwrap();

        let consumed = store.consume_challenge(&id, ChallengeKind::Login).await.unwrap();
        assert_eq!(consumed.payload.kind(), ChallengeKind::Login);
    }

    #[tokio::test]
    async fn test_second_consume_uniform_error() {
        let store = InMemoryChallengeStore::new(8);
        let record = login_challenge(300);
        let id = record.id.clone();
        store.store_challenge(record).await.unwrap();

        store.consume_challenge(&id, ChallengeKind::Login).await.unwrap();
        assert!(matches!(
            store.consume_challenge(&id, ChallengeKind::Login).await.unwrap_err(),
            StateError::InvalidChallenge
        ));
    }

    #[tokio::test]
    async fn test_type_mismatch_uniform_error_and_burns_challenge() {
        let store = InMemoryChallengeStore::new(8);
        let record = login_challenge(300);
        let id = record.id.clone();
        store.store_challenge(record).await.unwrap();

        // Wrong expected type: same generic error…
        assert!(matches!(
            store.consume_challenge(&id, ChallengeKind::Consent).await.unwrap_err(),
            StateError::InvalidChallenge
        ));
        // …and the challenge is burned, not left open for a retry probe.
        assert!(store.consume_challenge(&id, ChallengeKind::Login).await.is_err());
    }

    #[tokio::test]
    async fn test_expired_uniform_error() {
        let store = InMemoryChallengeStore::new(8);
        let record = login_challenge(-1);
        let id = record.id.clone();
        store.store_challenge(record).await.unwrap();

        assert!(matches!(
            store.consume_challenge(&id, ChallengeKind::Login).await.unwrap_err(),
            StateError::InvalidChallenge
        ));
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let store = InMemoryChallengeStore::new(8);
        let record = login_challenge(300);
        let id = record.id.clone();
        store.store_challenge(record).await.unwrap();

        assert!(store.get_challenge(&id).await.unwrap().is_some());
        assert!(store.get_challenge(&id).await.unwrap().is_some());
        assert!(store.consume_challenge(&id, ChallengeKind::Login).await.is_ok());
    }

    #[tokio::test]
    async fn test_peek_hides_expired() {
        let store = InMemoryChallengeStore::new(8);
        let record = login_challenge(-1);
        let id = record.id.clone();
        store.store_challenge(record).await.unwrap();

        assert!(store.get_challenge(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_idempotent() {
        let store = InMemoryChallengeStore::new(8);
        assert!(store.delete_challenge("missing").await.is_ok());
    }

    #[test]
    fn test_payload_serde_tagging() {
        let record = login_challenge(300);
        let json = serde_json::to_value(&record.payload).unwrap();
        assert_eq!(json["type"], "login");
        let back: ChallengePayload = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), ChallengeKind::Login);
    }
}
