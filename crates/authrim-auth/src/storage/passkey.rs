//! Passkey (WebAuthn credential) storage trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::AuthResult;

/// A stored WebAuthn credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PasskeyCredential {
    /// Credential id (base64url).
    pub credential_id: String,
    /// Owning user.
    pub user_id: String,
    /// COSE algorithm identifier (-7 = ES256, -257 = RS256).
    pub cose_alg: i32,
    /// Public key converted to JWK form at registration.
    pub public_key: authrim_crypto::Jwk,
    /// Signature counter from the last assertion.
    pub sign_count: u32,
    /// Registration time (unix seconds).
    pub created_at: i64,
}

/// Storage interface for passkeys.
#[async_trait]
pub trait PasskeyStore: Send + Sync {
    /// Finds a credential by its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn find(&self, credential_id: &str) -> AuthResult<Option<PasskeyCredential>>;

    /// Lists a user's credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn list_for_user(&self, user_id: &str) -> AuthResult<Vec<PasskeyCredential>>;

    /// Inserts or replaces a credential keyed by its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn upsert(&self, credential: PasskeyCredential) -> AuthResult<()>;

    /// Updates the signature counter after a verified assertion.
    ///
    /// # Errors
    ///
    /// Returns an error if the credential is missing or the update fails.
    async fn update_sign_count(&self, credential_id: &str, sign_count: u32) -> AuthResult<()>;
}
