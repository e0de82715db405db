//! SAML replay-prevention storage trait.
//!
//! Two uses: one-time-use assertion ids (the `OneTimeUse` condition), and
//! outstanding AuthnRequest ids for strict `InResponseTo` checking.

use async_trait::async_trait;

use crate::AuthResult;

/// Storage interface for SAML nonces.
#[async_trait]
pub trait SamlReplayStore: Send + Sync {
    /// Atomically records an assertion id if unseen within its validity
    /// window. Returns `true` on first use, `false` on replay.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn mark_assertion_used(&self, assertion_id: &str, ttl_secs: i64) -> AuthResult<bool>;

    /// Records an outbound AuthnRequest id so the matching assertion's
    /// `InResponseTo` can be validated.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn store_request_id(&self, request_id: &str, ttl_secs: i64) -> AuthResult<()>;

    /// Atomically consumes an outstanding AuthnRequest id. Returns `true`
    /// if it was outstanding and unexpired.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn consume_request_id(&self, request_id: &str) -> AuthResult<bool>;
}
