//! Consent storage trait (`oauth_client_consents`).

use async_trait::async_trait;

use crate::AuthResult;
use crate::types::ConsentRecord;

/// Storage interface for consent grants.
#[async_trait]
pub trait ConsentStore: Send + Sync {
    /// Finds the consent record for a `(user, client)` pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn find(&self, user_id: &str, client_id: &str) -> AuthResult<Option<ConsentRecord>>;

    /// Inserts or replaces the consent record for its `(user, client)` pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn upsert(&self, record: ConsentRecord) -> AuthResult<()>;

    /// Deletes the consent record for a `(user, client)` pair. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn delete(&self, user_id: &str, client_id: &str) -> AuthResult<()>;
}
