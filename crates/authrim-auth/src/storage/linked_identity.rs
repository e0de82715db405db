//! Linked external identity storage trait (`linked_identities`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::AuthResult;

/// A link between a local user and an external identity: a DID, or a
/// subject asserted by a federated IdP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedIdentity {
    /// Local user.
    pub user_id: String,
    /// Provider discriminator (`did`, or a SAML IdP entity id).
    pub provider: String,
    /// External subject (the DID string, or the asserted NameID).
    pub subject: String,
    /// When the link was created (unix seconds).
    pub created_at: i64,
}

/// Storage interface for linked identities.
#[async_trait]
pub trait LinkedIdentityStore: Send + Sync {
    /// Resolves `(provider, subject)` to a linked identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn find(&self, provider: &str, subject: &str) -> AuthResult<Option<LinkedIdentity>>;

    /// Lists a user's links for one provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn list_for_user(&self, user_id: &str, provider: &str)
    -> AuthResult<Vec<LinkedIdentity>>;

    /// Creates a link.
    ///
    /// # Errors
    ///
    /// Returns an error if the `(provider, subject)` pair is already linked
    /// or the storage operation fails.
    async fn create(&self, link: LinkedIdentity) -> AuthResult<()>;

    /// Removes a link. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn delete(&self, provider: &str, subject: &str) -> AuthResult<()>;
}
