//! Session-client association storage trait (`session_clients`).

use async_trait::async_trait;

use crate::AuthResult;

/// Storage interface for `(session, client)` associations.
///
/// Recorded whenever tokens are issued to a client inside a session, and
/// enumerated at logout to discover the RPs that must be notified.
#[async_trait]
pub trait SessionClientStore: Send + Sync {
    /// Records the association. Idempotent per pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn record(&self, session_id: &str, client_id: &str) -> AuthResult<()>;

    /// Lists the distinct clients associated with a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn list_clients(&self, session_id: &str) -> AuthResult<Vec<String>>;

    /// Removes every association for a session. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn remove_session(&self, session_id: &str) -> AuthResult<()>;
}
