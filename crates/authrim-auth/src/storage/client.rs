//! Client registration storage trait.

use async_trait::async_trait;

use crate::AuthResult;
use crate::types::Client;

/// Storage interface for client registrations.
///
/// Clients are provisioned by the admin plane; the core reads them through
/// the read-through registry cache, so implementations only need lookup.
#[async_trait]
pub trait ClientStore: Send + Sync {
    /// Finds a client by `client_id`. Inactive clients read as absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn find_by_client_id(&self, client_id: &str) -> AuthResult<Option<Client>>;
}
