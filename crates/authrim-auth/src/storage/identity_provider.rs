//! SAML identity provider storage trait (`identity_providers`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::AuthResult;

/// A provisioned SAML identity provider.
///
/// The verification key is stored as an RSA public key PEM; the admin plane
/// extracts it from the IdP's metadata certificate at provisioning time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityProvider {
    /// SAML entity id (the `Issuer` value on assertions).
    pub entity_id: String,
    /// Single-sign-on URL for AuthnRequests.
    pub sso_url: String,
    /// RSA public key PEM used to verify assertion signatures.
    pub verification_key_pem: String,
    /// Enforce `InResponseTo` against stored AuthnRequest ids. When off,
    /// unsolicited assertions are accepted and the mismatch is only logged.
    pub strict_in_response_to: bool,
    /// Attribute name carrying the email address.
    pub email_attribute: String,
    /// Attribute name carrying the display name.
    pub name_attribute: String,
}

/// Storage interface for SAML identity providers.
#[async_trait]
pub trait IdentityProviderStore: Send + Sync {
    /// Resolves an issuer entity id to a provisioned IdP.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn find_by_entity_id(&self, entity_id: &str) -> AuthResult<Option<IdentityProvider>>;
}
