//! OAuth 2.0 / OIDC client registration types.

use serde::{Deserialize, Serialize};

use authrim_core::url::redirect_uri_matches;
use authrim_crypto::jwk::Jwks;

// =============================================================================
// Client authentication method
// =============================================================================

/// How a client authenticates at the token and PAR endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    /// No authentication (public client, PKCE only).
    None,
    /// `client_secret` in the POST body.
    ClientSecretPost,
    /// `client_secret` via HTTP Basic.
    ClientSecretBasic,
    /// Signed JWT assertion against the client's JWKS.
    PrivateKeyJwt,
}

impl ClientAuthMethod {
    /// The registered metadata value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::ClientSecretPost => "client_secret_post",
            Self::ClientSecretBasic => "client_secret_basic",
            Self::PrivateKeyJwt => "private_key_jwt",
        }
    }
}

/// Delegation mode for downstream token issuance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DelegationMode {
    /// No delegation.
    #[default]
    None,
    /// The client may act on behalf of its users toward other clients.
    OnBehalfOf,
}

// =============================================================================
// Client
// =============================================================================

/// A registered OAuth 2.0 / OIDC client.
///
/// Created and mutated by the admin plane; the core only reads it, through
/// the read-through registry cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    /// Unique client identifier.
    pub client_id: String,

    /// Human-readable display name, shown on consent pages.
    pub name: String,

    /// Tenant that owns this client. Empty means the `default` tenant.
    #[serde(default)]
    pub tenant_id: String,

    /// Registered redirect URIs. A request's `redirect_uri` must equal one
    /// of these under URL normalization.
    pub redirect_uris: Vec<String>,

    /// Registered post-logout redirect URIs.
    #[serde(default)]
    pub post_logout_redirect_uris: Vec<String>,

    /// Response types this client may use. Empty means the full supported
    /// set.
    #[serde(default)]
    pub allowed_response_types: Vec<String>,

    /// Scope whitelist. Empty means any scope may be requested.
    #[serde(default)]
    pub requestable_scopes: Vec<String>,

    /// Argon2 hash of the client secret, for confidential clients.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret_hash: Option<String>,

    /// How the client authenticates at the token endpoint.
    pub auth_method: ClientAuthMethod,

    /// Inline JWKS for request-object and client-assertion verification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks: Option<Jwks>,

    /// Remote JWKS URL, fetched with the SSRF guard when `jwks` is absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,

    /// Whether access tokens for this client must be DPoP-bound.
    #[serde(default)]
    pub dpop_bound_access_tokens: bool,

    /// Trusted first-party client: consent is auto-granted once and cached.
    #[serde(default)]
    pub skip_consent: bool,

    /// Whether `prompt=none` may succeed against an anonymous session.
    #[serde(default)]
    pub allow_anonymous_prompt_none: bool,

    /// Delegation mode.
    #[serde(default)]
    pub delegation_mode: DelegationMode,

    /// Front-channel logout URI.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frontchannel_logout_uri: Option<String>,

    /// Back-channel logout URI.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backchannel_logout_uri: Option<String>,

    /// Clients whose subject tokens this client may exchange. An empty list
    /// allows none (it does not mean "allow all").
    #[serde(default)]
    pub allowed_subject_token_clients: Vec<String>,

    /// Whether the client is active.
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl Client {
    /// Checks a requested redirect URI against the registration under URL
    /// normalization. Exact match only.
    #[must_use]
    pub fn is_redirect_uri_registered(&self, uri: &str) -> bool {
        self.redirect_uris
            .iter()
            .any(|registered| redirect_uri_matches(registered, uri))
    }

    /// Checks a post-logout redirect URI against the registration.
    #[must_use]
    pub fn is_post_logout_redirect_uri_registered(&self, uri: &str) -> bool {
        self.post_logout_redirect_uris
            .iter()
            .any(|registered| redirect_uri_matches(registered, uri))
    }

    /// Checks whether every requested scope is inside the whitelist. An
    /// empty whitelist allows everything.
    #[must_use]
    pub fn are_scopes_allowed(&self, requested: &str) -> bool {
        if self.requestable_scopes.is_empty() {
            return true;
        }
        requested
            .split_whitespace()
            .all(|scope| self.requestable_scopes.iter().any(|allowed| allowed == scope))
    }

    /// Checks whether the client may use a response type. An empty list
    /// allows the full supported set.
    #[must_use]
    pub fn allows_response_type(&self, response_type: &str) -> bool {
        self.allowed_response_types.is_empty()
            || self
                .allowed_response_types
                .iter()
                .any(|rt| rt == response_type)
    }

    /// Minimal validation of an admin-supplied registration.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ClientValidationError> {
        if self.client_id.is_empty() {
            return Err(ClientValidationError::EmptyClientId);
        }
        if self.redirect_uris.is_empty() {
            return Err(ClientValidationError::NoRedirectUris);
        }
        if matches!(
            self.auth_method,
            ClientAuthMethod::ClientSecretPost | ClientAuthMethod::ClientSecretBasic
        ) && self.client_secret_hash.is_none()
        {
            return Err(ClientValidationError::MissingSecret);
        }
        if self.auth_method == ClientAuthMethod::PrivateKeyJwt
            && self.jwks.is_none()
            && self.jwks_uri.is_none()
        {
            return Err(ClientValidationError::MissingJwks);
        }
        Ok(())
    }
}

/// Violations of the client registration constraints.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClientValidationError {
    /// `client_id` is empty.
    #[error("client_id must not be empty")]
    EmptyClientId,

    /// No redirect URIs registered.
    #[error("at least one redirect URI is required")]
    NoRedirectUris,

    /// Secret-based auth without a secret hash.
    #[error("client_secret auth method requires a stored secret hash")]
    MissingSecret,

    /// `private_key_jwt` without key material.
    #[error("private_key_jwt requires jwks or jwks_uri")]
    MissingJwks,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Client {
        Client {
            client_id: "cid1".to_string(),
            name: "Test RP".to_string(),
            tenant_id: String::new(),
            redirect_uris: vec!["https://rp.example/cb".to_string()],
            post_logout_redirect_uris: vec!["https://rp.example/logged-out".to_string()],
            allowed_response_types: Vec::new(),
            requestable_scopes: vec!["openid".to_string(), "profile".to_string()],
            client_secret_hash: None,
            auth_method: ClientAuthMethod::None,
            jwks: None,
            jwks_uri: None,
            dpop_bound_access_tokens: false,
            skip_consent: false,
            allow_anonymous_prompt_none: false,
            delegation_mode: DelegationMode::None,
            frontchannel_logout_uri: None,
            backchannel_logout_uri: None,
            allowed_subject_token_clients: Vec::new(),
            active: true,
        }
    }

    #[test]
    fn test_redirect_uri_normalized_match() {
        let client = client();
        assert!(client.is_redirect_uri_registered("https://rp.example/cb"));
        assert!(client.is_redirect_uri_registered("HTTPS://RP.EXAMPLE:443/cb/"));
        assert!(!client.is_redirect_uri_registered("https://rp.example/cb/extra"));
        assert!(!client.is_redirect_uri_registered("https://evil.example/cb"));
    }

    #[test]
    fn test_scope_whitelist_subset() {
        let client = client();
        assert!(client.are_scopes_allowed("openid"));
        assert!(client.are_scopes_allowed("openid profile"));
        assert!(!client.are_scopes_allowed("openid email"));
    }

    #[test]
    fn test_empty_whitelist_allows_all() {
        let mut client = client();
        client.requestable_scopes.clear();
        assert!(client.are_scopes_allowed("openid email phone"));
    }

    #[test]
    fn test_response_type_filter() {
        let mut client = client();
        assert!(client.allows_response_type("code id_token"));
        client.allowed_response_types = vec!["code".to_string()];
        assert!(client.allows_response_type("code"));
        assert!(!client.allows_response_type("code id_token"));
    }

    #[test]
    fn test_validation() {
        let mut c = client();
        assert!(c.validate().is_ok());

        c.auth_method = ClientAuthMethod::ClientSecretBasic;
        assert_eq!(c.validate().unwrap_err(), ClientValidationError::MissingSecret);

        c.auth_method = ClientAuthMethod::PrivateKeyJwt;
        assert_eq!(c.validate().unwrap_err(), ClientValidationError::MissingJwks);

        c.jwks_uri = Some("https://rp.example/jwks".to_string());
        assert!(c.validate().is_ok());
    }
}
