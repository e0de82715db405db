//! Authorization server error types.
//!
//! Every failure inside the core maps onto one of these variants, and a
//! single conversion layer at the handler boundary turns the variant into
//! the correct delivery shape: an OAuth error redirect (with `state` echoed
//! and `iss` included), a JSON error body, or an HTML error page.

use authrim_crypto::CryptoError;
use authrim_state::StateError;

/// Errors that can occur during authorization processing.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The request failed validation. Delivered as an OAuth error redirect
    /// when the redirect URI is valid and registered, otherwise rendered.
    #[error("{code}: {description}")]
    Validation {
        /// OAuth error code.
        code: ValidationCode,
        /// Human-readable description.
        description: String,
    },

    /// Client authentication failed. Delivered as 401 JSON.
    #[error("Invalid client: {message}")]
    ClientAuth {
        /// Description of the failure.
        message: String,
    },

    /// Authentication is required (`prompt=none` without a usable session).
    #[error("Login required")]
    LoginRequired,

    /// Consent is required (`prompt=none` without sufficient consent).
    #[error("Consent required")]
    ConsentRequired,

    /// Interaction is required but prompts were suppressed.
    #[error("Interaction required")]
    InteractionRequired,

    /// A DPoP proof failed validation.
    #[error("Invalid DPoP proof: {description}")]
    InvalidDpop {
        /// Description of the failure.
        description: String,
    },

    /// The grant (authorization code, subject token) is invalid, expired or
    /// already consumed. Delivered as 400 JSON at the token endpoint.
    #[error("Invalid grant: {message}")]
    InvalidGrant {
        /// Description of the failure.
        message: String,
    },

    /// The `request_uri` could not be resolved. Delivered as 400 JSON.
    #[error("Invalid request URI: {message}")]
    InvalidRequestUri {
        /// Description of the failure.
        message: String,
    },

    /// The `request` object failed verification. Delivered as 400 JSON.
    #[error("Invalid request object: {message}")]
    InvalidRequestObject {
        /// Description of the failure.
        message: String,
    },

    /// HTTPS `request_uri` values are not enabled for this deployment.
    #[error("request_uri is not supported")]
    RequestUriNotSupported,

    /// A challenge, code or OTP failed to consume. Always surfaced with the
    /// same generic message regardless of the underlying cause.
    #[error("Invalid or expired code")]
    InvalidChallenge,

    /// The request exceeded a rate limit. Delivered as 429 with Retry-After.
    #[error("Rate limited, retry after {retry_after}s")]
    RateLimited {
        /// Seconds until the window resets.
        retry_after: u64,
    },

    /// The deployment is missing required configuration (e.g. no login UI
    /// and conformance mode off). Delivered as 500 JSON with an explicit
    /// config-error envelope.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the missing configuration.
        message: String,
    },

    /// Internal error. The description is fixed on the wire; the underlying
    /// cause goes to the log only.
    #[error("Internal error")]
    Internal {
        /// Description, never sent to clients.
        message: String,
    },
}

impl AuthError {
    /// Creates a `Validation` error with `invalid_request`.
    #[must_use]
    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::Validation {
            code: ValidationCode::InvalidRequest,
            description: description.into(),
        }
    }

    /// Creates a `Validation` error with `invalid_scope`.
    #[must_use]
    pub fn invalid_scope(description: impl Into<String>) -> Self {
        Self::Validation {
            code: ValidationCode::InvalidScope,
            description: description.into(),
        }
    }

    /// Creates a `Validation` error with `unsupported_response_type`.
    #[must_use]
    pub fn unsupported_response_type(description: impl Into<String>) -> Self {
        Self::Validation {
            code: ValidationCode::UnsupportedResponseType,
            description: description.into(),
        }
    }

    /// Creates a `Validation` error with `invalid_authorization_details`.
    #[must_use]
    pub fn invalid_authorization_details(description: impl Into<String>) -> Self {
        Self::Validation {
            code: ValidationCode::InvalidAuthorizationDetails,
            description: description.into(),
        }
    }

    /// Creates a new `ClientAuth` error.
    #[must_use]
    pub fn client_auth(message: impl Into<String>) -> Self {
        Self::ClientAuth {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidGrant` error.
    #[must_use]
    pub fn invalid_grant(message: impl Into<String>) -> Self {
        Self::InvalidGrant {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidDpop` error.
    #[must_use]
    pub fn invalid_dpop(description: impl Into<String>) -> Self {
        Self::InvalidDpop {
            description: description.into(),
        }
    }

    /// Creates a new `InvalidRequestUri` error.
    #[must_use]
    pub fn invalid_request_uri(message: impl Into<String>) -> Self {
        Self::InvalidRequestUri {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidRequestObject` error.
    #[must_use]
    pub fn invalid_request_object(message: impl Into<String>) -> Self {
        Self::InvalidRequestObject {
            message: message.into(),
        }
    }

    /// Creates a new `Configuration` error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The OAuth 2.0 error code for the wire.
    #[must_use]
    pub fn oauth_error_code(&self) -> &'static str {
        match self {
            Self::Validation { code, .. } => code.as_str(),
            Self::ClientAuth { .. } => "invalid_client",
            Self::LoginRequired => "login_required",
            Self::ConsentRequired => "consent_required",
            Self::InteractionRequired => "interaction_required",
            Self::InvalidDpop { .. } => "invalid_dpop_proof",
            Self::InvalidGrant { .. } => "invalid_grant",
            Self::InvalidRequestUri { .. } => "invalid_request_uri",
            Self::InvalidRequestObject { .. } => "invalid_request_object",
            Self::RequestUriNotSupported => "request_uri_not_supported",
            Self::InvalidChallenge => "invalid_request",
            Self::RateLimited { .. } => "temporarily_unavailable",
            Self::Configuration { .. } | Self::Internal { .. } => "server_error",
        }
    }

    /// The description safe to put on the wire. Internal causes collapse to
    /// a fixed string.
    #[must_use]
    pub fn wire_description(&self) -> String {
        match self {
            Self::Validation { description, .. } => description.clone(),
            Self::ClientAuth { message } => message.clone(),
            Self::LoginRequired => "Authentication is required".to_string(),
            Self::ConsentRequired => "Consent is required".to_string(),
            Self::InteractionRequired => "Interaction is required".to_string(),
            Self::InvalidDpop { description } => description.clone(),
            Self::InvalidGrant { message } => message.clone(),
            Self::InvalidRequestUri { message } => message.clone(),
            Self::InvalidRequestObject { message } => message.clone(),
            Self::RequestUriNotSupported => "request_uri is not supported".to_string(),
            Self::InvalidChallenge => "Invalid or expired code".to_string(),
            Self::RateLimited { .. } => "Too many requests".to_string(),
            Self::Configuration { .. } => "Server configuration error".to_string(),
            Self::Internal { .. } => "An internal error occurred".to_string(),
        }
    }

    /// Returns `true` when the error should be redirected back to the
    /// client (given a valid, registered redirect URI).
    #[must_use]
    pub fn is_redirectable(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::LoginRequired
                | Self::ConsentRequired
                | Self::InteractionRequired
                | Self::InvalidDpop { .. }
        )
    }

    /// HTTP status for the JSON delivery shapes.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::ClientAuth { .. } => 401,
            Self::RateLimited { .. } => 429,
            Self::Configuration { .. } | Self::Internal { .. } => 500,
            _ => 400,
        }
    }
}

impl From<StateError> for AuthError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::NotFound | StateError::InvalidChallenge => Self::InvalidChallenge,
            StateError::AlreadyExists => Self::internal("state collision"),
            StateError::Storage { message } => Self::internal(message),
            StateError::Crypto(e) => Self::internal(e.to_string()),
        }
    }
}

impl From<CryptoError> for AuthError {
    fn from(err: CryptoError) -> Self {
        Self::internal(err.to_string())
    }
}

/// OAuth error codes produced by request validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationCode {
    /// Malformed or missing parameter.
    InvalidRequest,
    /// Scope outside the client's requestable set.
    InvalidScope,
    /// Response type outside the supported or allowed set.
    UnsupportedResponseType,
    /// `authorization_details` failed validation.
    InvalidAuthorizationDetails,
}

impl ValidationCode {
    /// The wire form of the code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidScope => "invalid_scope",
            Self::UnsupportedResponseType => "unsupported_response_type",
            Self::InvalidAuthorizationDetails => "invalid_authorization_details",
        }
    }
}

impl std::fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oauth_error_codes() {
        assert_eq!(
            AuthError::invalid_request("x").oauth_error_code(),
            "invalid_request"
        );
        assert_eq!(AuthError::invalid_scope("x").oauth_error_code(), "invalid_scope");
        assert_eq!(AuthError::LoginRequired.oauth_error_code(), "login_required");
        assert_eq!(
            AuthError::ConsentRequired.oauth_error_code(),
            "consent_required"
        );
        assert_eq!(
            AuthError::invalid_dpop("x").oauth_error_code(),
            "invalid_dpop_proof"
        );
        assert_eq!(AuthError::internal("x").oauth_error_code(), "server_error");
    }

    #[test]
    fn test_redirectable_classification() {
        assert!(AuthError::invalid_request("x").is_redirectable());
        assert!(AuthError::LoginRequired.is_redirectable());
        assert!(!AuthError::client_auth("x").is_redirectable());
        assert!(!AuthError::invalid_request_uri("x").is_redirectable());
        assert!(!AuthError::RateLimited { retry_after: 10 }.is_redirectable());
    }

    #[test]
    fn test_http_statuses() {
        assert_eq!(AuthError::client_auth("x").http_status(), 401);
        assert_eq!(AuthError::RateLimited { retry_after: 5 }.http_status(), 429);
        assert_eq!(AuthError::internal("x").http_status(), 500);
        assert_eq!(AuthError::invalid_request_object("x").http_status(), 400);
    }

    #[test]
    fn test_internal_description_never_leaks() {
        let err = AuthError::internal("database password wrong");
        assert_eq!(err.wire_description(), "An internal error occurred");
    }

    #[test]
    fn test_state_error_collapses_to_uniform_challenge_error() {
        let from_not_found: AuthError = StateError::NotFound.into();
        let from_invalid: AuthError = StateError::InvalidChallenge.into();
        assert_eq!(
            from_not_found.wire_description(),
            from_invalid.wire_description()
        );
    }
}
