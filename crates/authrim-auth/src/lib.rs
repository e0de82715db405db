//! # authrim-auth
//!
//! The OpenID Connect Provider / OAuth 2.0 Authorization Server core for
//! Authrim.
//!
//! This crate provides:
//! - The authorization state machine (request → login → consent → issue)
//! - Request parsing and validation across query/body, PAR and JAR sources
//! - Token issuance: authorization codes, access tokens, ID tokens, their
//!   binding hash claims, DPoP, JARM
//! - Alternative authenticators: passkey/WebAuthn, email-OTP, DID-based
//!   authentication, SAML SP assertion consumption
//! - Front- and back-channel logout coordination
//! - Storage traits for the relational (non-PII and PII) stores
//! - Axum HTTP handlers for the full endpoint surface
//!
//! ## Modules
//!
//! - [`error`] - The error taxonomy and its OAuth wire mapping
//! - [`types`] - Clients, consents, users
//! - [`registry`] - Read-through client cache
//! - [`request`] - Request parser and validator
//! - [`flow`] - The authorization state machine
//! - [`token`] - Token issuer, DPoP, the token endpoint
//! - [`authn`] - Alternative authenticators
//! - [`logout`] - Logout coordination
//! - [`storage`] - Relational storage traits
//! - [`http`] - Axum handlers

pub mod authn;
pub mod error;
pub mod flow;
pub mod http;
pub mod logout;
pub mod registry;
pub mod request;
pub mod storage;
pub mod token;
pub mod types;

pub use error::{AuthError, ValidationCode};
pub use flow::{AuthorizationService, AuthorizeOutcome, Delivery, FlowInput, ResponseParams};
pub use http::{AppState, build_router};
pub use registry::ClientRegistry;
pub use request::{
    AuthorizeReject, OutboundFetcher, PromptSet, RawParams, RequestValidator, ResponseMode,
    ResponseTypeSet, ValidatedAuthRequest,
};
pub use storage::{
    ClientStore, ConsentStore, IdentityProvider, IdentityProviderStore, LinkedIdentity,
    LinkedIdentityStore, NewUser, PasskeyCredential, PasskeyStore, SamlReplayStore,
    SessionClientStore, UserStore,
};
pub use token::{TokenIssuer, TokenRequest, TokenResponse, TokenService};
pub use types::{Client, ClientAuthMethod, ConsentRecord, UserCore, UserInfo, UserPii};

/// Type alias for authorization results.
pub type AuthResult<T> = Result<T, AuthError>;
