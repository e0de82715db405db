//! Token issuance and the credential subsystem.

pub mod dpop;
pub mod endpoint;
pub mod issuer;

pub use dpop::{DpopValidation, validate_dpop_proof};
pub use endpoint::{TokenRequest, TokenResponse, TokenService};
pub use issuer::{AccessTokenClaims, IdTokenClaims, IdTokenParams, TokenIssuer};
