//! # authrim-crypto
//!
//! JOSE and digest primitives for the Authrim authorization server.
//!
//! This crate provides:
//! - SHA-2 digests, HMAC-SHA256 and constant-time comparison
//! - The half-hash token binding claims (`at_hash`, `c_hash`, `ds_hash`)
//! - JWK/JWKS types with RFC 7638 thumbprints and `DecodingKey` import
//! - RSA signing key pairs and JWS encode/verify
//! - Compact JWE (RSA-OAEP-256 + A256GCM) for JARM encryption and inbound
//!   encrypted request objects
//!
//! `alg=none` is never produced and always rejected on verification.

pub mod digest;
pub mod error;
pub mod jwe;
pub mod jwk;
pub mod keys;

pub use digest::{
    base64url_decode, base64url_encode, constant_time_eq, half_hash, hmac_sha256, sha256,
};
pub use error::CryptoError;
pub use jwe::{decrypt_compact, encrypt_compact, is_jwe_compact};
pub use jwk::{Jwk, Jwks};
pub use keys::{SigningAlgorithm, SigningKeyPair, raw_header_alg, verify_with_jwks};

/// Result alias for crypto operations.
pub type CryptoResult<T> = Result<T, CryptoError>;
