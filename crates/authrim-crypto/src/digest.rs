//! Digests, HMAC and the half-hash token binding claims.
//!
//! The `at_hash` / `c_hash` / `ds_hash` claims bind an ID token to the other
//! artefacts delivered alongside it:
//!
//! ```text
//! hash = base64url( SHA-d(ascii(token))[0 .. d/16] )
//! ```
//!
//! where `d` is the digest size of the ID token's signing algorithm family
//! (SHA-256 for *256 algorithms, SHA-384 for *384, SHA-512 for *512).

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;

use crate::error::CryptoError;
use crate::keys::SigningAlgorithm;

/// Encodes bytes as base64url without padding.
#[must_use]
pub fn base64url_encode(data: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Decodes base64url (no padding) into bytes.
///
/// # Errors
///
/// Returns `CryptoError::Decoding` on invalid input.
pub fn base64url_decode(data: &str) -> Result<Vec<u8>, CryptoError> {
    URL_SAFE_NO_PAD
        .decode(data)
        .map_err(|e| CryptoError::decoding(format!("invalid base64url: {e}")))
}

/// SHA-256 digest.
#[must_use]
pub fn sha256(data: impl AsRef<[u8]>) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data.as_ref());
    hasher.finalize().into()
}

/// Computes the left-half hash claim for a token under the given signing
/// algorithm: `base64url(SHA-d(ascii(token))[0 .. d/16])`.
#[must_use]
pub fn half_hash(alg: SigningAlgorithm, token: &str) -> String {
    let digest: Vec<u8> = match alg.digest_bits() {
        384 => Sha384::digest(token.as_bytes()).to_vec(),
        512 => Sha512::digest(token.as_bytes()).to_vec(),
        _ => Sha256::digest(token.as_bytes()).to_vec(),
    };
    base64url_encode(&digest[..digest.len() / 2])
}

/// HMAC-SHA256 of `data` under `key`.
///
/// Used for email-OTP secret hashing; the cleartext code is never stored.
#[must_use]
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time byte comparison.
///
/// Always compares full slices; unequal lengths short-circuit to `false`
/// without leaking contents.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
