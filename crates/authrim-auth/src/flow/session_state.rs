//! OIDC Session Management `session_state` computation.
//!
//! ```text
//! session_state = SHA-256(client_id ‖ ' ' ‖ rp_origin ‖ ' ' ‖ browser_state ‖ ' ' ‖ salt) ‖ '.' ‖ salt
//! ```
//!
//! The session-check iframe recomputes this from the non-HttpOnly browser
//! state cookie to detect session changes without a network round trip.
//!
//! Emission is conditional by design: a `session_state` appears only when a
//! session exists, the redirect URI was validated, and the RP origin parses
//! cleanly. All other paths omit the parameter: observable and documented,
//! not an error.

use url::Url;

use authrim_crypto::digest::{base64url_encode, sha256};

/// Extracts the RP origin (`scheme://host[:port]`) from a redirect URI.
#[must_use]
pub fn rp_origin(redirect_uri: &str) -> Option<String> {
    let url = Url::parse(redirect_uri).ok()?;
    let host = url.host_str()?;
    let mut origin = format!("{}://{host}", url.scheme());
    if let Some(port) = url.port() {
        origin.push_str(&format!(":{port}"));
    }
    Some(origin)
}

/// Computes a `session_state` value with a fresh random salt.
#[must_use]
pub fn compute_session_state(client_id: &str, rp_origin: &str, browser_state: &str) -> String {
    use rand::RngCore;
    let mut salt_bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut salt_bytes);
    let salt = hex::encode(salt_bytes);
    compute_with_salt(client_id, rp_origin, browser_state, &salt)
}

/// Computes a `session_state` with a caller-provided salt (the iframe side
/// of the check).
#[must_use]
pub fn compute_with_salt(
    client_id: &str,
    rp_origin: &str,
    browser_state: &str,
    salt: &str,
) -> String {
    let input = format!("{client_id} {rp_origin} {browser_state} {salt}");
    format!("{}.{salt}", base64url_encode(sha256(input.as_bytes())))
}

/// Generates a fresh browser-state cookie value.
#[must_use]
pub fn new_browser_state() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64url_encode(bytes)
}
