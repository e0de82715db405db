//! Compact JWE: RSA-OAEP-256 key wrap with A256GCM content encryption.
//!
//! Two call sites: encrypting JARM response JWTs to a client's public key,
//! and decrypting inbound request objects encrypted to the server key.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::digest::{base64url_decode, base64url_encode};
use crate::error::CryptoError;

/// Returns `true` if the compact serialization has the five-part JWE shape
/// (as opposed to the three-part JWS shape).
#[must_use]
pub fn is_jwe_compact(token: &str) -> bool {
    token.split('.').count() == 5
}

/// Encrypts `payload` to `recipient` as a compact JWE.
///
/// Header: `{"alg":"RSA-OAEP-256","enc":"A256GCM"}` plus optional `kid` and
/// `cty` members. A fresh 256-bit CEK and 96-bit IV are drawn per call.
///
/// # Errors
///
/// Returns `CryptoError::Jwe` if key wrap or content encryption fails.
pub fn encrypt_compact(
    payload: &[u8],
    recipient: &RsaPublicKey,
    kid: Option<&str>,
    cty: Option<&str>,
) -> Result<String, CryptoError> {
    let mut header = serde_json::json!({
        "alg": "RSA-OAEP-256",
        "enc": "A256GCM",
    });
    if let Some(kid) = kid {
        header["kid"] = serde_json::Value::String(kid.to_string());
    }
    if let Some(cty) = cty {
        header["cty"] = serde_json::Value::String(cty.to_string());
    }
    let header_b64 = base64url_encode(
        serde_json::to_vec(&header).map_err(|e| CryptoError::jwe(e.to_string()))?,
    );

    let mut cek = [0u8; 32];
    OsRng.fill_bytes(&mut cek);
    let mut iv = [0u8; 12];
    OsRng.fill_bytes(&mut iv);

    let encrypted_key = recipient
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &cek)
        .map_err(|e| CryptoError::jwe(format!("key wrap failed: {e}")))?;

    let cipher = Aes256Gcm::new_from_slice(&cek)
        .map_err(|e| CryptoError::jwe(format!("cipher init failed: {e}")))?;
    // AAD is the ASCII of the base64url-encoded header, per RFC 7516 §5.1.
    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: payload,
                aad: header_b64.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::jwe("content encryption failed"))?;

    // aes-gcm appends the 16-byte tag to the ciphertext.
    let (ciphertext, tag) = sealed.split_at(sealed.len() - 16);

    Ok(format!(
        "{}.{}.{}.{}.{}",
        header_b64,
        base64url_encode(&encrypted_key),
        base64url_encode(iv),
        base64url_encode(ciphertext),
        base64url_encode(tag),
    ))
}

/// Decrypts a compact JWE with the server's RSA private key.
///
/// Only `alg=RSA-OAEP-256` with `enc=A256GCM` is accepted.
///
/// # Errors
///
/// Returns `CryptoError::Jwe` on structural problems and
/// `CryptoError::UnsupportedAlgorithm` for other algorithm combinations.
pub fn decrypt_compact(token: &str, key: &RsaPrivateKey) -> Result<Vec<u8>, CryptoError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 5 {
        return Err(CryptoError::jwe(format!(
            "expected 5 JWE segments, got {}",
            parts.len()
        )));
    }
    let [header_b64, encrypted_key_b64, iv_b64, ciphertext_b64, tag_b64] =
        [parts[0], parts[1], parts[2], parts[3], parts[4]];

    let header: serde_json::Value = serde_json::from_slice(&base64url_decode(header_b64)?)
        .map_err(|e| CryptoError::jwe(format!("invalid JWE header: {e}")))?;
    let alg = header.get("alg").and_then(|v| v.as_str()).unwrap_or("");
    let enc = header.get("enc").and_then(|v| v.as_str()).unwrap_or("");
    if alg != "RSA-OAEP-256" {
        return Err(CryptoError::unsupported_algorithm(alg));
    }
    if enc != "A256GCM" {
        return Err(CryptoError::unsupported_algorithm(enc));
    }

    let cek = key
        .decrypt(Oaep::new::<Sha256>(), &base64url_decode(encrypted_key_b64)?)
        .map_err(|_| CryptoError::jwe("key unwrap failed"))?;
    if cek.len() != 32 {
        return Err(CryptoError::jwe("unexpected CEK length"));
    }

    let iv = base64url_decode(iv_b64)?;
    if iv.len() != 12 {
        return Err(CryptoError::jwe("unexpected IV length"));
    }

    let mut sealed = base64url_decode(ciphertext_b64)?;
    sealed.extend_from_slice(&base64url_decode(tag_b64)?);

    let cipher = Aes256Gcm::new_from_slice(&cek)
        .map_err(|e| CryptoError::jwe(format!("cipher init failed: {e}")))?;
    cipher
        .decrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: &sealed,
                aad: header_b64.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::jwe("content decryption failed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{SigningAlgorithm, SigningKeyPair};

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = SigningKeyPair::generate(SigningAlgorithm::RS256).unwrap();
        let payload = br#"{"iss":"https://issuer.example","code":"abc"}"#;

        let jwe = encrypt_compact(payload, &key.rsa_public_key(), Some("k1"), Some("JWT")).unwrap();
        assert!(is_jwe_compact(&jwe));

        let decrypted = decrypt_compact(&jwe, key.rsa_private_key()).unwrap();
        assert_eq!(decrypted, payload);
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = SigningKeyPair::generate(SigningAlgorithm::RS256).unwrap();
        let other = SigningKeyPair::generate(SigningAlgorithm::RS256).unwrap();

        let jwe = encrypt_compact(b"secret", &key.rsa_public_key(), None, None).unwrap();
        assert!(decrypt_compact(&jwe, other.rsa_private_key()).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = SigningKeyPair::generate(SigningAlgorithm::RS256).unwrap();
        let jwe = encrypt_compact(b"secret", &key.rsa_public_key(), None, None).unwrap();

        let mut parts: Vec<String> = jwe.split('.').map(ToString::to_string).collect();
        // Flip one character of the ciphertext segment.
        let mut chars: Vec<char> = parts[3].chars().collect();
        chars[0] = if chars[0] == 'A' { 'B' } else { 'A' };
        parts[3] = chars.into_iter().collect();
        let tampered = parts.join(".");

        assert!(decrypt_compact(&tampered, key.rsa_private_key()).is_err());
    }

    #[test]
    fn test_jws_shape_not_jwe() {
        assert!(!is_jwe_compact("a.b.c"));
        assert!(is_jwe_compact("a.b.c.d.e"));
    }
}
