//! JSON Web Key types, thumbprints and decoding-key import.
//!
//! Covers the key shapes the server actually meets: RSA (its own signing
//! keys and most client keys), EC P-256/P-384 (DPoP, WebAuthn, DID proofs)
//! and OKP Ed25519 (DID proofs).

use jsonwebtoken::DecodingKey;
use serde::{Deserialize, Serialize};

use crate::digest::{base64url_encode, sha256};
use crate::error::CryptoError;

/// JSON Web Key (public part only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type: "RSA", "EC" or "OKP".
    pub kty: String,

    /// Key ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,

    /// Key use ("sig" for signing).
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub use_: Option<String>,

    /// Algorithm hint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,

    /// RSA modulus (base64url).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,

    /// RSA exponent (base64url).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,

    /// EC / OKP curve name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,

    /// EC / OKP x coordinate (base64url).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,

    /// EC y coordinate (base64url).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

impl Jwk {
    /// Builds an RSA public JWK from base64url components.
    #[must_use]
    pub fn rsa(kid: impl Into<String>, n: impl Into<String>, e: impl Into<String>) -> Self {
        Self {
            kty: "RSA".to_string(),
            kid: Some(kid.into()),
            use_: Some("sig".to_string()),
            alg: Some("RS256".to_string()),
            n: Some(n.into()),
            e: Some(e.into()),
            crv: None,
            x: None,
            y: None,
        }
    }

    /// Converts this JWK into a `jsonwebtoken::DecodingKey`.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` when required members are missing
    /// or `CryptoError::UnsupportedAlgorithm` for unknown key types or
    /// curves without backend support (e.g. P-521).
    pub fn to_decoding_key(&self) -> Result<DecodingKey, CryptoError> {
        match self.kty.as_str() {
            "RSA" => {
                let n = self
                    .n
                    .as_deref()
                    .ok_or_else(|| CryptoError::invalid_key("RSA JWK missing n"))?;
                let e = self
                    .e
                    .as_deref()
                    .ok_or_else(|| CryptoError::invalid_key("RSA JWK missing e"))?;
                DecodingKey::from_rsa_components(n, e)
                    .map_err(|err| CryptoError::invalid_key(err.to_string()))
            }
            "EC" => {
                let crv = self
                    .crv
                    .as_deref()
                    .ok_or_else(|| CryptoError::invalid_key("EC JWK missing crv"))?;
                if crv != "P-256" && crv != "P-384" {
                    return Err(CryptoError::unsupported_algorithm(format!("EC curve {crv}")));
                }
                let x = self
                    .x
                    .as_deref()
                    .ok_or_else(|| CryptoError::invalid_key("EC JWK missing x"))?;
                let y = self
                    .y
                    .as_deref()
                    .ok_or_else(|| CryptoError::invalid_key("EC JWK missing y"))?;
                DecodingKey::from_ec_components(x, y)
                    .map_err(|err| CryptoError::invalid_key(err.to_string()))
            }
            "OKP" => {
                let crv = self
                    .crv
                    .as_deref()
                    .ok_or_else(|| CryptoError::invalid_key("OKP JWK missing crv"))?;
                if crv != "Ed25519" {
                    return Err(CryptoError::unsupported_algorithm(format!("OKP curve {crv}")));
                }
                let x = self
                    .x
                    .as_deref()
                    .ok_or_else(|| CryptoError::invalid_key("OKP JWK missing x"))?;
                DecodingKey::from_ed_components(x)
                    .map_err(|err| CryptoError::invalid_key(err.to_string()))
            }
            other => Err(CryptoError::unsupported_algorithm(format!("kty {other}"))),
        }
    }

    /// RFC 7638 JWK thumbprint: `base64url(SHA-256(canonical-members-JSON))`.
    ///
    /// This is the `jkt` value used for DPoP key binding.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` when required members are missing.
    pub fn thumbprint(&self) -> Result<String, CryptoError> {
        // Required members only, lexicographic order, no whitespace.
        let canonical = match self.kty.as_str() {
            "RSA" => {
                let n = self
                    .n
                    .as_deref()
                    .ok_or_else(|| CryptoError::invalid_key("RSA JWK missing n"))?;
                let e = self
                    .e
                    .as_deref()
                    .ok_or_else(|| CryptoError::invalid_key("RSA JWK missing e"))?;
                format!(r#"{{"e":"{e}","kty":"RSA","n":"{n}"}}"#)
            }
            "EC" => {
                let crv = self
                    .crv
                    .as_deref()
                    .ok_or_else(|| CryptoError::invalid_key("EC JWK missing crv"))?;
                let x = self
                    .x
                    .as_deref()
                    .ok_or_else(|| CryptoError::invalid_key("EC JWK missing x"))?;
                let y = self
                    .y
                    .as_deref()
                    .ok_or_else(|| CryptoError::invalid_key("EC JWK missing y"))?;
                format!(r#"{{"crv":"{crv}","kty":"EC","x":"{x}","y":"{y}"}}"#)
            }
            "OKP" => {
                let crv = self
                    .crv
                    .as_deref()
                    .ok_or_else(|| CryptoError::invalid_key("OKP JWK missing crv"))?;
                let x = self
                    .x
                    .as_deref()
                    .ok_or_else(|| CryptoError::invalid_key("OKP JWK missing x"))?;
                format!(r#"{{"crv":"{crv}","kty":"OKP","x":"{x}"}}"#)
            }
            other => {
                return Err(CryptoError::unsupported_algorithm(format!("kty {other}")));
            }
        };
        Ok(base64url_encode(sha256(canonical.as_bytes())))
    }
}

/// JSON Web Key Set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Jwks {
    /// The keys in this set.
    pub keys: Vec<Jwk>,
}

impl Jwks {
    /// Creates a new empty JWKS.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds a key by its `kid`.
    #[must_use]
    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid.as_deref() == Some(kid))
    }

    /// Returns all keys usable for signature verification.
    ///
    /// Keys with no `use` member count as signing keys; `enc` keys are
    /// excluded.
    #[must_use]
    pub fn signing_keys(&self) -> Vec<&Jwk> {
        self.keys
            .iter()
            .filter(|k| k.use_.as_deref() != Some("enc"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc7638_thumbprint_vector() {
        // Test key from RFC 7638 §3.1.
        let jwk = Jwk {
            kty: "RSA".to_string(),
            kid: Some("2011-04-29".to_string()),
            use_: None,
            alg: None,
            n: Some(
                "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw"
                    .to_string(),
            ),
            e: Some("AQAB".to_string()),
            crv: None,
            x: None,
            y: None,
        };
        assert_eq!(
            jwk.thumbprint().unwrap(),
            "NzbLsXh8uDCcd-6MNwXF4W_7noWXFZAfHkxZsRGC9Xs"
        );
    }

    #[test]
    fn test_find_by_kid() {
        let mut jwks = Jwks::new();
        jwks.keys.push(Jwk::rsa("key-1", "AQAB", "AQAB"));
        jwks.keys.push(Jwk::rsa("key-2", "AQAB", "AQAB"));

        assert!(jwks.find("key-1").is_some());
        assert!(jwks.find("key-3").is_none());
    }

    #[test]
    fn test_signing_keys_excludes_enc() {
        let mut jwks = Jwks::new();
        let mut enc_key = Jwk::rsa("enc-1", "AQAB", "AQAB");
        enc_key.use_ = Some("enc".to_string());
        jwks.keys.push(enc_key);
        jwks.keys.push(Jwk::rsa("sig-1", "AQAB", "AQAB"));

        let signing = jwks.signing_keys();
        assert_eq!(signing.len(), 1);
        assert_eq!(signing[0].kid.as_deref(), Some("sig-1"));
    }

    #[test]
    fn test_unknown_kty_rejected() {
        let jwk = Jwk {
            kty: "oct".to_string(),
            kid: None,
            use_: None,
            alg: None,
            n: None,
            e: None,
            crv: None,
            x: None,
            y: None,
        };
        assert!(matches!(
            jwk.to_decoding_key().unwrap_err(),
            CryptoError::UnsupportedAlgorithm { .. }
        ));
    }

    #[test]
    fn test_p521_rejected() {
        let jwk = Jwk {
            kty: "EC".to_string(),
            kid: None,
            use_: None,
            alg: None,
            n: None,
            e: None,
            crv: Some("P-521".to_string()),
            x: Some("AQ".to_string()),
            y: Some("AQ".to_string()),
        };
        assert!(matches!(
            jwk.to_decoding_key().unwrap_err(),
            CryptoError::UnsupportedAlgorithm { .. }
        ));
    }
}
