//! RSA signing key pairs and JWS operations.
//!
//! Every signed artefact the server issues (ID tokens, access tokens, JARM
//! responses, logout tokens) carries the active key's `kid` in its header so
//! relying parties can verify against the published JWKS after rotation.

use std::fmt;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;

use crate::digest::base64url_encode;
use crate::error::CryptoError;
use crate::jwk::{Jwk, Jwks};

/// Supported signing algorithms for server-issued tokens.
///
/// The server signs with RSA; the digest width drives the half-hash claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SigningAlgorithm {
    /// RSA with SHA-256 (default).
    RS256,
    /// RSA with SHA-384.
    RS384,
    /// RSA with SHA-512.
    RS512,
}

impl SigningAlgorithm {
    /// Parses an algorithm name.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::UnsupportedAlgorithm` for anything outside the
    /// RSA family, including `none`.
    pub fn parse(alg: &str) -> Result<Self, CryptoError> {
        match alg {
            "RS256" => Ok(Self::RS256),
            "RS384" => Ok(Self::RS384),
            "RS512" => Ok(Self::RS512),
            other => Err(CryptoError::unsupported_algorithm(other)),
        }
    }

    /// Converts to the `jsonwebtoken` algorithm type.
    #[must_use]
    pub fn to_jwt_algorithm(self) -> Algorithm {
        match self {
            Self::RS256 => Algorithm::RS256,
            Self::RS384 => Algorithm::RS384,
            Self::RS512 => Algorithm::RS512,
        }
    }

    /// Returns the algorithm name as used in JOSE headers.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RS256 => "RS256",
            Self::RS384 => "RS384",
            Self::RS512 => "RS512",
        }
    }

    /// Digest width in bits, for the half-hash binding claims.
    #[must_use]
    pub fn digest_bits(&self) -> u32 {
        match self {
            Self::RS256 => 256,
            Self::RS384 => 384,
            Self::RS512 => 512,
        }
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Default for SigningAlgorithm {
    fn default() -> Self {
        Self::RS256
    }
}

/// An RSA signing key pair with its JOSE metadata.
pub struct SigningKeyPair {
    /// Key ID.
    pub kid: String,

    /// Signing algorithm.
    pub algorithm: SigningAlgorithm,

    /// When the key was created (unix seconds).
    pub created_at: i64,

    private_key: RsaPrivateKey,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    public_n: Vec<u8>,
    public_e: Vec<u8>,
}

impl fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Private key material stays out of Debug output.
        f.debug_struct("SigningKeyPair")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl SigningKeyPair {
    /// Generates a new RSA-2048 key pair.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or PEM conversion fails.
    pub fn generate(algorithm: SigningAlgorithm) -> Result<Self, CryptoError> {
        let private_key = RsaPrivateKey::new(&mut OsRng, 2048)
            .map_err(|e| CryptoError::key_generation(e.to_string()))?;
        Self::from_private_key(uuid::Uuid::new_v4().to_string(), algorithm, private_key)
    }

    /// Builds a key pair from an existing RSA private key.
    ///
    /// # Errors
    ///
    /// Returns an error if PEM conversion fails.
    pub fn from_private_key(
        kid: impl Into<String>,
        algorithm: SigningAlgorithm,
        private_key: RsaPrivateKey,
    ) -> Result<Self, CryptoError> {
        let public_key = private_key.to_public_key();
        let public_n = public_key.n().to_bytes_be();
        let public_e = public_key.e().to_bytes_be();

        let private_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::key_generation(e.to_string()))?;
        let encoding_key = EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .map_err(|e| CryptoError::key_generation(e.to_string()))?;

        let n_b64 = base64url_encode(&public_n);
        let e_b64 = base64url_encode(&public_e);
        let decoding_key = DecodingKey::from_rsa_components(&n_b64, &e_b64)
            .map_err(|e| CryptoError::key_generation(e.to_string()))?;

        Ok(Self {
            kid: kid.into(),
            algorithm,
            created_at: OffsetDateTime::now_utc().unix_timestamp(),
            private_key,
            encoding_key,
            decoding_key,
            public_n,
            public_e,
        })
    }

    /// Loads a key pair from a PKCS#8 PEM private key.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` on malformed PEM data.
    pub fn from_pem(
        kid: impl Into<String>,
        algorithm: SigningAlgorithm,
        private_pem: &str,
    ) -> Result<Self, CryptoError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(private_pem)
            .map_err(|e| CryptoError::invalid_key(e.to_string()))?;
        Self::from_private_key(kid, algorithm, private_key)
    }

    /// Exports the private key as PKCS#8 PEM.
    ///
    /// # Errors
    ///
    /// Returns an error if PEM serialization fails.
    pub fn private_pem(&self) -> Result<String, CryptoError> {
        Ok(self
            .private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::invalid_key(e.to_string()))?
            .to_string())
    }

    /// The RSA private key, for JWE key unwrapping.
    #[must_use]
    pub fn rsa_private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    /// The RSA public key.
    #[must_use]
    pub fn rsa_public_key(&self) -> RsaPublicKey {
        self.private_key.to_public_key()
    }

    /// Exports the public key as a JWK for the JWKS endpoint.
    #[must_use]
    pub fn public_jwk(&self) -> Jwk {
        let mut jwk = Jwk::rsa(
            self.kid.clone(),
            base64url_encode(&self.public_n),
            base64url_encode(&self.public_e),
        );
        jwk.alg = Some(self.algorithm.as_str().to_string());
        jwk
    }

    /// Signs `claims` as a JWS with this key, setting `kid` in the header.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or signing fails.
    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String, CryptoError> {
        let mut header = Header::new(self.algorithm.to_jwt_algorithm());
        header.kid = Some(self.kid.clone());
        jsonwebtoken::encode(&header, claims, &self.encoding_key)
            .map_err(|e| CryptoError::encoding(e.to_string()))
    }

    /// Verifies a JWS against this key pair's public half.
    ///
    /// # Errors
    ///
    /// Returns a verification error on signature or claim failures.
    pub fn verify<T: DeserializeOwned>(
        &self,
        token: &str,
        validation: &Validation,
    ) -> Result<TokenData<T>, CryptoError> {
        Ok(jsonwebtoken::decode::<T>(token, &self.decoding_key, validation)?)
    }
}

/// Verifies a JWS against a JWKS, selecting the key by the header `kid`.
///
/// Tokens without a `kid` are tried against every signing key in the set.
/// `alg=none` is rejected before any key lookup.
///
/// # Errors
///
/// Returns `KeyNotFound` when no key matches, or the verification error of
/// the selected key.
pub fn verify_with_jwks<T: DeserializeOwned>(
    token: &str,
    jwks: &Jwks,
    validation: &Validation,
) -> Result<TokenData<T>, CryptoError> {
    // Reject alg=none from the raw header: jsonwebtoken has no `none`
    // variant, but the rejection must be explicit rather than incidental.
    if raw_header_alg(token)?.eq_ignore_ascii_case("none") {
        return Err(CryptoError::unsupported_algorithm("none"));
    }
    let header = jsonwebtoken::decode_header(token)?;

    if let Some(kid) = &header.kid {
        let jwk = jwks
            .find(kid)
            .ok_or_else(|| CryptoError::key_not_found(kid.clone()))?;
        let key = jwk.to_decoding_key()?;
        return Ok(jsonwebtoken::decode::<T>(token, &key, validation)?);
    }

    // No kid: try every signing key, preserving the last verification error.
    let mut last_err = CryptoError::key_not_found("<no kid>");
    for jwk in jwks.signing_keys() {
        let key = match jwk.to_decoding_key() {
            Ok(key) => key,
            Err(err) => {
                last_err = err;
                continue;
            }
        };
        match jsonwebtoken::decode::<T>(token, &key, validation) {
            Ok(data) => return Ok(data),
            Err(err) => last_err = err.into(),
        }
    }
    Err(last_err)
}

/// Reads the `alg` member of a JOSE header without verifying anything.
///
/// # Errors
///
/// Returns `CryptoError::Decoding` on malformed compact serialization.
pub fn raw_header_alg(token: &str) -> Result<String, CryptoError> {
    let header_b64 = token
        .split('.')
        .next()
        .ok_or_else(|| CryptoError::decoding("empty token"))?;
    let header_bytes = crate::digest::base64url_decode(header_b64)?;
    let header: serde_json::Value = serde_json::from_slice(&header_bytes)
        .map_err(|e| CryptoError::decoding(format!("invalid JOSE header: {e}")))?;
    header
        .get("alg")
        .and_then(|v| v.as_str())
        .map(ToString::to_string)
        .ok_or_else(|| CryptoError::decoding("JOSE header missing alg"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct TestClaims {
        sub: String,
        exp: i64,
    }

    fn test_claims() -> TestClaims {
        TestClaims {
            sub: "user-1".to_string(),
            exp: OffsetDateTime::now_utc().unix_timestamp() + 300,
        }
    }

    #[test]
    fn test_sign_and_verify_roundtrip() {
        let key = SigningKeyPair::generate(SigningAlgorithm::RS256).unwrap();
        let token = key.sign(&test_claims()).unwrap();

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_aud = false;
        let data: TokenData<TestClaims> = key.verify(&token, &validation).unwrap();
        assert_eq!(data.claims.sub, "user-1");
        assert_eq!(data.header.kid.as_deref(), Some(key.kid.as_str()));
    }

    #[test]
    fn test_verify_with_jwks_by_kid() {
        let key = SigningKeyPair::generate(SigningAlgorithm::RS256).unwrap();
        let other = SigningKeyPair::generate(SigningAlgorithm::RS256).unwrap();
        let token = key.sign(&test_claims()).unwrap();

        let jwks = Jwks {
            keys: vec![other.public_jwk(), key.public_jwk()],
        };

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_aud = false;
        let data: TokenData<TestClaims> = verify_with_jwks(&token, &jwks, &validation).unwrap();
        assert_eq!(data.claims.sub, "user-1");
    }

    #[test]
    fn test_verify_with_jwks_unknown_kid() {
        let key = SigningKeyPair::generate(SigningAlgorithm::RS256).unwrap();
        let token = key.sign(&test_claims()).unwrap();

        let jwks = Jwks::new();
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_aud = false;
        let result = verify_with_jwks::<TestClaims>(&token, &jwks, &validation);
        assert!(matches!(result.unwrap_err(), CryptoError::KeyNotFound { .. }));
    }

    #[test]
    fn test_wrong_key_fails_verification() {
        let key = SigningKeyPair::generate(SigningAlgorithm::RS256).unwrap();
        let impostor = SigningKeyPair::generate(SigningAlgorithm::RS256).unwrap();
        let token = key.sign(&test_claims()).unwrap();

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_aud = false;
        let result: Result<TokenData<TestClaims>, _> = impostor.verify(&token, &validation);
        assert!(result.is_err());
    }

    #[test]
    fn test_pem_roundtrip() {
        let key = SigningKeyPair::generate(SigningAlgorithm::RS256).unwrap();
        let pem = key.private_pem().unwrap();
        let restored =
            SigningKeyPair::from_pem(key.kid.clone(), SigningAlgorithm::RS256, &pem).unwrap();

        let token = key.sign(&test_claims()).unwrap();
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_aud = false;
        assert!(restored.verify::<TestClaims>(&token, &validation).is_ok());
    }

    #[test]
    fn test_algorithm_parse() {
        assert_eq!(SigningAlgorithm::parse("RS256").unwrap(), SigningAlgorithm::RS256);
        assert!(SigningAlgorithm::parse("none").is_err());
        assert!(SigningAlgorithm::parse("HS256").is_err());
    }
}
