//! DID-based authentication (`did:key`, `did:web`).
//!
//! The challenge step resolves the DID document and returns a nonce plus
//! the allowed verification methods; the verify step checks a JWS proof
//! (`iss` = the DID, `aud` = the issuer URL, `nonce` echoed) signed by one
//! of those methods, then logs in the linked local user. Proof algorithms
//! are restricted to ES256, ES384 and EdDSA; `none` is always rejected.

use std::sync::Arc;

use jsonwebtoken::{Algorithm, Validation};
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use url::Url;

use authrim_config::AuthrimConfig;
use authrim_core::time::now_unix;
use authrim_crypto::digest::base64url_encode;
use authrim_crypto::jwk::Jwk;
use authrim_crypto::raw_header_alg;
use authrim_state::{ChallengeKind, ChallengePayload, ChallengeRecord, ChallengeStore};

use crate::AuthResult;
use crate::authn::{LoginCompletion, LoginCoordinator};
use crate::error::AuthError;
use crate::request::fetch::OutboundFetcher;
use crate::storage::{LinkedIdentity, LinkedIdentityStore};

/// Provider discriminator for linked DID identities.
pub const DID_PROVIDER: &str = "did";

/// Multicodec prefix for Ed25519 public keys.
const MULTICODEC_ED25519: [u8; 2] = [0xed, 0x01];
/// Multicodec prefix for P-256 public keys (compressed).
const MULTICODEC_P256: [u8; 2] = [0x80, 0x24];

/// A DID challenge handed to the client.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DidChallenge {
    /// Challenge id, echoed back on verify.
    pub challenge_id: String,
    /// Nonce the proof must carry.
    pub nonce: String,
    /// Verification method ids the proof may be signed with.
    pub allowed_methods: Vec<String>,
}

/// The DID authenticator.
pub struct DidService {
    config: Arc<AuthrimConfig>,
    challenges: Arc<dyn ChallengeStore>,
    linked: Arc<dyn LinkedIdentityStore>,
    coordinator: Arc<LoginCoordinator>,
    fetcher: Arc<OutboundFetcher>,
}

impl DidService {
    /// Creates the service.
    #[must_use]
    pub fn new(
        config: Arc<AuthrimConfig>,
        challenges: Arc<dyn ChallengeStore>,
        linked: Arc<dyn LinkedIdentityStore>,
        coordinator: Arc<LoginCoordinator>,
        fetcher: Arc<OutboundFetcher>,
    ) -> Self {
        Self {
            config,
            challenges,
            linked,
            coordinator,
            fetcher,
        }
    }

    // -------------------------------------------------------------------------
    // Resolution
    // -------------------------------------------------------------------------

    /// Resolves a DID to its document.
    ///
    /// # Errors
    ///
    /// Returns `invalid_request` for unsupported methods or resolution
    /// failures.
    pub async fn resolve(&self, did: &str) -> AuthResult<serde_json::Value> {
        if let Some(encoded) = did.strip_prefix("did:key:") {
            return did_key_document(did, encoded);
        }
        if let Some(rest) = did.strip_prefix("did:web:") {
            return self.resolve_did_web(did, rest).await;
        }
        Err(AuthError::invalid_request("Unsupported DID method"))
    }

    async fn resolve_did_web(&self, did: &str, rest: &str) -> AuthResult<serde_json::Value> {
        // did:web:example.com           → https://example.com/.well-known/did.json
        // did:web:example.com:user:a    → https://example.com/user/a/did.json
        let mut segments = rest.split(':');
        let host = segments
            .next()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| AuthError::invalid_request("did:web is missing a host"))?
            .replace("%3A", ":");
        let path: Vec<&str> = segments.collect();
        let url = if path.is_empty() {
            format!("https://{host}/.well-known/did.json")
        } else {
            format!("https://{host}/{}/did.json", path.join("/"))
        };
        let url = Url::parse(&url)
            .map_err(|_| AuthError::invalid_request("did:web resolves to an invalid URL"))?;
        let body = self.fetcher.fetch_text(&url, None).await?;
        let document: serde_json::Value = serde_json::from_str(&body)
            .map_err(|_| AuthError::invalid_request("DID document is not JSON"))?;
        if document.get("id").and_then(|v| v.as_str()) != Some(did) {
            return Err(AuthError::invalid_request("DID document id mismatch"));
        }
        Ok(document)
    }

    // -------------------------------------------------------------------------
    // Authentication
    // -------------------------------------------------------------------------

    /// Starts an authentication ceremony for a DID.
    ///
    /// # Errors
    ///
    /// Returns resolution errors or an internal error if the challenge
    /// cannot be stored.
    pub async fn authentication_challenge(&self, did: &str) -> AuthResult<DidChallenge> {
        let document = self.resolve(did).await?;
        let allowed_methods = verification_method_ids(&document);
        if allowed_methods.is_empty() {
            return Err(AuthError::invalid_request(
                "DID document has no verification methods",
            ));
        }

        let nonce = fresh_nonce();
        let record = ChallengeRecord::new(
            ChallengePayload::DidAuthentication {
                did: did.to_string(),
                nonce: nonce.clone(),
            },
            self.config.ttl.challenge.as_secs() as i64,
        );
        let challenge_id = record.id.clone();
        self.challenges
            .store_challenge(record)
            .await
            .map_err(|_| AuthError::internal("challenge store failed"))?;

        Ok(DidChallenge {
            challenge_id,
            nonce,
            allowed_methods,
        })
    }

    /// Verifies a proof JWS and logs the linked user in.
    ///
    /// # Errors
    ///
    /// Challenge failures use the uniform error; proof failures use
    /// `invalid_request`.
    pub async fn authentication_verify(
        &self,
        challenge_id: &str,
        proof: &str,
        login_challenge: Option<&str>,
    ) -> AuthResult<LoginCompletion> {
        let record = self
            .challenges
            .consume_challenge(challenge_id, ChallengeKind::DidAuthentication)
            .await?;
        let ChallengePayload::DidAuthentication { did, nonce } = record.payload else {
            return Err(AuthError::InvalidChallenge);
        };

        self.verify_proof(&did, &nonce, proof).await?;

        let link = self
            .linked
            .find(DID_PROVIDER, &did)
            .await
            .map_err(|_| AuthError::internal("identity lookup failed"))?
            .ok_or(AuthError::InvalidChallenge)?;

        self.coordinator
            .establish(
                &link.user_id,
                vec!["did".to_string()],
                None,
                serde_json::Value::Object(serde_json::Map::new()),
                login_challenge,
            )
            .await
    }

    // -------------------------------------------------------------------------
    // Registration (linking)
    // -------------------------------------------------------------------------

    /// Starts a registration ceremony linking a DID to a user.
    ///
    /// # Errors
    ///
    /// Returns `invalid_request` when the DID is already linked.
    pub async fn registration_challenge(&self, did: &str, user_id: &str) -> AuthResult<DidChallenge> {
        if self
            .linked
            .find(DID_PROVIDER, did)
            .await
            .map_err(|_| AuthError::internal("identity lookup failed"))?
            .is_some()
        {
            return Err(AuthError::invalid_request("DID is already linked"));
        }
        let document = self.resolve(did).await?;
        let allowed_methods = verification_method_ids(&document);
        if allowed_methods.is_empty() {
            return Err(AuthError::invalid_request(
                "DID document has no verification methods",
            ));
        }

        let nonce = fresh_nonce();
        let record = ChallengeRecord::new(
            ChallengePayload::DidRegistration {
                did: did.to_string(),
                nonce: nonce.clone(),
                user_id: user_id.to_string(),
            },
            self.config.ttl.challenge.as_secs() as i64,
        );
        let challenge_id = record.id.clone();
        self.challenges
            .store_challenge(record)
            .await
            .map_err(|_| AuthError::internal("challenge store failed"))?;
        Ok(DidChallenge {
            challenge_id,
            nonce,
            allowed_methods,
        })
    }

    /// Completes a registration ceremony, creating the link.
    ///
    /// # Errors
    ///
    /// Challenge failures use the uniform error.
    pub async fn registration_verify(&self, challenge_id: &str, proof: &str) -> AuthResult<String> {
        let record = self
            .challenges
            .consume_challenge(challenge_id, ChallengeKind::DidRegistration)
            .await?;
        let ChallengePayload::DidRegistration { did, nonce, user_id } = record.payload else {
            return Err(AuthError::InvalidChallenge);
        };

        self.verify_proof(&did, &nonce, proof).await?;

        self.linked
            .create(LinkedIdentity {
                user_id: user_id.clone(),
                provider: DID_PROVIDER.to_string(),
                subject: did,
                created_at: now_unix(),
            })
            .await
            .map_err(|_| AuthError::internal("identity link failed"))?;
        Ok(user_id)
    }

    /// Lists a user's linked DIDs.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lookup fails.
    pub async fn list_links(&self, user_id: &str) -> AuthResult<Vec<LinkedIdentity>> {
        self.linked
            .list_for_user(user_id, DID_PROVIDER)
            .await
            .map_err(|_| AuthError::internal("identity lookup failed"))
    }

    /// Removes a DID link, verifying ownership first.
    ///
    /// # Errors
    ///
    /// Returns `invalid_request` when the DID is not linked to this user.
    pub async fn remove_link(&self, user_id: &str, did: &str) -> AuthResult<()> {
        let link = self
            .linked
            .find(DID_PROVIDER, did)
            .await
            .map_err(|_| AuthError::internal("identity lookup failed"))?;
        match link {
            Some(link) if link.user_id == user_id => {
                self.linked
                    .delete(DID_PROVIDER, did)
                    .await
                    .map_err(|_| AuthError::internal("identity unlink failed"))
            }
            _ => Err(AuthError::invalid_request("DID is not linked to this user")),
        }
    }

    // -------------------------------------------------------------------------
    // Proof verification
    // -------------------------------------------------------------------------

    async fn verify_proof(&self, did: &str, nonce: &str, proof: &str) -> AuthResult<()> {
        #[derive(serde::Deserialize)]
        struct ProofClaims {
            nonce: String,
        }

        let alg = raw_header_alg(proof)
            .map_err(|_| AuthError::invalid_request("Proof is malformed"))?;
        // ES512 is deliberately outside the allowed set: the JWS backend
        // has no P-521 support, so the key import below would fail anyway.
        if !matches!(alg.as_str(), "ES256" | "ES384" | "EdDSA") {
            return Err(AuthError::invalid_request("Proof algorithm is not allowed"));
        }

        let header = jsonwebtoken::decode_header(proof)
            .map_err(|_| AuthError::invalid_request("Proof is malformed"))?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::invalid_request("Proof header missing kid"))?;

        let document = self.resolve(did).await?;
        let jwk = find_verification_method(&document, did, &kid)
            .ok_or_else(|| AuthError::invalid_request("Unknown verification method"))?;
        let decoding_key = jwk
            .to_decoding_key()
            .map_err(|_| AuthError::invalid_request("Verification method key is unusable"))?;

        let mut validation = Validation::new(match alg.as_str() {
            "ES256" => Algorithm::ES256,
            "ES384" => Algorithm::ES384,
            _ => Algorithm::EdDSA,
        });
        validation.set_audience(&[self.config.issuer.as_str()]);
        validation.set_issuer(&[did]);
        validation.validate_exp = false;
        validation.required_spec_claims =
            ["iss", "aud"].iter().map(ToString::to_string).collect();
        let data = jsonwebtoken::decode::<ProofClaims>(proof, &decoding_key, &validation)
            .map_err(|_| AuthError::invalid_request("Proof verification failed"))?;
        if data.claims.nonce != nonce {
            return Err(AuthError::invalid_request("Proof nonce mismatch"));
        }
        Ok(())
    }
}

fn fresh_nonce() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64url_encode(bytes)
}

fn verification_method_ids(document: &serde_json::Value) -> Vec<String> {
    document
        .get("verificationMethod")
        .and_then(|v| v.as_array())
        .map(|methods| {
            methods
                .iter()
                .filter_map(|m| m.get("id").and_then(|id| id.as_str()))
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Finds a verification method by id (absolute or `#fragment`) and imports
/// its key.
fn find_verification_method(document: &serde_json::Value, did: &str, kid: &str) -> Option<Jwk> {
    let absolute = if kid.starts_with('#') {
        format!("{did}{kid}")
    } else {
        kid.to_string()
    };
    let methods = document.get("verificationMethod")?.as_array()?;
    let method = methods.iter().find(|m| {
        m.get("id")
            .and_then(|id| id.as_str())
            .is_some_and(|id| id == absolute || id == kid)
    })?;

    if let Some(jwk) = method.get("publicKeyJwk") {
        return serde_json::from_value(jwk.clone()).ok();
    }
    if let Some(multibase) = method.get("publicKeyMultibase").and_then(|v| v.as_str()) {
        return multibase_to_jwk(multibase).ok();
    }
    None
}

/// Builds the implicit DID document for a `did:key`.
fn did_key_document(did: &str, encoded: &str) -> AuthResult<serde_json::Value> {
    let jwk = multibase_to_jwk(encoded)?;
    let method_id = format!("{did}#{encoded}");
    Ok(serde_json::json!({
        "id": did,
        "verificationMethod": [{
            "id": method_id,
            "type": "JsonWebKey2020",
            "controller": did,
            "publicKeyJwk": jwk,
        }],
        "authentication": [method_id],
    }))
}

fn multibase_to_jwk(encoded: &str) -> AuthResult<Jwk> {
    let (_, bytes) = multibase::decode(encoded)
        .map_err(|_| AuthError::invalid_request("Invalid multibase key"))?;

    if bytes.len() == 34 && bytes[..2] == MULTICODEC_ED25519 {
        return Ok(Jwk {
            kty: "OKP".to_string(),
            kid: None,
            use_: Some("sig".to_string()),
            alg: Some("EdDSA".to_string()),
            n: None,
            e: None,
            crv: Some("Ed25519".to_string()),
            x: Some(base64url_encode(&bytes[2..])),
            y: None,
        });
    }
    if bytes.len() == 35 && bytes[..2] == MULTICODEC_P256 {
        let point = p256::EncodedPoint::from_bytes(&bytes[2..])
            .map_err(|_| AuthError::invalid_request("Invalid P-256 key"))?;
        let public_key = p256::PublicKey::from_encoded_point(&point);
        let public_key = Option::<p256::PublicKey>::from(public_key)
            .ok_or_else(|| AuthError::invalid_request("Invalid P-256 key"))?;
        let uncompressed = public_key.to_encoded_point(false);
        return Ok(Jwk {
            kty: "EC".to_string(),
            kid: None,
            use_: Some("sig".to_string()),
            alg: Some("ES256".to_string()),
            n: None,
            e: None,
            crv: Some("P-256".to_string()),
            x: Some(base64url_encode(uncompressed.x().ok_or_else(|| {
                AuthError::invalid_request("Invalid P-256 key")
            })?)),
            y: Some(base64url_encode(uncompressed.y().ok_or_else(|| {
                AuthError::invalid_request("Invalid P-256 key")
            })?)),
        });
    }
    Err(AuthError::invalid_request("Unsupported key multicodec"))
}
