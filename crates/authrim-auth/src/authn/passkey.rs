//! Passkey (WebAuthn) registration and authentication.
//!
//! Both ceremonies are two-step: `options` draws a random challenge and
//! parks it; `verify` consumes the challenge and checks the authenticator's
//! response against it. Supported credential algorithms are ES256 (COSE -7)
//! and RS256 (COSE -257); the `none` attestation format is accepted at
//! registration, other formats are stored without verifying the attestation
//! statement.

use std::sync::Arc;

use p256::ecdsa::signature::Verifier;
use rsa::Pkcs1v15Sign;
use sha2::{Digest, Sha256};
use url::Url;

use authrim_config::AuthrimConfig;
use authrim_core::time::now_unix;
use authrim_crypto::digest::{base64url_decode, base64url_encode};
use authrim_crypto::jwk::Jwk;
use authrim_state::{ChallengeKind, ChallengePayload, ChallengeRecord, ChallengeStore};

use crate::AuthResult;
use crate::authn::{LoginCompletion, LoginCoordinator};
use crate::error::AuthError;
use crate::storage::{PasskeyCredential, PasskeyStore};

// =============================================================================
// Minimal CBOR reader
// =============================================================================
//
// Attestation objects and COSE keys are CBOR. The subset authenticators
// emit is small: definite-length ints, byte/text strings, arrays and maps.
// Indefinite lengths and tags are rejected.

mod cbor {
    /// A decoded CBOR value.
    #[derive(Debug, Clone, PartialEq)]
    pub(super) enum Value {
        Int(i128),
        Bytes(Vec<u8>),
        Text(String),
        Array(Vec<Value>),
        Map(Vec<(Value, Value)>),
        Bool(bool),
        Null,
    }

    impl Value {
        pub(super) fn map_get_text(&self, key: &str) -> Option<&Value> {
            let Value::Map(entries) = self else { return None };
            entries
                .iter()
                .find(|(k, _)| matches!(k, Value::Text(t) if t == key))
                .map(|(_, v)| v)
        }

        pub(super) fn map_get_int(&self, key: i128) -> Option<&Value> {
            let Value::Map(entries) = self else { return None };
            entries
                .iter()
                .find(|(k, _)| matches!(k, Value::Int(i) if *i == key))
                .map(|(_, v)| v)
        }

        pub(super) fn as_bytes(&self) -> Option<&[u8]> {
            match self {
                Value::Bytes(b) => Some(b),
                _ => None,
            }
        }

        pub(super) fn as_int(&self) -> Option<i128> {
            match self {
                Value::Int(i) => Some(*i),
                _ => None,
            }
        }

        pub(super) fn as_text(&self) -> Option<&str> {
            match self {
                Value::Text(t) => Some(t),
                _ => None,
            }
        }
    }

    pub(super) fn decode(data: &[u8]) -> Option<(Value, usize)> {
        decode_at(data, 0)
    }

    fn decode_at(data: &[u8], pos: usize) -> Option<(Value, usize)> {
        let byte = *data.get(pos)?;
        let major = byte >> 5;
        let info = byte & 0x1f;
        let (length, mut pos) = decode_length(data, pos + 1, info)?;

        match major {
            0 => Some((Value::Int(length as i128), pos)),
            1 => Some((Value::Int(-1 - length as i128), pos)),
            2 => {
                let end = pos.checked_add(length as usize)?;
                let bytes = data.get(pos..end)?.to_vec();
                Some((Value::Bytes(bytes), end))
            }
            3 => {
                let end = pos.checked_add(length as usize)?;
                let text = std::str::from_utf8(data.get(pos..end)?).ok()?;
                Some((Value::Text(text.to_string()), end))
            }
            4 => {
                let mut items = Vec::new();
                for _ in 0..length {
                    let (item, next) = decode_at(data, pos)?;
                    items.push(item);
                    pos = next;
                }
                Some((Value::Array(items), pos))
            }
            5 => {
                let mut entries = Vec::new();
                for _ in 0..length {
                    let (key, next) = decode_at(data, pos)?;
                    let (value, after) = decode_at(data, next)?;
                    entries.push((key, value));
                    pos = after;
                }
                Some((Value::Map(entries), pos))
            }
            7 => match info {
                20 => Some((Value::Bool(false), pos)),
                21 => Some((Value::Bool(true), pos)),
                22 => Some((Value::Null, pos)),
                _ => None,
            },
            _ => None, // tags (6) and anything indefinite
        }
    }

    fn decode_length(data: &[u8], pos: usize, info: u8) -> Option<(u64, usize)> {
        match info {
            0..=23 => Some((u64::from(info), pos)),
            24 => Some((u64::from(*data.get(pos)?), pos + 1)),
            25 => {
                let bytes = data.get(pos..pos + 2)?;
                Some((u64::from(u16::from_be_bytes([bytes[0], bytes[1]])), pos + 2))
            }
            26 => {
                let bytes = data.get(pos..pos + 4)?;
                Some((
                    u64::from(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
                    pos + 4,
                ))
            }
            27 => {
                let bytes = data.get(pos..pos + 8)?;
                let mut array = [0u8; 8];
                array.copy_from_slice(bytes);
                Some((u64::from_be_bytes(array), pos + 8))
            }
            _ => None, // indefinite lengths
        }
    }
}

// =============================================================================
// Authenticator data
// =============================================================================

/// User-present flag.
const FLAG_UP: u8 = 0x01;
/// Attested-credential-data-included flag.
const FLAG_AT: u8 = 0x40;

struct AuthenticatorData {
    rp_id_hash: [u8; 32],
    flags: u8,
    sign_count: u32,
    credential: Option<(String, Jwk, i32)>, // (credential_id, key, cose_alg)
}

fn parse_authenticator_data(data: &[u8]) -> Result<AuthenticatorData, AuthError> {
    if data.len() < 37 {
        return Err(AuthError::invalid_request("authenticator data truncated"));
    }
    let mut rp_id_hash = [0u8; 32];
    rp_id_hash.copy_from_slice(&data[..32]);
    let flags = data[32];
    let sign_count = u32::from_be_bytes([data[33], data[34], data[35], data[36]]);

    let credential = if flags & FLAG_AT != 0 {
        if data.len() < 55 {
            return Err(AuthError::invalid_request("attested credential data truncated"));
        }
        // aaguid (16 bytes) is not used.
        let id_len = u16::from_be_bytes([data[53], data[54]]) as usize;
        let id_end = 55 + id_len;
        let id_bytes = data
            .get(55..id_end)
            .ok_or_else(|| AuthError::invalid_request("credential id truncated"))?;
        let (cose, _) = cbor::decode(&data[id_end..])
            .ok_or_else(|| AuthError::invalid_request("credential key is not CBOR"))?;
        let (jwk, alg) = cose_key_to_jwk(&cose)?;
        Some((base64url_encode(id_bytes), jwk, alg))
    } else {
        None
    };

    Ok(AuthenticatorData {
        rp_id_hash,
        flags,
        sign_count,
        credential,
    })
}

/// Converts a COSE_Key (EC2 P-256 or RSA) to a JWK.
fn cose_key_to_jwk(cose: &cbor::Value) -> Result<(Jwk, i32), AuthError> {
    let kty = cose
        .map_get_int(1)
        .and_then(cbor::Value::as_int)
        .ok_or_else(|| AuthError::invalid_request("COSE key missing kty"))?;
    let alg = cose
        .map_get_int(3)
        .and_then(cbor::Value::as_int)
        .ok_or_else(|| AuthError::invalid_request("COSE key missing alg"))? as i32;

    match (kty, alg) {
        // EC2, ES256, P-256.
        (2, -7) => {
            let crv = cose.map_get_int(-1).and_then(cbor::Value::as_int);
            if crv != Some(1) {
                return Err(AuthError::invalid_request("unsupported COSE curve"));
            }
            let x = cose
                .map_get_int(-2)
                .and_then(cbor::Value::as_bytes)
                .ok_or_else(|| AuthError::invalid_request("COSE key missing x"))?;
            let y = cose
                .map_get_int(-3)
                .and_then(cbor::Value::as_bytes)
                .ok_or_else(|| AuthError::invalid_request("COSE key missing y"))?;
            let jwk = Jwk {
                kty: "EC".to_string(),
                kid: None,
                use_: Some("sig".to_string()),
                alg: Some("ES256".to_string()),
                n: None,
                e: None,
                crv: Some("P-256".to_string()),
                x: Some(base64url_encode(x)),
                y: Some(base64url_encode(y)),
            };
            Ok((jwk, -7))
        }
        // RSA, RS256.
        (3, -257) => {
            let n = cose
                .map_get_int(-1)
                .and_then(cbor::Value::as_bytes)
                .ok_or_else(|| AuthError::invalid_request("COSE key missing n"))?;
            let e = cose
                .map_get_int(-2)
                .and_then(cbor::Value::as_bytes)
                .ok_or_else(|| AuthError::invalid_request("COSE key missing e"))?;
            let jwk = Jwk {
                kty: "RSA".to_string(),
                kid: None,
                use_: Some("sig".to_string()),
                alg: Some("RS256".to_string()),
                n: Some(base64url_encode(n)),
                e: Some(base64url_encode(e)),
                crv: None,
                x: None,
                y: None,
            };
            Ok((jwk, -257))
        }
        _ => Err(AuthError::invalid_request("unsupported COSE key algorithm")),
    }
}

// =============================================================================
// Service
// =============================================================================

/// Options returned to the browser for a ceremony.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CeremonyOptions {
    /// The challenge id; echoed back on verify.
    pub challenge_id: String,
    /// WebAuthn `publicKey` options for `navigator.credentials`.
    pub public_key: serde_json::Value,
}

/// The passkey authenticator.
pub struct PasskeyService {
    config: Arc<AuthrimConfig>,
    challenges: Arc<dyn ChallengeStore>,
    passkeys: Arc<dyn PasskeyStore>,
    coordinator: Arc<LoginCoordinator>,
}

impl PasskeyService {
    /// Creates the service.
    #[must_use]
    pub fn new(
        config: Arc<AuthrimConfig>,
        challenges: Arc<dyn ChallengeStore>,
        passkeys: Arc<dyn PasskeyStore>,
        coordinator: Arc<LoginCoordinator>,
    ) -> Self {
        Self {
            config,
            challenges,
            passkeys,
            coordinator,
        }
    }

    fn rp_id(&self) -> String {
        Url::parse(&self.config.issuer)
            .ok()
            .and_then(|u| u.host_str().map(ToString::to_string))
            .unwrap_or_default()
    }

    fn expected_origin(&self) -> String {
        self.config.issuer.trim_end_matches('/').to_string()
    }

    fn new_webauthn_challenge() -> String {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        base64url_encode(bytes)
    }

    /// Starts a registration ceremony for an authenticated user.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the challenge cannot be stored.
    pub async fn registration_options(&self, user_id: &str) -> AuthResult<CeremonyOptions> {
        let challenge = Self::new_webauthn_challenge();
        let record = ChallengeRecord::new(
            ChallengePayload::PasskeyRegistration {
                user_id: user_id.to_string(),
                challenge: challenge.clone(),
            },
            self.config.ttl.challenge.as_secs() as i64,
        );
        let challenge_id = record.id.clone();
        self.challenges
            .store_challenge(record)
            .await
            .map_err(|_| AuthError::internal("challenge store failed"))?;

        Ok(CeremonyOptions {
            challenge_id,
            public_key: serde_json::json!({
                "challenge": challenge,
                "rp": { "id": self.rp_id(), "name": "Authrim" },
                "user": { "id": base64url_encode(user_id.as_bytes()), "name": user_id, "displayName": user_id },
                "pubKeyCredParams": [
                    { "type": "public-key", "alg": -7 },
                    { "type": "public-key", "alg": -257 },
                ],
                "authenticatorSelection": { "residentKey": "preferred", "userVerification": "preferred" },
                "attestation": "none",
            }),
        })
    }

    /// Completes a registration ceremony.
    ///
    /// # Errors
    ///
    /// Returns the uniform challenge error for a bad challenge and
    /// `invalid_request` for a malformed credential.
    pub async fn registration_verify(
        &self,
        challenge_id: &str,
        credential: &serde_json::Value,
    ) -> AuthResult<PasskeyCredential> {
        let record = self
            .challenges
            .consume_challenge(challenge_id, ChallengeKind::PasskeyRegistration)
            .await?;
        let ChallengePayload::PasskeyRegistration {
            user_id,
            challenge: expected_challenge,
        } = record.payload
        else {
            return Err(AuthError::InvalidChallenge);
        };

        let client_data_b64 = credential
            .pointer("/response/clientDataJSON")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AuthError::invalid_request("missing clientDataJSON"))?;
        let client_data = base64url_decode(client_data_b64)
            .map_err(|_| AuthError::invalid_request("clientDataJSON is not base64url"))?;
        self.check_client_data(&client_data, "webauthn.create", &expected_challenge)?;

        let attestation_b64 = credential
            .pointer("/response/attestationObject")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AuthError::invalid_request("missing attestationObject"))?;
        let attestation = base64url_decode(attestation_b64)
            .map_err(|_| AuthError::invalid_request("attestationObject is not base64url"))?;
        let (attestation, _) = cbor::decode(&attestation)
            .ok_or_else(|| AuthError::invalid_request("attestationObject is not CBOR"))?;

        let fmt = attestation
            .map_get_text("fmt")
            .and_then(cbor::Value::as_text)
            .unwrap_or("none");
        if fmt != "none" {
            tracing::debug!(fmt, "accepting credential without attestation statement verification");
        }
        let auth_data_bytes = attestation
            .map_get_text("authData")
            .and_then(cbor::Value::as_bytes)
            .ok_or_else(|| AuthError::invalid_request("attestationObject missing authData"))?;
        let auth_data = parse_authenticator_data(auth_data_bytes)?;
        self.check_rp_id_hash(&auth_data)?;
        if auth_data.flags & FLAG_UP == 0 {
            return Err(AuthError::invalid_request("user presence not asserted"));
        }

        let (credential_id, public_key, cose_alg) = auth_data
            .credential
            .ok_or_else(|| AuthError::invalid_request("no attested credential data"))?;

        let stored = PasskeyCredential {
            credential_id,
            user_id,
            cose_alg,
            public_key,
            sign_count: auth_data.sign_count,
            created_at: now_unix(),
        };
        self.passkeys
            .upsert(stored.clone())
            .await
            .map_err(|_| AuthError::internal("credential store failed"))?;
        Ok(stored)
    }

    /// Starts an authentication ceremony.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the challenge cannot be stored.
    pub async fn authentication_options(
        &self,
        user_id: Option<&str>,
    ) -> AuthResult<CeremonyOptions> {
        let challenge = Self::new_webauthn_challenge();
        let record = ChallengeRecord::new(
            ChallengePayload::PasskeyAuthentication {
                user_id: user_id.map(ToString::to_string),
                challenge: challenge.clone(),
            },
            self.config.ttl.challenge.as_secs() as i64,
        );
        let challenge_id = record.id.clone();
        self.challenges
            .store_challenge(record)
            .await
            .map_err(|_| AuthError::internal("challenge store failed"))?;

        let mut public_key = serde_json::json!({
            "challenge": challenge,
            "rpId": self.rp_id(),
            "userVerification": "preferred",
        });
        if let Some(user_id) = user_id {
            let credentials = self
                .passkeys
                .list_for_user(user_id)
                .await
                .map_err(|_| AuthError::internal("credential lookup failed"))?;
            public_key["allowCredentials"] = credentials
                .iter()
                .map(|c| serde_json::json!({ "type": "public-key", "id": c.credential_id }))
                .collect();
        }
        Ok(CeremonyOptions {
            challenge_id,
            public_key,
        })
    }

    /// Completes an authentication ceremony and logs the user in.
    ///
    /// # Errors
    ///
    /// Challenge failures use the uniform error; signature failures use
    /// `invalid_request`.
    pub async fn authentication_verify(
        &self,
        challenge_id: &str,
        credential: &serde_json::Value,
        login_challenge: Option<&str>,
    ) -> AuthResult<LoginCompletion> {
        let record = self
            .challenges
            .consume_challenge(challenge_id, ChallengeKind::PasskeyAuthentication)
            .await?;
        let ChallengePayload::PasskeyAuthentication {
            user_id: expected_user,
            challenge: expected_challenge,
        } = record.payload
        else {
            return Err(AuthError::InvalidChallenge);
        };

        let credential_id = credential
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AuthError::invalid_request("missing credential id"))?;
        let stored = self
            .passkeys
            .find(credential_id)
            .await
            .map_err(|_| AuthError::internal("credential lookup failed"))?
            .ok_or(AuthError::InvalidChallenge)?;
        if let Some(expected_user) = &expected_user
            && expected_user != &stored.user_id
        {
            return Err(AuthError::InvalidChallenge);
        }

        let client_data_b64 = credential
            .pointer("/response/clientDataJSON")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AuthError::invalid_request("missing clientDataJSON"))?;
        let client_data = base64url_decode(client_data_b64)
            .map_err(|_| AuthError::invalid_request("clientDataJSON is not base64url"))?;
        self.check_client_data(&client_data, "webauthn.get", &expected_challenge)?;

        let auth_data_b64 = credential
            .pointer("/response/authenticatorData")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AuthError::invalid_request("missing authenticatorData"))?;
        let auth_data_bytes = base64url_decode(auth_data_b64)
            .map_err(|_| AuthError::invalid_request("authenticatorData is not base64url"))?;
        let auth_data = parse_authenticator_data(&auth_data_bytes)?;
        self.check_rp_id_hash(&auth_data)?;
        if auth_data.flags & FLAG_UP == 0 {
            return Err(AuthError::invalid_request("user presence not asserted"));
        }

        let signature_b64 = credential
            .pointer("/response/signature")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AuthError::invalid_request("missing signature"))?;
        let signature = base64url_decode(signature_b64)
            .map_err(|_| AuthError::invalid_request("signature is not base64url"))?;

        // Signed message: authenticatorData ‖ SHA-256(clientDataJSON).
        let mut message = auth_data_bytes.clone();
        message.extend_from_slice(&Sha256::digest(&client_data));
        verify_webauthn_signature(&stored, &message, &signature)?;

        // Clone detection: a counter that fails to advance is a replayed
        // or cloned authenticator.
        if stored.sign_count != 0 && auth_data.sign_count != 0
            && auth_data.sign_count <= stored.sign_count
        {
            return Err(AuthError::invalid_request("signature counter did not advance"));
        }
        if auth_data.sign_count != 0
            && let Err(e) = self
                .passkeys
                .update_sign_count(credential_id, auth_data.sign_count)
                .await
        {
            tracing::warn!(error = %e, "failed to update signature counter");
        }

        self.coordinator
            .establish(
                &stored.user_id,
                vec!["passkey".to_string()],
                None,
                serde_json::Value::Object(serde_json::Map::new()),
                login_challenge,
            )
            .await
    }

    fn check_client_data(
        &self,
        client_data: &[u8],
        expected_type: &str,
        expected_challenge: &str,
    ) -> AuthResult<()> {
        let parsed: serde_json::Value = serde_json::from_slice(client_data)
            .map_err(|_| AuthError::invalid_request("clientDataJSON is not JSON"))?;
        if parsed.get("type").and_then(|v| v.as_str()) != Some(expected_type) {
            return Err(AuthError::invalid_request("unexpected client data type"));
        }
        if parsed.get("challenge").and_then(|v| v.as_str()) != Some(expected_challenge) {
            return Err(AuthError::InvalidChallenge);
        }
        let origin = parsed.get("origin").and_then(|v| v.as_str()).unwrap_or("");
        if origin.trim_end_matches('/') != self.expected_origin() {
            return Err(AuthError::invalid_request("unexpected origin"));
        }
        Ok(())
    }

    fn check_rp_id_hash(&self, auth_data: &AuthenticatorData) -> AuthResult<()> {
        let expected: [u8; 32] = Sha256::digest(self.rp_id().as_bytes()).into();
        if auth_data.rp_id_hash != expected {
            return Err(AuthError::invalid_request("rpIdHash mismatch"));
        }
        Ok(())
    }
}

fn verify_webauthn_signature(
    credential: &PasskeyCredential,
    message: &[u8],
    signature: &[u8],
) -> AuthResult<()> {
    match credential.cose_alg {
        -7 => {
            let x = credential
                .public_key
                .x
                .as_deref()
                .ok_or_else(|| AuthError::internal("stored key missing x"))?;
            let y = credential
                .public_key
                .y
                .as_deref()
                .ok_or_else(|| AuthError::internal("stored key missing y"))?;
            let mut point = vec![0x04];
            point.extend_from_slice(&base64url_decode(x)?);
            point.extend_from_slice(&base64url_decode(y)?);
            let verifying_key = p256::ecdsa::VerifyingKey::from_sec1_bytes(&point)
                .map_err(|_| AuthError::internal("stored key is invalid"))?;
            let signature = p256::ecdsa::Signature::from_der(signature)
                .map_err(|_| AuthError::invalid_request("signature is not DER"))?;
            verifying_key
                .verify(message, &signature)
                .map_err(|_| AuthError::invalid_request("signature verification failed"))
        }
        -257 => {
            let n = credential
                .public_key
                .n
                .as_deref()
                .ok_or_else(|| AuthError::internal("stored key missing n"))?;
            let e = credential
                .public_key
                .e
                .as_deref()
                .ok_or_else(|| AuthError::internal("stored key missing e"))?;
            let public_key = rsa::RsaPublicKey::new(
                rsa::BigUint::from_bytes_be(&base64url_decode(n)?),
                rsa::BigUint::from_bytes_be(&base64url_decode(e)?),
            )
            .map_err(|_| AuthError::internal("stored key is invalid"))?;
            let hashed = Sha256::digest(message);
            public_key
                .verify(Pkcs1v15Sign::new::<Sha256>(), &hashed, signature)
                .map_err(|_| AuthError::invalid_request("signature verification failed"))
        }
        _ => Err(AuthError::internal("unsupported stored key algorithm")),
    }
}
