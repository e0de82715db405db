//! DPoP proof validation (RFC 9449).
//!
//! A proof is a JWS carrying its own public key in the header. Validation:
//!
//! - header `typ` is `dpop+jwt`, `alg` is asymmetric (never `none`)
//! - the signature verifies with the embedded key
//! - `htm` equals the request method, `htu` the canonicalized request URL
//! - `iat` is within the freshness window of server time
//! - `jti` is unseen for this key thumbprint (replay store)
//! - `ath` equals `base64url(SHA-256(access_token))` when bound to one

use std::sync::Arc;

use jsonwebtoken::{Algorithm, Validation};
use url::Url;

use authrim_core::time::now_unix;
use authrim_crypto::digest::{base64url_decode, base64url_encode, sha256};
use authrim_crypto::jwk::Jwk;
use authrim_state::DpopJtiStore;

use crate::error::AuthError;

/// Algorithms accepted on DPoP proofs.
const DPOP_ALGS: &[Algorithm] = &[
    Algorithm::ES256,
    Algorithm::ES384,
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::EdDSA,
];

/// The result of a validated proof.
#[derive(Debug, Clone)]
pub struct DpopValidation {
    /// RFC 7638 thumbprint of the proof key: the binding value (`jkt`).
    pub jkt: String,
}

#[derive(serde::Deserialize)]
struct DpopClaims {
    jti: String,
    htm: String,
    htu: String,
    iat: i64,
    #[serde(default)]
    ath: Option<String>,
}

/// Canonicalizes a URL for the `htu` comparison: scheme + authority + path,
/// no query or fragment, lowercased scheme/host, default ports stripped.
fn canonical_htu(url: &Url) -> String {
    let mut canonical = format!("{}://", url.scheme());
    if let Some(host) = url.host_str() {
        canonical.push_str(&host.to_ascii_lowercase());
    }
    if let Some(port) = url.port() {
        canonical.push_str(&format!(":{port}"));
    }
    canonical.push_str(url.path());
    canonical
}

/// Validates a DPoP proof against the request it accompanies.
///
/// `access_token` is supplied at resource/token-endpoint use, where the
/// proof must bind to the presented token via `ath`.
///
/// # Errors
///
/// Returns `InvalidDpop` describing the failed check.
pub async fn validate_dpop_proof(
    proof: &str,
    method: &str,
    request_url: &str,
    access_token: Option<&str>,
    jti_store: &Arc<dyn DpopJtiStore>,
    max_age_secs: i64,
) -> Result<DpopValidation, AuthError> {
    // Parse the raw header ourselves: the embedded key is our trust root.
    let header_b64 = proof
        .split('.')
        .next()
        .ok_or_else(|| AuthError::invalid_dpop("Malformed proof"))?;
    let header: serde_json::Value = serde_json::from_slice(
        &base64url_decode(header_b64).map_err(|_| AuthError::invalid_dpop("Malformed proof header"))?,
    )
    .map_err(|_| AuthError::invalid_dpop("Malformed proof header"))?;

    if header.get("typ").and_then(|v| v.as_str()) != Some("dpop+jwt") {
        return Err(AuthError::invalid_dpop("Proof typ must be dpop+jwt"));
    }
    let alg = header
        .get("alg")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AuthError::invalid_dpop("Proof header missing alg"))?;
    if alg.eq_ignore_ascii_case("none") {
        return Err(AuthError::invalid_dpop("Proof alg must not be none"));
    }
    let jwk: Jwk = serde_json::from_value(
        header
            .get("jwk")
            .cloned()
            .ok_or_else(|| AuthError::invalid_dpop("Proof header missing jwk"))?,
    )
    .map_err(|_| AuthError::invalid_dpop("Proof jwk is malformed"))?;

    let decoding_key = jwk
        .to_decoding_key()
        .map_err(|_| AuthError::invalid_dpop("Proof jwk is unusable"))?;
    let mut validation = Validation::new(Algorithm::ES256);
    validation.algorithms = DPOP_ALGS.to_vec();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    let data = jsonwebtoken::decode::<DpopClaims>(proof, &decoding_key, &validation)
        .map_err(|e| { eprintln!("DPOP DEBUG: {e:?}"); AuthError::invalid_dpop("Proof signature verification failed") })?;
    let claims = data.claims;

    // htm / htu
    if !claims.htm.eq_ignore_ascii_case(method) {
        return Err(AuthError::invalid_dpop("Proof htm does not match the request"));
    }
    let request_url = Url::parse(request_url)
        .map_err(|_| AuthError::invalid_dpop("Request URL is malformed"))?;
    let proof_url = Url::parse(&claims.htu)
        .map_err(|_| AuthError::invalid_dpop("Proof htu is malformed"))?;
    if canonical_htu(&proof_url) != canonical_htu(&request_url) {
        return Err(AuthError::invalid_dpop("Proof htu does not match the request"));
    }

    // Freshness window.
    let now = now_unix();
    if (now - claims.iat).abs() > max_age_secs {
        return Err(AuthError::invalid_dpop("Proof iat is outside the freshness window"));
    }

    // Access-token binding.
    if let Some(token) = access_token {
        let expected = base64url_encode(sha256(token.as_bytes()));
        if claims.ath.as_deref() != Some(expected.as_str()) {
            return Err(AuthError::invalid_dpop("Proof ath does not match the access token"));
        }
    }

    // Replay.
    let jkt = jwk
        .thumbprint()
        .map_err(|_| AuthError::invalid_dpop("Proof jwk has no thumbprint"))?;
    let first_use = jti_store
        .mark_used(&jkt, &claims.jti, max_age_secs)
        .await
        .map_err(|_| AuthError::internal("jti store unavailable"))?;
    if !first_use {
        return Err(AuthError::invalid_dpop("Proof jti was already used"));
    }

    Ok(DpopValidation { jkt })
}

#[cfg(test)]
mod tests {
    use super::*;
    use authrim_state::InMemoryDpopJtiStore;
    use p256::ecdsa::SigningKey;
    use rand::rngs::OsRng;

    struct ProofKey {
        signing_key: SigningKey,
        jwk: Jwk,
    }

    fn proof_key() -> ProofKey {
        let signing_key = SigningKey::random(&mut OsRng);
        let point = signing_key.verifying_key().to_encoded_point(false);
        let jwk = Jwk {
            kty: "EC".to_string(),
            kid: None,
            use_: None,
            alg: Some("ES256".to_string()),
            n: None,
            e: None,
            crv: Some("P-256".to_string()),
            x: Some(base64url_encode(point.x().unwrap())),
            y: Some(base64url_encode(point.y().unwrap())),
        };
        ProofKey { signing_key, jwk }
    }

    /// Builds the compact form by hand so the jwk lands in the header. The
    /// ES256 JOSE signature is the fixed-width `r ‖ s` form.
    fn sign_compact(key: &ProofKey, header: &serde_json::Value, claims: &serde_json::Value) -> String {
        use p256::ecdsa::signature::Signer;
        let header_b64 = base64url_encode(serde_json::to_vec(header).unwrap());
        let payload_b64 = base64url_encode(serde_json::to_vec(claims).unwrap());
        let signing_input = format!("{header_b64}.{payload_b64}");
        let signature: p256::ecdsa::Signature = key.signing_key.sign(signing_input.as_bytes());
        format!("{signing_input}.{}", base64url_encode(signature.to_bytes()))
    }

    fn make_proof(key: &ProofKey, claims: serde_json::Value) -> String {
        let header = serde_json::json!({
            "typ": "dpop+jwt",
            "alg": "ES256",
            "jwk": key.jwk,
        });
        sign_compact(key, &header, &claims)
    }

    fn store() -> Arc<dyn DpopJtiStore> {
        Arc::new(InMemoryDpopJtiStore::new())
    }

    fn base_claims() -> serde_json::Value {
        serde_json::json!({
            "jti": uuid::Uuid::new_v4().to_string(),
            "htm": "POST",
            "htu": "https://issuer.example/token",
            "iat": now_unix(),
        })
    }

    #[tokio::test]
    async fn test_valid_proof_yields_thumbprint() {
        let key = proof_key();
        let proof = make_proof(&key, base_claims());
        let result = validate_dpop_proof(
            &proof,
            "POST",
            "https://issuer.example/token",
            None,
            &store(),
            60,
        )
        .await
        .unwrap();
        assert_eq!(result.jkt, key.jwk.thumbprint().unwrap());
    }

    #[tokio::test]
    async fn test_htu_ignores_query_and_default_port() {
        let key = proof_key();
        let proof = make_proof(&key, base_claims());
        let result = validate_dpop_proof(
            &proof,
            "POST",
            "https://issuer.example:443/token?grant_type=authorization_code",
            None,
            &store(),
            60,
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wrong_method_rejected() {
        let key = proof_key();
        let proof = make_proof(&key, base_claims());
        let result = validate_dpop_proof(
            &proof,
            "GET",
            "https://issuer.example/token",
            None,
            &store(),
            60,
        )
        .await;
        assert!(matches!(result.unwrap_err(), AuthError::InvalidDpop { .. }));
    }

    #[tokio::test]
    async fn test_stale_iat_rejected() {
        let key = proof_key();
        let mut claims = base_claims();
        claims["iat"] = serde_json::json!(now_unix() - 120);
        let proof = make_proof(&key, claims);
        let result = validate_dpop_proof(
            &proof,
            "POST",
            "https://issuer.example/token",
            None,
            &store(),
            60,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_jti_replay_rejected() {
        let key = proof_key();
        let claims = base_claims();
        let proof = make_proof(&key, claims);
        let store = store();

        assert!(
            validate_dpop_proof(&proof, "POST", "https://issuer.example/token", None, &store, 60)
                .await
                .is_ok()
        );
        let replay =
            validate_dpop_proof(&proof, "POST", "https://issuer.example/token", None, &store, 60)
                .await;
        assert!(matches!(replay.unwrap_err(), AuthError::InvalidDpop { .. }));
    }

    #[tokio::test]
    async fn test_ath_binding() {
        let key = proof_key();
        let token = "the-access-token";
        let mut claims = base_claims();
        claims["ath"] = serde_json::json!(base64url_encode(sha256(token.as_bytes())));
        let proof = make_proof(&key, claims);

        assert!(
            validate_dpop_proof(
                &proof,
                "POST",
                "https://issuer.example/token",
                Some(token),
                &store(),
                60,
            )
            .await
            .is_ok()
        );

        // Same proof shape, different token: must fail.
        let mut claims = base_claims();
        claims["ath"] = serde_json::json!(base64url_encode(sha256(b"other-token")));
        let proof = make_proof(&key, claims);
        assert!(
            validate_dpop_proof(
                &proof,
                "POST",
                "https://issuer.example/token",
                Some(token),
                &store(),
                60,
            )
            .await
            .is_err()
        );
    }

    #[tokio::test]
    async fn test_missing_typ_rejected() {
        let key = proof_key();
        let header = serde_json::json!({ "alg": "ES256", "jwk": key.jwk });
        let proof = sign_compact(&key, &header, &base_claims());

        let result = validate_dpop_proof(
            &proof,
            "POST",
            "https://issuer.example/token",
            None,
            &store(),
            60,
        )
        .await;
        assert!(result.is_err());
    }
}
