//! JWT-secured authorization requests (RFC 9101).
//!
//! A `request` parameter carries the authorization parameters as JWT
//! claims. The object may arrive encrypted (JWE to the server key); after
//! decryption the JWS is verified against the client's registered keys.
//! `alg=none` is rejected unless the deployment explicitly allows unsigned
//! objects (a non-production escape hatch, off by default).

use std::collections::BTreeMap;
use std::sync::Arc;

use jsonwebtoken::{Algorithm, Validation};
use url::Url;

use authrim_crypto::{is_jwe_compact, raw_header_alg, verify_with_jwks};
use authrim_state::KeyManager;

use crate::error::AuthError;
use crate::request::fetch::OutboundFetcher;
use crate::types::Client;

/// Algorithms accepted on request objects.
const REQUEST_OBJECT_ALGS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::ES256,
    Algorithm::ES384,
    Algorithm::EdDSA,
];

/// Verifies a request object and returns its claims as a parameter map.
///
/// Enforced claims: `iss` must equal the client id, `aud` must equal the
/// issuer URL. The standard JWT members (`iss`, `aud`, `exp`, `iat`, `nbf`,
/// `jti`) are stripped from the returned map; everything else overrides the
/// query parameters.
///
/// # Errors
///
/// Returns `InvalidRequestObject` for every verification failure.
pub async fn process_request_object(
    request_jwt: &str,
    client: &Arc<Client>,
    issuer: &str,
    allow_unsigned: bool,
    key_manager: &KeyManager,
    fetcher: &OutboundFetcher,
) -> Result<BTreeMap<String, String>, AuthError> {
    // JWE layer first: decrypt with the server's active key.
    let jws = if is_jwe_compact(request_jwt) {
        let active = key_manager
            .get_active_key()
            .await
            .map_err(|_| AuthError::internal("signing key unavailable"))?;
        let plaintext =
            authrim_crypto::decrypt_compact(request_jwt, active.key_pair.rsa_private_key())
                .map_err(|_| {
                    AuthError::invalid_request_object("Request object decryption failed")
                })?;
        String::from_utf8(plaintext)
            .map_err(|_| AuthError::invalid_request_object("Request object is not UTF-8"))?
    } else {
        request_jwt.to_string()
    };

    let alg = raw_header_alg(&jws)
        .map_err(|_| AuthError::invalid_request_object("Malformed request object header"))?;

    let claims: serde_json::Value = if alg.eq_ignore_ascii_case("none") {
        if !allow_unsigned {
            return Err(AuthError::invalid_request_object(
                "Unsigned request objects are not accepted",
            ));
        }
        tracing::warn!(client_id = %client.client_id, "accepting unsigned request object");
        decode_unverified_payload(&jws)?
    } else {
        let jwks = client_jwks(client, fetcher).await?;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.algorithms = REQUEST_OBJECT_ALGS.to_vec();
        validation.set_audience(&[issuer]);
        validation.set_issuer(&[client.client_id.as_str()]);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        let data = verify_with_jwks::<serde_json::Value>(&jws, &jwks, &validation)
            .map_err(|_| AuthError::invalid_request_object("Request object verification failed"))?;
        data.claims
    };

    let object = claims
        .as_object()
        .ok_or_else(|| AuthError::invalid_request_object("Request object payload must be a JSON object"))?;

    // iss/aud are enforced above for the signed path; re-check here so the
    // unsigned escape hatch gets the same claim discipline.
    let iss = object.get("iss").and_then(|v| v.as_str());
    if iss.is_some_and(|iss| iss != client.client_id) {
        return Err(AuthError::invalid_request_object(
            "Request object iss must equal client_id",
        ));
    }
    if let Some(aud) = object.get("aud") {
        let matches = match aud {
            serde_json::Value::String(aud) => aud == issuer,
            serde_json::Value::Array(values) => {
                values.iter().any(|v| v.as_str() == Some(issuer))
            }
            _ => false,
        };
        if !matches {
            return Err(AuthError::invalid_request_object(
                "Request object aud must equal the issuer",
            ));
        }
    }

    let mut params = BTreeMap::new();
    for (key, value) in object {
        if matches!(key.as_str(), "iss" | "aud" | "exp" | "iat" | "nbf" | "jti") {
            continue;
        }
        let value = match value {
            serde_json::Value::String(s) => s.clone(),
            // Structured members (claims, authorization_details) pass
            // through as JSON text, matching their query-string form.
            other => other.to_string(),
        };
        params.insert(key.clone(), value);
    }

    // The request object must pin its own redirect_uri.
    if !params.contains_key("redirect_uri") {
        return Err(AuthError::invalid_request_object(
            "Request object must contain redirect_uri",
        ));
    }

    Ok(params)
}

/// Resolves the client's verification keys: inline JWKS, or the registered
/// `jwks_uri` fetched through the SSRF guard.
pub(crate) async fn client_jwks(
    client: &Arc<Client>,
    fetcher: &OutboundFetcher,
) -> Result<authrim_crypto::Jwks, AuthError> {
    if let Some(jwks) = &client.jwks {
        return Ok(jwks.clone());
    }
    if let Some(jwks_uri) = &client.jwks_uri {
        let url = Url::parse(jwks_uri)
            .map_err(|_| AuthError::invalid_request_object("Client jwks_uri is malformed"))?;
        fetcher.guard_url(&url, None)?;
        return fetcher.fetch_jwks(&url).await;
    }
    Err(AuthError::invalid_request_object(
        "Client has no registered keys",
    ))
}

fn decode_unverified_payload(jws: &str) -> Result<serde_json::Value, AuthError> {
    let payload_b64 = jws
        .split('.')
        .nth(1)
        .ok_or_else(|| AuthError::invalid_request_object("Malformed request object"))?;
    let payload = authrim_crypto::base64url_decode(payload_b64)
        .map_err(|_| AuthError::invalid_request_object("Malformed request object payload"))?;
    serde_json::from_slice(&payload)
        .map_err(|_| AuthError::invalid_request_object("Request object payload is not JSON"))
}
