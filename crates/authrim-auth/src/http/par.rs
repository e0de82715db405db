//! The pushed authorization request endpoint (RFC 9126).

use std::collections::BTreeMap;

use axum::Form;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use authrim_core::time::now_unix;
use authrim_state::ParRecord;

use crate::error::AuthError;
use crate::http::AppState;
use crate::http::authorize::json_error;
use crate::token::dpop::validate_dpop_proof;
use crate::token::endpoint::TokenRequest;

/// Parameters that authenticate the client rather than describe the
/// authorization request; they never enter the stored snapshot.
const AUTH_PARAMS: &[&str] = &[
    "client_secret",
    "client_assertion",
    "client_assertion_type",
];

/// POST `/par`.
pub async fn par_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Form(params): Form<BTreeMap<String, String>>,
) -> Response {
    match handle(&state, headers, params).await {
        Ok(body) => (StatusCode::CREATED, axum::Json(body)).into_response(),
        Err(error) => json_error(&error),
    }
}

async fn handle(
    state: &AppState,
    headers: HeaderMap,
    params: BTreeMap<String, String>,
) -> Result<serde_json::Value, AuthError> {
    // request_uri must not be pushed.
    if params.contains_key("request_uri") {
        return Err(AuthError::invalid_request(
            "request_uri must not be used at the PAR endpoint",
        ));
    }

    // Client authentication, exactly as at the token endpoint.
    let auth_request = TokenRequest {
        grant_type: String::new(),
        client_id: params.get("client_id").cloned(),
        client_secret: params.get("client_secret").cloned(),
        client_assertion: params.get("client_assertion").cloned(),
        client_assertion_type: params.get("client_assertion_type").cloned(),
        ..TokenRequest::default()
    };
    let client = state.tokens.authenticate(&auth_request).await?;

    let bucket = state.config.rate_limits.bucket("par");
    let decision = state
        .rate_limiter
        .increment("par", &client.client_id, bucket)
        .await
        .map_err(|_| AuthError::internal("rate limiter unavailable"))?;
    if !decision.allowed {
        return Err(AuthError::RateLimited {
            retry_after: decision.retry_after,
        });
    }

    // DPoP at push time binds the eventual code to the proof key.
    let dpop_jkt = match headers.get("dpop").and_then(|v| v.to_str().ok()) {
        Some(proof) => Some(
            validate_dpop_proof(
                proof,
                "POST",
                &format!("{}/par", state.config.issuer),
                None,
                &state.dpop_jti,
                state.config.ttl.dpop_proof_max_age.as_secs() as i64,
            )
            .await?
            .jkt,
        ),
        None => None,
    };

    // Strip client-auth material, then keep the parameter snapshot
    // verbatim; the authorize entry re-runs full validation on consume.
    let mut stored: BTreeMap<String, String> = params;
    for key in AUTH_PARAMS {
        stored.remove(*key);
    }
    if stored.get("client_id").is_none() {
        stored.insert("client_id".to_string(), client.client_id.clone());
    }
    if stored.get("client_id").map(String::as_str) != Some(client.client_id.as_str()) {
        return Err(AuthError::invalid_request(
            "client_id does not match the authenticated client",
        ));
    }

    let ttl = state.config.par_ttl();
    let uri = state.router.new_par_uri();
    let record = ParRecord {
        client_id: client.client_id.clone(),
        params: stored,
        dpop_jkt,
        created_at: now_unix(),
        expires_at: now_unix() + ttl.as_secs() as i64,
    };
    state
        .par_requests
        .store_request(&uri, record)
        .await
        .map_err(|_| AuthError::internal("PAR store failed"))?;

    tracing::debug!(client_id = %client.client_id, "stored pushed authorization request");
    Ok(serde_json::json!({
        "request_uri": uri.to_string(),
        "expires_in": ttl.as_secs(),
    }))
}
