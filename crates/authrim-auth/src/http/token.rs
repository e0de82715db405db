//! The token endpoint.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STD;

use crate::http::AppState;
use crate::http::authorize::json_error;
use crate::token::endpoint::TokenRequest;

/// POST `/token`.
///
/// The body is parsed by hand: `resource` and `audience` may repeat, which
/// the form extractor cannot gather.
pub async fn token_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let mut request = parse_token_request(&body);

    // client_secret_basic arrives in the Authorization header.
    if request.client_id.is_none()
        && let Some((client_id, client_secret)) = basic_credentials(&headers)
    {
        request.client_id = Some(client_id);
        request.client_secret = Some(client_secret);
    }

    let dpop_proof = headers
        .get("dpop")
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);
    let endpoint_url = format!("{}/token", state.config.issuer);

    match state
        .tokens
        .handle(request, dpop_proof.as_deref(), &endpoint_url)
        .await
    {
        Ok(response) => axum::Json(response).into_response(),
        Err(error) => json_error(&error),
    }
}

fn parse_token_request(body: &str) -> TokenRequest {
    let mut request = TokenRequest::default();
    for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
        let value = value.into_owned();
        match key.as_ref() {
            "grant_type" => request.grant_type = value,
            "code" => request.code = Some(value),
            "redirect_uri" => request.redirect_uri = Some(value),
            "code_verifier" => request.code_verifier = Some(value),
            "client_id" => request.client_id = Some(value),
            "client_secret" => request.client_secret = Some(value),
            "client_assertion" => request.client_assertion = Some(value),
            "client_assertion_type" => request.client_assertion_type = Some(value),
            "subject_token" => request.subject_token = Some(value),
            "subject_token_type" => request.subject_token_type = Some(value),
            "actor_token" => request.actor_token = Some(value),
            "actor_token_type" => request.actor_token_type = Some(value),
            "scope" => request.scope = Some(value),
            "resource" => request.resource.push(value),
            "audience" => request.audience.push(value),
            _ => {}
        }
    }
    request
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = BASE64_STD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (client_id, client_secret) = decoded.split_once(':')?;
    Some((client_id.to_string(), client_secret.to_string()))
}
