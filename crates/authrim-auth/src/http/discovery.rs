//! Discovery, JWKS and UserInfo endpoints.

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{Algorithm, Validation};

use crate::error::AuthError;
use crate::http::AppState;
use crate::http::authorize::json_error;
use crate::types::UserInfo;

/// GET `/.well-known/openid-configuration`.
pub async fn openid_configuration(State(state): State<AppState>) -> Response {
    let issuer = &state.config.issuer;
    Json(serde_json::json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{issuer}/authorize"),
        "pushed_authorization_request_endpoint": format!("{issuer}/par"),
        "token_endpoint": format!("{issuer}/token"),
        "userinfo_endpoint": format!("{issuer}/userinfo"),
        "jwks_uri": format!("{issuer}/jwks"),
        "end_session_endpoint": format!("{issuer}/logout"),
        "check_session_iframe": format!("{issuer}/session/check"),
        "response_types_supported": [
            "code", "id_token", "token",
            "code id_token", "code token", "id_token token",
            "code id_token token", "none",
        ],
        "response_modes_supported": [
            "query", "fragment", "form_post",
            "query.jwt", "fragment.jwt", "form_post.jwt", "jwt",
        ],
        "grant_types_supported": [
            "authorization_code",
            "urn:ietf:params:oauth:grant-type:token-exchange",
        ],
        "subject_types_supported": ["public"],
        "id_token_signing_alg_values_supported": [state.config.signing.algorithm],
        "token_endpoint_auth_methods_supported": [
            "none", "client_secret_post", "client_secret_basic", "private_key_jwt",
        ],
        "code_challenge_methods_supported": ["S256"],
        "request_parameter_supported": true,
        "request_uri_parameter_supported": state.config.features.request_uri_https_enabled,
        "require_pushed_authorization_requests": state.config.features.fapi2,
        "authorization_details_types_supported": state.config.features.rar_allowed_types,
        "dpop_signing_alg_values_supported": ["ES256", "ES384", "RS256", "RS384", "RS512", "EdDSA"],
        "frontchannel_logout_supported": true,
        "backchannel_logout_supported": true,
        "scopes_supported": ["openid", "profile", "email", "phone", "address"],
        "claims_supported": [
            "sub", "iss", "aud", "exp", "iat", "auth_time", "nonce", "acr", "amr", "sid",
            "email", "email_verified", "name", "given_name", "family_name",
            "preferred_username", "picture", "phone_number", "address",
        ],
    }))
    .into_response()
}

/// GET `/jwks`.
pub async fn jwks_handler(State(state): State<AppState>) -> Response {
    let keys = state.key_manager.get_all_public_keys().await;
    Json(serde_json::json!({ "keys": keys })).into_response()
}

/// GET/POST `/userinfo`.
pub async fn userinfo_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match userinfo(&state, &headers).await {
        Ok(info) => Json(info).into_response(),
        Err(error) => json_error(&error),
    }
}

async fn userinfo(state: &AppState, headers: &HeaderMap) -> Result<UserInfo, AuthError> {
    #[derive(serde::Deserialize)]
    struct AccessClaims {
        sub: String,
        scope: String,
    }

    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("DPoP ")))
        .ok_or_else(|| AuthError::client_auth("missing access token"))?;

    let jwks = state.key_manager.verification_jwks().await;
    let mut validation = Validation::new(Algorithm::RS256);
    validation.algorithms = vec![Algorithm::RS256, Algorithm::RS384, Algorithm::RS512];
    validation.validate_aud = false;
    validation.set_issuer(&[state.config.issuer.as_str()]);
    let data = authrim_crypto::verify_with_jwks::<AccessClaims>(token, &jwks, &validation)
        .map_err(|_| AuthError::client_auth("invalid access token"))?;

    let core = state
        .users
        .find_core(&data.claims.sub)
        .await
        .map_err(|_| AuthError::internal("user lookup failed"))?
        .ok_or_else(|| AuthError::client_auth("unknown subject"))?;
    let pii = state
        .users
        .find_pii(&data.claims.sub)
        .await
        .map_err(|_| AuthError::internal("user lookup failed"))?
        .unwrap_or_default();

    Ok(UserInfo::from_scope(&core, &pii, &data.claims.scope))
}
