//! Alternative-authenticator HTTP handlers: passkeys, email codes, DIDs.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use serde::Deserialize;

use authrim_core::id::SessionId;

use crate::authn::LoginCompletion;
use crate::error::AuthError;
use crate::http::AppState;
use crate::http::authorize::json_error;

/// Resolves the authenticated user from the session cookie.
async fn session_user(state: &AppState, jar: &CookieJar) -> Result<String, AuthError> {
    let cookie = jar
        .get(&state.config.cookies.session_cookie)
        .map(|c| c.value().to_string())
        .ok_or_else(|| AuthError::client_auth("authentication required"))?;
    let session_id = SessionId::parse(&cookie)
        .map_err(|_| AuthError::client_auth("authentication required"))?;
    let session = state
        .sessions
        .get_session(&session_id)
        .await
        .map_err(|_| AuthError::internal("session lookup failed"))?
        .ok_or_else(|| AuthError::client_auth("authentication required"))?;
    Ok(session.user_id)
}

/// Serializes a login completion: sets the session cookie and reports the
/// resume URL when the login belongs to a parked authorization request.
fn completion_response(state: &AppState, jar: CookieJar, completion: LoginCompletion) -> Response {
    let jar = match &completion.session_id {
        Some(session_id) => jar.add(state.session_cookie(session_id.to_string())),
        None => jar,
    };
    let body = serde_json::json!({
        "verified": true,
        "resume_url": completion.resume_url,
    });
    (jar, Json(body)).into_response()
}

async fn rate_limit(state: &AppState, bucket: &str, key: &str) -> Result<(), AuthError> {
    let params = state.config.rate_limits.bucket(bucket);
    let decision = state
        .rate_limiter
        .increment(bucket, key, params)
        .await
        .map_err(|_| AuthError::internal("rate limiter unavailable"))?;
    if !decision.allowed {
        return Err(AuthError::RateLimited {
            retry_after: decision.retry_after,
        });
    }
    Ok(())
}

// =============================================================================
// Passkeys
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct PasskeyVerifyBody {
    challenge_id: String,
    credential: serde_json::Value,
    #[serde(default)]
    login_challenge: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PasskeyLoginOptionsBody {
    #[serde(default)]
    user_id: Option<String>,
}

/// POST `/api/auth/passkeys/register/options`.
pub async fn passkey_register_options(State(state): State<AppState>, jar: CookieJar) -> Response {
    let user_id = match session_user(&state, &jar).await {
        Ok(user_id) => user_id,
        Err(error) => return json_error(&error),
    };
    if let Err(error) = rate_limit(&state, "passkey", &user_id).await {
        return json_error(&error);
    }
    match state.passkeys.registration_options(&user_id).await {
        Ok(options) => Json(options).into_response(),
        Err(error) => json_error(&error),
    }
}

/// POST `/api/auth/passkeys/register/verify`.
pub async fn passkey_register_verify(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(body): Json<PasskeyVerifyBody>,
) -> Response {
    if let Err(error) = session_user(&state, &jar).await {
        return json_error(&error);
    }
    match state
        .passkeys
        .registration_verify(&body.challenge_id, &body.credential)
        .await
    {
        Ok(credential) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "credential_id": credential.credential_id })),
        )
            .into_response(),
        Err(error) => json_error(&error),
    }
}

/// POST `/api/auth/passkeys/login/options`.
pub async fn passkey_login_options(
    State(state): State<AppState>,
    body: Option<Json<PasskeyLoginOptionsBody>>,
) -> Response {
    let user_id = body.and_then(|Json(b)| b.user_id);
    if let Err(error) = rate_limit(
        &state,
        "passkey",
        user_id.as_deref().unwrap_or("anonymous"),
    )
    .await
    {
        return json_error(&error);
    }
    match state.passkeys.authentication_options(user_id.as_deref()).await {
        Ok(options) => Json(options).into_response(),
        Err(error) => json_error(&error),
    }
}

/// POST `/api/auth/passkeys/login/verify`.
pub async fn passkey_login_verify(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(body): Json<PasskeyVerifyBody>,
) -> Response {
    match state
        .passkeys
        .authentication_verify(
            &body.challenge_id,
            &body.credential,
            body.login_challenge.as_deref(),
        )
        .await
    {
        Ok(completion) => completion_response(&state, jar, completion),
        Err(error) => json_error(&error),
    }
}

// =============================================================================
// Email codes
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct EmailSendBody {
    email: String,
}

#[derive(Debug, Deserialize)]
pub struct EmailVerifyBody {
    email: String,
    code: String,
    #[serde(default)]
    login_challenge: Option<String>,
}

/// POST `/api/auth/email-codes/send`.
pub async fn email_code_send(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(body): Json<EmailSendBody>,
) -> Response {
    match state.email_otp.send(&body.email).await {
        Ok(result) => {
            let jar = jar.add(state.otp_cookie(result.otp_session));
            (jar, Json(serde_json::json!({ "sent": true }))).into_response()
        }
        Err(error) => json_error(&error),
    }
}

/// POST `/api/auth/email-codes/verify`.
pub async fn email_code_verify(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(body): Json<EmailVerifyBody>,
) -> Response {
    let Some(otp_session) = jar
        .get(&state.config.cookies.otp_session_cookie)
        .map(|c| c.value().to_string())
    else {
        return json_error(&AuthError::InvalidChallenge);
    };
    match state
        .email_otp
        .verify(
            &otp_session,
            &body.email,
            &body.code,
            body.login_challenge.as_deref(),
        )
        .await
    {
        Ok(completion) => {
            // The binding cookie is spent either way.
            let jar = jar.remove(state.otp_cookie(String::new()));
            let jar = match &completion.session_id {
                Some(session_id) => jar.add(state.session_cookie(session_id.to_string())),
                None => jar,
            };
            let body = serde_json::json!({
                "verified": true,
                "resume_url": completion.resume_url,
            });
            (jar, Json(body)).into_response()
        }
        Err(error) => json_error(&error),
    }
}

// =============================================================================
// DIDs
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct DidChallengeBody {
    did: String,
}

#[derive(Debug, Deserialize)]
pub struct DidVerifyBody {
    challenge_id: String,
    proof: String,
    #[serde(default)]
    login_challenge: Option<String>,
}

/// POST `/api/auth/dids/challenge`.
pub async fn did_challenge(
    State(state): State<AppState>,
    Json(body): Json<DidChallengeBody>,
) -> Response {
    if let Err(error) = rate_limit(&state, "did", &body.did).await {
        return json_error(&error);
    }
    match state.dids.authentication_challenge(&body.did).await {
        Ok(challenge) => Json(challenge).into_response(),
        Err(error) => json_error(&error),
    }
}

/// POST `/api/auth/dids/verify`.
pub async fn did_verify(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(body): Json<DidVerifyBody>,
) -> Response {
    match state
        .dids
        .authentication_verify(
            &body.challenge_id,
            &body.proof,
            body.login_challenge.as_deref(),
        )
        .await
    {
        Ok(completion) => completion_response(&state, jar, completion),
        Err(error) => json_error(&error),
    }
}

/// GET `/api/auth/dids`.
pub async fn did_list(State(state): State<AppState>, jar: CookieJar) -> Response {
    let user_id = match session_user(&state, &jar).await {
        Ok(user_id) => user_id,
        Err(error) => return json_error(&error),
    };
    match state.dids.list_links(&user_id).await {
        Ok(links) => {
            let dids: Vec<&str> = links.iter().map(|l| l.subject.as_str()).collect();
            Json(serde_json::json!({ "dids": dids })).into_response()
        }
        Err(error) => json_error(&error),
    }
}

/// POST `/api/auth/dids/register/challenge`.
pub async fn did_register_challenge(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(body): Json<DidChallengeBody>,
) -> Response {
    let user_id = match session_user(&state, &jar).await {
        Ok(user_id) => user_id,
        Err(error) => return json_error(&error),
    };
    match state.dids.registration_challenge(&body.did, &user_id).await {
        Ok(challenge) => Json(challenge).into_response(),
        Err(error) => json_error(&error),
    }
}

#[derive(Debug, Deserialize)]
pub struct DidRegisterVerifyBody {
    challenge_id: String,
    proof: String,
}

/// POST `/api/auth/dids/register/verify`.
pub async fn did_register_verify(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(body): Json<DidRegisterVerifyBody>,
) -> Response {
    if let Err(error) = session_user(&state, &jar).await {
        return json_error(&error);
    }
    match state
        .dids
        .registration_verify(&body.challenge_id, &body.proof)
        .await
    {
        Ok(user_id) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "linked": true, "user_id": user_id })),
        )
            .into_response(),
        Err(error) => json_error(&error),
    }
}

/// DELETE `/api/auth/dids/{did}`.
pub async fn did_delete(
    State(state): State<AppState>,
    jar: CookieJar,
    Path(did): Path<String>,
) -> Response {
    let user_id = match session_user(&state, &jar).await {
        Ok(user_id) => user_id,
        Err(error) => return json_error(&error),
    };
    match state.dids.remove_link(&user_id, &did).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => json_error(&error),
    }
}
