//! Built-in login, re-authentication and consent handlers (conformance
//! mode).
//!
//! External deployments point the flow at their own UIs; these handlers
//! implement the same contract against the built-in forms: peek the parked
//! challenge to render, verify the credential, then hand control back to
//! the authorization endpoint through a continuation challenge id.

use axum::Form;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum_extra::extract::CookieJar;

use authrim_core::time::now_unix;
use authrim_state::{AuthRequestSnapshot, ChallengeKind, ChallengePayload, ChallengeRecord};

use crate::flow::respond::{self, ResponseParams};
use crate::http::{AppState, templates};
use crate::request::types::{ResponseMode, ResponseTypeSet};
use crate::types::ConsentRecord;

#[derive(Debug, serde::Deserialize)]
pub struct ChallengeQuery {
    challenge: String,
}

#[derive(Debug, serde::Deserialize)]
pub struct LoginForm {
    challenge: String,
    email: String,
    password: String,
}

#[derive(Debug, serde::Deserialize)]
pub struct ConfirmForm {
    challenge: String,
    password: String,
}

#[derive(Debug, serde::Deserialize)]
pub struct ConsentForm {
    challenge: String,
    action: String,
}

async fn client_display_name(state: &AppState, client_id: &str) -> String {
    match state.clients.get(client_id).await {
        Ok(Some(client)) => client.name.clone(),
        _ => client_id.to_string(),
    }
}

fn invalid_challenge_page() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Html(templates::error_page(
            "invalid_request",
            "Invalid or expired code",
        )),
    )
        .into_response()
}

// =============================================================================
// Login
// =============================================================================

/// GET `/flow/login`.
pub async fn login_form(
    State(state): State<AppState>,
    Query(query): Query<ChallengeQuery>,
) -> Response {
    let Ok(Some(record)) = state.challenges.get_challenge(&query.challenge).await else {
        return invalid_challenge_page();
    };
    let ChallengePayload::Login { request } = &record.payload else {
        return invalid_challenge_page();
    };
    let name = client_display_name(&state, &request.client_id).await;
    Html(templates::login_form(&query.challenge, &name, None)).into_response()
}

/// POST `/flow/login`.
pub async fn login_submit(
    State(state): State<AppState>,
    jar: CookieJar,
    Form(form): Form<LoginForm>,
) -> Response {
    let user_id = match state.users.verify_password(&form.email, &form.password).await {
        Ok(Some(user_id)) => user_id,
        Ok(None) => {
            // Wrong credentials: re-render against the still-parked
            // challenge (the peek does not consume it).
            let Ok(Some(record)) = state.challenges.get_challenge(&form.challenge).await else {
                return invalid_challenge_page();
            };
            let ChallengePayload::Login { request } = &record.payload else {
                return invalid_challenge_page();
            };
            let name = client_display_name(&state, &request.client_id).await;
            return Html(templates::login_form(
                &form.challenge,
                &name,
                Some("Invalid email or password"),
            ))
            .into_response();
        }
        Err(e) => {
            tracing::error!(error = %e, "password verification failed");
            return invalid_challenge_page();
        }
    };

    match state
        .coordinator
        .establish(
            &user_id,
            vec!["pwd".to_string()],
            None,
            serde_json::json!({ "email": form.email }),
            Some(&form.challenge),
        )
        .await
    {
        Ok(completion) => {
            let jar = match &completion.session_id {
                Some(session_id) => jar.add(state.session_cookie(session_id.to_string())),
                None => jar,
            };
            let target = completion
                .resume_url
                .unwrap_or_else(|| state.config.issuer.clone());
            (jar, Redirect::to(&target)).into_response()
        }
        Err(_) => invalid_challenge_page(),
    }
}

// =============================================================================
// Re-authentication
// =============================================================================

/// GET `/flow/confirm`.
pub async fn confirm_form(
    State(state): State<AppState>,
    Query(query): Query<ChallengeQuery>,
) -> Response {
    let Ok(Some(record)) = state.challenges.get_challenge(&query.challenge).await else {
        return invalid_challenge_page();
    };
    let ChallengePayload::Reauth { request, .. } = &record.payload else {
        return invalid_challenge_page();
    };
    let name = client_display_name(&state, &request.client_id).await;
    Html(templates::confirm_form(&query.challenge, &name, None)).into_response()
}

/// POST `/flow/confirm`.
///
/// Verifies the password against the parked identity and hands the
/// still-unconsumed challenge id back to the authorization endpoint, which
/// consumes it as the confirmation proof.
pub async fn confirm_submit(
    State(state): State<AppState>,
    Form(form): Form<ConfirmForm>,
) -> Response {
    let Ok(Some(record)) = state.challenges.get_challenge(&form.challenge).await else {
        return invalid_challenge_page();
    };
    let ChallengePayload::Reauth { request, user_id } = &record.payload else {
        return invalid_challenge_page();
    };

    match state
        .users
        .verify_password_for_user(user_id, &form.password)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            let name = client_display_name(&state, &request.client_id).await;
            return Html(templates::confirm_form(
                &form.challenge,
                &name,
                Some("Incorrect password"),
            ))
            .into_response();
        }
        Err(e) => {
            tracing::error!(error = %e, "password verification failed");
            return invalid_challenge_page();
        }
    }

    Redirect::to(&format!(
        "{}/authorize?_confirmed={}",
        state.config.issuer, form.challenge
    ))
    .into_response()
}

// =============================================================================
// Consent
// =============================================================================

/// GET `/auth/consent`.
pub async fn consent_form(
    State(state): State<AppState>,
    Query(query): Query<ChallengeQuery>,
) -> Response {
    let Ok(Some(record)) = state.challenges.get_challenge(&query.challenge).await else {
        return invalid_challenge_page();
    };
    let ChallengePayload::Consent { request, .. } = &record.payload else {
        return invalid_challenge_page();
    };
    let name = client_display_name(&state, &request.client_id).await;
    let scopes: Vec<&str> = request.scope.split_whitespace().collect();
    Html(templates::consent_form(&query.challenge, &name, &scopes)).into_response()
}

/// POST `/auth/consent`.
pub async fn consent_submit(
    State(state): State<AppState>,
    Form(form): Form<ConsentForm>,
) -> Response {
    // Consume the parked challenge: approval and denial both burn it.
    let record = match state
        .challenges
        .consume_challenge(&form.challenge, ChallengeKind::Consent)
        .await
    {
        Ok(record) => record,
        Err(_) => return invalid_challenge_page(),
    };
    let ChallengePayload::Consent { request, user_id } = record.payload else {
        return invalid_challenge_page();
    };

    if form.action != "approve" {
        return deny_redirect(&state, &request).await;
    }

    let consent = ConsentRecord {
        user_id: user_id.clone(),
        client_id: request.client_id.clone(),
        scope: request.scope.clone(),
        granted_at: now_unix(),
        expires_at: None,
    };
    if let Err(e) = state.consents.upsert(consent).await {
        tracing::error!(error = %e, "failed to record consent");
        return invalid_challenge_page();
    }

    // Fresh continuation: the flow consumes it as the consent proof.
    let continuation = ChallengeRecord::new(
        ChallengePayload::Consent { request, user_id },
        state.config.ttl.challenge.as_secs() as i64,
    );
    let id = continuation.id.clone();
    if state.challenges.store_challenge(continuation).await.is_err() {
        return invalid_challenge_page();
    }

    Redirect::to(&format!(
        "{}/authorize?_consent_confirmed={id}",
        state.config.issuer
    ))
    .into_response()
}

/// Delivers `access_denied` back to the client in its effective response
/// mode.
async fn deny_redirect(state: &AppState, request: &AuthRequestSnapshot) -> Response {
    let mut params = ResponseParams::new();
    params.set("error", "access_denied");
    params.set("error_description", "The user denied the request");
    params.set_opt("state", request.state.as_deref());
    params.set("iss", state.config.issuer.clone());

    let mode = ResponseTypeSet::parse(&request.response_type)
        .ok()
        .and_then(|rt| {
            let requested = request
                .response_mode
                .as_deref()
                .and_then(|m| ResponseMode::parse(m).ok());
            ResponseMode::resolve(requested, rt).ok()
        })
        .unwrap_or(ResponseMode::Query);

    let client = match state.clients.get(&request.client_id).await {
        Ok(Some(client)) => client,
        _ => return invalid_challenge_page(),
    };
    match respond::deliver(
        mode,
        &request.redirect_uri,
        params,
        &client,
        &state.token_issuer,
        &state.config.issuer,
        state.config.ttl.jarm.as_secs() as i64,
    )
    .await
    {
        Ok(crate::flow::Delivery::Redirect(url)) => Redirect::to(&url).into_response(),
        Ok(crate::flow::Delivery::FormPost { html, csp_nonce }) => (
            [(
                axum::http::header::CONTENT_SECURITY_POLICY,
                format!("script-src 'nonce-{csp_nonce}'"),
            )],
            Html(html),
        )
            .into_response(),
        Err(_) => invalid_challenge_page(),
    }
}
