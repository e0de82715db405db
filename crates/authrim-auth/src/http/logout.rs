//! Logout endpoints.

use std::collections::BTreeMap;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum_extra::extract::CookieJar;

use crate::http::{AppState, templates};
use crate::http::authorize::json_error;
use crate::logout::{LogoutOutcome, LogoutRequest};

/// GET/POST `/logout`.
pub async fn logout_handler(
    State(state): State<AppState>,
    Query(params): Query<BTreeMap<String, String>>,
    jar: CookieJar,
) -> Response {
    let request = LogoutRequest {
        id_token_hint: params.get("id_token_hint").cloned(),
        post_logout_redirect_uri: params.get("post_logout_redirect_uri").cloned(),
        state: params.get("state").cloned(),
    };
    let session_cookie = jar
        .get(&state.config.cookies.session_cookie)
        .map(|c| c.value().to_string());

    let outcome = state.logout.logout(session_cookie.as_deref(), request).await;

    // The session and browser-state cookies are cleared regardless.
    let jar = jar
        .remove(state.session_cookie(String::new()))
        .remove(state.browser_state_cookie(String::new()));

    match outcome {
        LogoutOutcome::Page { html } => (jar, Html(html)).into_response(),
        LogoutOutcome::Redirect(url) => (jar, Redirect::to(&url)).into_response(),
        LogoutOutcome::ErrorPage => (
            StatusCode::BAD_REQUEST,
            jar,
            Html(templates::error_page(
                "invalid_request",
                "The logout request could not be processed",
            )),
        )
            .into_response(),
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct BackchannelBody {
    sid: String,
}

/// POST `/logout/backchannel`: API-initiated session termination with
/// back-channel RP notification only.
pub async fn backchannel_handler(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<BackchannelBody>,
) -> Response {
    match state.logout.backchannel_logout(&body.sid).await {
        Ok(()) => axum::Json(serde_json::json!({ "logged_out": true })).into_response(),
        Err(error) => json_error(&error),
    }
}
