//! The authorization endpoint.

use std::collections::BTreeMap;

use axum::Form;
use axum::extract::{Query, RawQuery, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum_extra::extract::CookieJar;

use crate::error::AuthError;
use crate::flow::{AuthorizeOutcome, Delivery, FlowInput};
use crate::http::{AppState, templates};

/// GET `/authorize`.
pub async fn authorize_get(
    State(state): State<AppState>,
    Query(params): Query<BTreeMap<String, String>>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    jar: CookieJar,
) -> Response {
    let request_url = format!(
        "{}/authorize{}",
        state.config.issuer,
        raw_query.map_or(String::new(), |q| format!("?{q}"))
    );
    run(state, params, "GET", request_url, headers, jar).await
}

/// POST `/authorize`.
pub async fn authorize_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Form(params): Form<BTreeMap<String, String>>,
) -> Response {
    let request_url = format!("{}/authorize", state.config.issuer);
    run(state, params, "POST", request_url, headers, jar).await
}

async fn run(
    state: AppState,
    params: BTreeMap<String, String>,
    method: &str,
    request_url: String,
    headers: HeaderMap,
    jar: CookieJar,
) -> Response {
    // Rate limit per client id (falling back to a shared anonymous key).
    let bucket = state.config.rate_limits.bucket("authorize");
    let key = params
        .get("client_id")
        .cloned()
        .unwrap_or_else(|| "anonymous".to_string());
    match state.rate_limiter.increment("authorize", &key, bucket).await {
        Ok(decision) if !decision.allowed => {
            return rate_limited_response(decision.retry_after);
        }
        Err(e) => {
            tracing::error!(error = %e, "rate limiter unavailable");
        }
        Ok(_) => {}
    }

    let input = FlowInput {
        params,
        method: method.to_string(),
        request_url,
        session_cookie: jar
            .get(&state.config.cookies.session_cookie)
            .map(|c| c.value().to_string()),
        browser_state_cookie: jar
            .get(&state.config.cookies.browser_state_cookie)
            .map(|c| c.value().to_string()),
        dpop_proof: headers
            .get("dpop")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string),
    };

    let outcome = state.authorization.authorize(input).await;
    render_outcome(&state, outcome, jar)
}

/// Converts a flow outcome into the HTTP response.
pub fn render_outcome(state: &AppState, outcome: AuthorizeOutcome, jar: CookieJar) -> Response {
    match outcome {
        AuthorizeOutcome::Delivered {
            delivery,
            browser_state_cookie,
        } => {
            let jar = match browser_state_cookie {
                Some(value) => jar.add(state.browser_state_cookie(value)),
                None => jar,
            };
            match delivery {
                Delivery::Redirect(url) => (jar, Redirect::to(&url)).into_response(),
                Delivery::FormPost { html, csp_nonce } => (
                    jar,
                    [(
                        header::CONTENT_SECURITY_POLICY,
                        format!("script-src 'nonce-{csp_nonce}'"),
                    )],
                    Html(html),
                )
                    .into_response(),
            }
        }
        AuthorizeOutcome::UiRedirect(url) => Redirect::to(&url).into_response(),
        AuthorizeOutcome::RenderError(error) => render_error(&error),
        AuthorizeOutcome::ServerError(error) => json_error(&error),
    }
}

/// Renders an error page directly to the user agent.
pub fn render_error(error: &AuthError) -> Response {
    let status = match error.http_status() {
        500 => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    };
    (
        status,
        Html(templates::error_page(
            error.oauth_error_code(),
            &error.wire_description(),
        )),
    )
        .into_response()
}

/// The JSON error envelope.
pub fn json_error(error: &AuthError) -> Response {
    let status = StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::BAD_REQUEST);
    let body = serde_json::json!({
        "error": error.oauth_error_code(),
        "error_description": error.wire_description(),
    });
    let mut response = (status, axum::Json(body)).into_response();
    if let AuthError::RateLimited { retry_after } = error
        && let Ok(value) = retry_after.to_string().parse()
    {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

fn rate_limited_response(retry_after: u64) -> Response {
    json_error(&AuthError::RateLimited { retry_after })
}
