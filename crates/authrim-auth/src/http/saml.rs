//! SAML SP HTTP endpoints.

use std::collections::BTreeMap;

use axum::Form;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum_extra::extract::CookieJar;

use crate::http::{AppState, templates};

#[derive(Debug, serde::Deserialize)]
pub struct AcsForm {
    #[serde(rename = "SAMLResponse")]
    saml_response: String,
    /// Carries the parked login-challenge id across the IdP round trip.
    #[serde(rename = "RelayState", default)]
    relay_state: Option<String>,
}

/// POST `/saml/sp/acs`.
pub async fn acs_handler(
    State(state): State<AppState>,
    jar: CookieJar,
    Form(form): Form<AcsForm>,
) -> Response {
    let login_challenge = form
        .relay_state
        .as_deref()
        .filter(|v| !v.is_empty());
    match state
        .saml
        .consume_response(&form.saml_response, login_challenge)
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
        Err(_) => (
            StatusCode::BAD_REQUEST,
            Html(templates::error_page(
                "invalid_request",
                "SAML response validation failed",
            )),
        )
            .into_response(),
    }
}

/// GET `/saml/sp/metadata`.
pub async fn metadata_handler(State(state): State<AppState>) -> Response {
    let entity_id = state.saml.sp_entity_id();
    let acs = state.saml.acs_url();
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="{entity_id}">
  <md:SPSSODescriptor AuthnRequestsSigned="false" WantAssertionsSigned="true" protocolSupportEnumeration="urn:oasis:names:tc:SAML:2.0:protocol">
    <md:AssertionConsumerService Binding="urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST" Location="{acs}" index="0" isDefault="true"/>
  </md:SPSSODescriptor>
</md:EntityDescriptor>"#
    );
    ([(header::CONTENT_TYPE, "application/samlmetadata+xml")], xml).into_response()
}

/// GET/POST `/saml/sp/slo`: single logout initiated by the IdP clears the
/// local session through the regular logout path.
pub async fn slo_handler(
    State(state): State<AppState>,
    Query(params): Query<BTreeMap<String, String>>,
    jar: CookieJar,
) -> Response {
    let _ = params;
    let session_cookie = jar
        .get(&state.config.cookies.session_cookie)
        .map(|c| c.value().to_string());
    let outcome = state
        .logout
        .logout(session_cookie.as_deref(), crate::logout::LogoutRequest::default())
        .await;
    let jar = jar
        .remove(state.session_cookie(String::new()))
        .remove(state.browser_state_cookie(String::new()));
    match outcome {
        crate::logout::LogoutOutcome::Page { html } => (jar, Html(html)).into_response(),
        crate::logout::LogoutOutcome::Redirect(url) => (jar, Redirect::to(&url)).into_response(),
        crate::logout::LogoutOutcome::ErrorPage => (
            StatusCode::BAD_REQUEST,
            jar,
            Html(templates::error_page("invalid_request", "Logout failed")),
        )
            .into_response(),
    }
}
