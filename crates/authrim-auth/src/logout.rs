//! Logout coordination.
//!
//! Terminating a session notifies every RP the session issued tokens to:
//! front-channel via an HTML page embedding one iframe per associated
//! client, back-channel via a signed Logout Token POSTed to each client's
//! registered URI. The session and its associations are removed before the
//! notifications fire, so a crashed notification never leaves a live
//! session behind.

use std::sync::Arc;

use serde::Serialize;
use url::Url;

use authrim_config::AuthrimConfig;
use authrim_core::id::SessionId;
use authrim_core::time::now_unix;
use authrim_state::{KeyManager, SessionStore};
use jsonwebtoken::{Algorithm, Validation};

use crate::error::AuthError;
use crate::flow::respond::html_escape;
use crate::registry::ClientRegistry;
use crate::storage::SessionClientStore;
use crate::token::issuer::TokenIssuer;

/// The back-channel logout event URI.
const BACKCHANNEL_EVENT: &str = "http://schemas.openid.net/event/backchannel-logout";

/// Logout Token claims (OIDC Back-Channel Logout 1.0).
#[derive(Debug, Serialize)]
struct LogoutTokenClaims {
    iss: String,
    sub: String,
    aud: String,
    iat: i64,
    exp: i64,
    jti: String,
    events: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    sid: Option<String>,
}

/// Parameters accepted at the logout endpoint.
#[derive(Debug, Clone, Default)]
pub struct LogoutRequest {
    /// ID token identifying the RP initiating logout.
    pub id_token_hint: Option<String>,
    /// Where to send the user agent afterwards. Only honored when it is
    /// registered for the hinted client.
    pub post_logout_redirect_uri: Option<String>,
    /// Opaque state echoed onto the redirect.
    pub state: Option<String>,
}

/// The result of a logout.
pub enum LogoutOutcome {
    /// Render the front-channel notification page. When a validated
    /// redirect exists the page chains to it after the iframes load.
    Page {
        /// The rendered HTML.
        html: String,
    },
    /// Nothing to notify: redirect straight to the validated target.
    Redirect(String),
    /// Validation failed: render the generic logout-error page.
    ErrorPage,
}

/// The logout coordinator.
pub struct LogoutService {
    config: Arc<AuthrimConfig>,
    sessions: Arc<dyn SessionStore>,
    session_clients: Arc<dyn SessionClientStore>,
    clients: Arc<ClientRegistry>,
    issuer: Arc<TokenIssuer>,
    key_manager: Arc<KeyManager>,
    http: reqwest::Client,
}

impl LogoutService {
    /// Creates the coordinator.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the HTTP client cannot be constructed.
    pub fn new(
        config: Arc<AuthrimConfig>,
        sessions: Arc<dyn SessionStore>,
        session_clients: Arc<dyn SessionClientStore>,
        clients: Arc<ClientRegistry>,
        issuer: Arc<TokenIssuer>,
        key_manager: Arc<KeyManager>,
    ) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(config.outbound.timeout)
            .build()
            .map_err(|e| AuthError::internal(format!("http client: {e}")))?;
        Ok(Self {
            config,
            sessions,
            session_clients,
            clients,
            issuer,
            key_manager,
            http,
        })
    }

    /// Handles an RP-initiated logout.
    pub async fn logout(&self, session_cookie: Option<&str>, request: LogoutRequest) -> LogoutOutcome {
        // Validate the hint and redirect target first; an invalid pair
        // surfaces the generic error page without touching the session.
        let hinted_client = match &request.id_token_hint {
            Some(hint) => match self.hinted_client(hint).await {
                Ok(client_id) => Some(client_id),
                Err(_) => return LogoutOutcome::ErrorPage,
            },
            None => None,
        };

        let redirect = match &request.post_logout_redirect_uri {
            Some(uri) => {
                let Some(client_id) = &hinted_client else {
                    // A redirect without a verifiable initiator is open
                    // redirection; refuse.
                    return LogoutOutcome::ErrorPage;
                };
                let registered = match self.clients.get(client_id).await {
                    Ok(Some(client)) => client.is_post_logout_redirect_uri_registered(uri),
                    _ => false,
                };
                if !registered {
                    return LogoutOutcome::ErrorPage;
                }
                let mut url = match Url::parse(uri) {
                    Ok(url) => url,
                    Err(_) => return LogoutOutcome::ErrorPage,
                };
                if let Some(state) = &request.state {
                    url.query_pairs_mut().append_pair("state", state);
                }
                Some(url.to_string())
            }
            None => None,
        };

        // Terminate the session.
        let session = match session_cookie.and_then(|v| SessionId::parse(v).ok()) {
            Some(session_id) => {
                let record = self.sessions.get_session(&session_id).await.ok().flatten();
                if let Err(e) = self.sessions.delete_session(&session_id).await {
                    tracing::warn!(error = %e, "failed to delete session at logout");
                }
                record.map(|record| (session_id, record))
            }
            None => None,
        };

        let Some((session_id, record)) = session else {
            return match redirect {
                Some(url) => LogoutOutcome::Redirect(url),
                None => LogoutOutcome::Page {
                    html: render_logout_page(&[], redirect.as_deref()),
                },
            };
        };

        let sid = session_id.to_string();
        let associated = self
            .session_clients
            .list_clients(&sid)
            .await
            .unwrap_or_default();
        if let Err(e) = self.session_clients.remove_session(&sid).await {
            tracing::warn!(error = %e, "failed to clear session associations");
        }

        // Notify RPs.
        let mut frontchannel_frames = Vec::new();
        for client_id in &associated {
            let Ok(Some(client)) = self.clients.get(client_id).await else {
                continue;
            };
            if let Some(frontchannel) = &client.frontchannel_logout_uri
                && let Ok(mut url) = Url::parse(frontchannel)
            {
                url.query_pairs_mut()
                    .append_pair("iss", &self.config.issuer)
                    .append_pair("sid", &sid);
                frontchannel_frames.push(url.to_string());
            }
            if let Some(backchannel) = client.backchannel_logout_uri.clone() {
                self.send_backchannel(&backchannel, client_id, &record.user_id, &sid)
                    .await;
            }
        }

        LogoutOutcome::Page {
            html: render_logout_page(&frontchannel_frames, redirect.as_deref()),
        }
    }

    /// Terminates a session by id, back-channel notifications only. Backs
    /// the API-initiated logout endpoint.
    ///
    /// # Errors
    ///
    /// Returns `invalid_request` for an unparseable session id.
    pub async fn backchannel_logout(&self, sid: &str) -> Result<(), AuthError> {
        let session_id = SessionId::parse(sid)
            .map_err(|_| AuthError::invalid_request("invalid session id"))?;
        let record = self.sessions.get_session(&session_id).await.ok().flatten();
        if let Err(e) = self.sessions.delete_session(&session_id).await {
            tracing::warn!(error = %e, "failed to delete session");
        }
        let Some(record) = record else {
            return Ok(());
        };

        let associated = self.session_clients.list_clients(sid).await.unwrap_or_default();
        if let Err(e) = self.session_clients.remove_session(sid).await {
            tracing::warn!(error = %e, "failed to clear session associations");
        }
        for client_id in &associated {
            if let Ok(Some(client)) = self.clients.get(client_id).await
                && let Some(backchannel) = client.backchannel_logout_uri.clone()
            {
                self.send_backchannel(&backchannel, client_id, &record.user_id, sid)
                    .await;
            }
        }
        Ok(())
    }

    async fn hinted_client(&self, hint: &str) -> Result<String, AuthError> {
        #[derive(serde::Deserialize)]
        struct HintClaims {
            aud: String,
        }
        let jwks = self.key_manager.verification_jwks().await;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.algorithms = vec![Algorithm::RS256, Algorithm::RS384, Algorithm::RS512];
        validation.validate_aud = false;
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        let data = authrim_crypto::verify_with_jwks::<HintClaims>(hint, &jwks, &validation)
            .map_err(|_| AuthError::invalid_request("id_token_hint verification failed"))?;
        Ok(data.claims.aud)
    }

    async fn send_backchannel(&self, uri: &str, client_id: &str, user_id: &str, sid: &str) {
        let now = now_unix();
        let claims = LogoutTokenClaims {
            iss: self.config.issuer.clone(),
            sub: user_id.to_string(),
            aud: client_id.to_string(),
            iat: now,
            exp: now + 120,
            jti: uuid::Uuid::new_v4().to_string(),
            events: serde_json::json!({ BACKCHANNEL_EVENT: {} }),
            sid: Some(sid.to_string()),
        };
        let token = match self.issuer.sign_claims(&claims).await {
            Ok(token) => token,
            Err(e) => {
                tracing::error!(error = %e, "failed to sign logout token");
                return;
            }
        };
        let result = self
            .http
            .post(uri)
            .form(&[("logout_token", token)])
            .send()
            .await;
        if let Err(e) = result {
            tracing::warn!(client_id, error = %e, "back-channel logout delivery failed");
        }
    }
}

/// Renders the front-channel logout page: one hidden iframe per RP, then an
/// optional continue link / refresh to the validated redirect target.
fn render_logout_page(frames: &[String], redirect: Option<&str>) -> String {
    let mut iframes = String::new();
    for frame in frames {
        iframes.push_str(&format!(
            r#"<iframe src="{}" style="display:none" aria-hidden="true"></iframe>"#,
            html_escape(frame)
        ));
    }
    let continuation = match redirect {
        Some(target) => format!(
            r#"<meta http-equiv="refresh" content="2;url={0}"/><p><a href="{0}">Continue</a></p>"#,
            html_escape(target)
        ),
        None => "<p>You have been signed out.</p>".to_string(),
    };
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Signing out</title>{continuation}</head>
<body>
{iframes}
</body>
</html>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logout_page_embeds_frames() {
        let html = render_logout_page(
            &[
                "https://rp1.example/fc-logout?iss=x&sid=y".to_string(),
                "https://rp2.example/fc-logout?iss=x&sid=y".to_string(),
            ],
            None,
        );
        assert_eq!(html.matches("<iframe").count(), 2);
        assert!(html.contains("rp1.example"));
        assert!(html.contains("signed out"));
    }

    #[test]
    fn test_logout_page_escapes_redirect() {
        let html = render_logout_page(&[], Some(r#"https://rp.example/x"><script>"#));
        assert!(!html.contains("<script>"));
    }
}
