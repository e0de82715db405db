//! Axum HTTP handlers for the authorization server surface.

pub mod authn;
pub mod authorize;
pub mod discovery;
pub mod flow_ui;
pub mod logout;
pub mod par;
pub mod saml;
pub mod session_check;
pub mod templates;
pub mod token;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};
use cookie::{Cookie, SameSite};

use authrim_config::AuthrimConfig;
use authrim_state::{ChallengeStore, DpopJtiStore, KeyManager, ParRequestStore, RateLimiter,
    SessionStore, ShardRouter};

use crate::authn::LoginCoordinator;
use crate::authn::did::DidService;
use crate::authn::email_otp::EmailOtpService;
use crate::authn::passkey::PasskeyService;
use crate::authn::saml::SamlService;
use crate::flow::AuthorizationService;
use crate::logout::LogoutService;
use crate::registry::ClientRegistry;
use crate::storage::{ConsentStore, UserStore};
use crate::token::endpoint::TokenService;
use crate::token::issuer::TokenIssuer;

/// Shared handler state: the dependency-injection record every handler
/// draws its collaborators from.
#[derive(Clone)]
pub struct AppState {
    /// Configuration snapshot.
    pub config: Arc<AuthrimConfig>,
    /// The authorization state machine.
    pub authorization: Arc<AuthorizationService>,
    /// Token endpoint service.
    pub tokens: Arc<TokenService>,
    /// Shard router.
    pub router: Arc<ShardRouter>,
    /// PAR store.
    pub par_requests: Arc<dyn ParRequestStore>,
    /// Rate limiter.
    pub rate_limiter: Arc<dyn RateLimiter>,
    /// Challenge store (UI peeks and consent handling).
    pub challenges: Arc<dyn ChallengeStore>,
    /// Session store.
    pub sessions: Arc<dyn SessionStore>,
    /// Consent store.
    pub consents: Arc<dyn ConsentStore>,
    /// User store.
    pub users: Arc<dyn UserStore>,
    /// DPoP replay store.
    pub dpop_jti: Arc<dyn DpopJtiStore>,
    /// Client registry.
    pub clients: Arc<ClientRegistry>,
    /// Key manager.
    pub key_manager: Arc<KeyManager>,
    /// Token issuer (JARM envelopes, userinfo-adjacent signing).
    pub token_issuer: Arc<TokenIssuer>,
    /// Login coordinator.
    pub coordinator: Arc<LoginCoordinator>,
    /// Passkey authenticator.
    pub passkeys: Arc<PasskeyService>,
    /// Email-OTP authenticator.
    pub email_otp: Arc<EmailOtpService>,
    /// DID authenticator.
    pub dids: Arc<DidService>,
    /// SAML SP.
    pub saml: Arc<SamlService>,
    /// Logout coordinator.
    pub logout: Arc<LogoutService>,
}

impl AppState {
    fn same_site(&self) -> SameSite {
        match self.config.cookies.same_site.as_str() {
            "none" => SameSite::None,
            _ => SameSite::Lax,
        }
    }

    /// Builds the session cookie.
    #[must_use]
    pub fn session_cookie(&self, value: String) -> Cookie<'static> {
        let mut cookie = Cookie::new(self.config.cookies.session_cookie.clone(), value);
        cookie.set_http_only(true);
        cookie.set_secure(self.config.cookies.secure);
        cookie.set_same_site(self.same_site());
        cookie.set_path("/");
        cookie
    }

    /// Builds the browser-state cookie. Deliberately not HttpOnly: the
    /// session-check iframe script reads it.
    #[must_use]
    pub fn browser_state_cookie(&self, value: String) -> Cookie<'static> {
        let mut cookie = Cookie::new(self.config.cookies.browser_state_cookie.clone(), value);
        cookie.set_http_only(false);
        cookie.set_secure(self.config.cookies.secure);
        cookie.set_same_site(self.same_site());
        cookie.set_path("/");
        cookie
    }

    /// Builds the email-OTP binding cookie.
    #[must_use]
    pub fn otp_cookie(&self, value: String) -> Cookie<'static> {
        let mut cookie = Cookie::new(self.config.cookies.otp_session_cookie.clone(), value);
        cookie.set_http_only(true);
        cookie.set_secure(self.config.cookies.secure);
        cookie.set_same_site(SameSite::Lax);
        cookie.set_max_age(cookie::time::Duration::seconds(
            self.config.ttl.otp_session.as_secs() as i64,
        ));
        cookie.set_path("/");
        cookie
    }
}

/// Assembles the authorization server router.
#[must_use]
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/authorize", get(authorize::authorize_get).post(authorize::authorize_post))
        .route("/par", post(par::par_handler))
        .route("/token", post(token::token_handler))
        .route("/flow/login", get(flow_ui::login_form).post(flow_ui::login_submit))
        .route("/flow/confirm", get(flow_ui::confirm_form).post(flow_ui::confirm_submit))
        .route("/auth/consent", get(flow_ui::consent_form).post(flow_ui::consent_submit))
        .route("/api/auth/passkeys/register/options", post(authn::passkey_register_options))
        .route("/api/auth/passkeys/register/verify", post(authn::passkey_register_verify))
        .route("/api/auth/passkeys/login/options", post(authn::passkey_login_options))
        .route("/api/auth/passkeys/login/verify", post(authn::passkey_login_verify))
        .route("/api/auth/email-codes/send", post(authn::email_code_send))
        .route("/api/auth/email-codes/verify", post(authn::email_code_verify))
        .route("/api/auth/dids/challenge", post(authn::did_challenge))
        .route("/api/auth/dids/verify", post(authn::did_verify))
        .route("/api/auth/dids", get(authn::did_list))
        .route("/api/auth/dids/register/challenge", post(authn::did_register_challenge))
        .route("/api/auth/dids/register/verify", post(authn::did_register_verify))
        .route("/api/auth/dids/{did}", delete(authn::did_delete))
        .route("/session/check", get(session_check::session_check))
        .route("/logout", get(logout::logout_handler).post(logout::logout_handler))
        .route("/logout/backchannel", post(logout::backchannel_handler))
        .route("/saml/sp/acs", post(saml::acs_handler))
        .route("/saml/sp/metadata", get(saml::metadata_handler))
        .route("/saml/sp/slo", get(saml::slo_handler).post(saml::slo_handler))
        .route("/.well-known/openid-configuration", get(discovery::openid_configuration))
        .route("/jwks", get(discovery::jwks_handler))
        .route("/userinfo", get(discovery::userinfo_handler).post(discovery::userinfo_handler))
        .with_state(state)
}
