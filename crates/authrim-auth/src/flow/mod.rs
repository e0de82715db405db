//! The authorization state machine.
//!
//! Drives a validated request through session lookup, authentication,
//! consent and issuance. Requests that need interaction are parked in a
//! single-use challenge and the user agent is redirected to the matching
//! UI; the UI hands control back through a continuation challenge, so the
//! in-band `_confirmed` / `_consent_confirmed` markers are never trusted
//! from an external caller. They are challenge ids, and consuming the
//! challenge is what proves the round trip happened.
//!
//! ```text
//! START → PARSED → AUTHENTICATED → CONSENTED → ISSUED
//!            │           │
//!            │           └─► CONSENT_REDIRECT (Consent challenge) ─► consent UI
//!            └─► LOGIN_REDIRECT (Login/Reauth challenge) ─► login UI
//! ```

pub mod respond;
pub mod session_state;

use std::sync::Arc;

use authrim_config::AuthrimConfig;
use authrim_core::id::{AuthCode, SessionId};
use authrim_core::time::now_unix;
use authrim_state::{
    AuthCodeRecord, AuthCodeStore, AuthRequestSnapshot, ChallengeKind, ChallengePayload,
    ChallengeRecord, ChallengeStore, DpopJtiStore, KeyManager, SessionRecord, SessionStore,
    ShardRouter,
};
use jsonwebtoken::{Algorithm, Validation};

use crate::error::AuthError;
use crate::registry::ClientRegistry;
use crate::request::types::ResponseMode;
use crate::request::validate::{AuthorizeReject, RawParams, RequestValidator, ValidatedAuthRequest};
use crate::storage::{ConsentStore, SessionClientStore, UserStore};
use crate::token::dpop::validate_dpop_proof;
use crate::token::issuer::{IdTokenParams, TokenIssuer};
use crate::types::{ConsentRecord, UserInfo};

pub use respond::{Delivery, ResponseParams};

/// Everything the HTTP layer extracts for one authorization attempt.
#[derive(Debug, Clone)]
pub struct FlowInput {
    /// Merged raw parameters (query or form body).
    pub params: RawParams,
    /// HTTP method, for DPoP `htm` matching.
    pub method: String,
    /// Full request URL, for DPoP `htu` matching.
    pub request_url: String,
    /// The session cookie value, if any.
    pub session_cookie: Option<String>,
    /// The browser-state cookie value, if any.
    pub browser_state_cookie: Option<String>,
    /// The `DPoP` header value, if any.
    pub dpop_proof: Option<String>,
}

/// What the HTTP layer should do with the attempt.
pub enum AuthorizeOutcome {
    /// Deliver a response (success or OAuth error) to the client.
    Delivered {
        /// The response.
        delivery: Delivery,
        /// New browser-state cookie value to set, when one was minted.
        browser_state_cookie: Option<String>,
    },
    /// Redirect the user agent to a UI (login, reauth, consent).
    UiRedirect(String),
    /// Render an error page directly (no trustworthy redirect URI).
    RenderError(AuthError),
    /// Respond with the JSON error envelope (configuration failures).
    ServerError(AuthError),
}

/// The authorization state machine service.
pub struct AuthorizationService {
    config: Arc<AuthrimConfig>,
    router: Arc<ShardRouter>,
    validator: Arc<RequestValidator>,
    clients: Arc<ClientRegistry>,
    auth_codes: Arc<dyn AuthCodeStore>,
    challenges: Arc<dyn ChallengeStore>,
    sessions: Arc<dyn SessionStore>,
    consents: Arc<dyn ConsentStore>,
    users: Arc<dyn UserStore>,
    session_clients: Arc<dyn SessionClientStore>,
    dpop_jti: Arc<dyn DpopJtiStore>,
    issuer: Arc<TokenIssuer>,
    key_manager: Arc<KeyManager>,
}

struct ResolvedIdentity {
    user_id: String,
    session_id: Option<SessionId>,
    auth_time: i64,
    acr: Option<String>,
    amr: Option<Vec<String>>,
    anonymous: bool,
}

impl AuthorizationService {
    /// Creates the service.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<AuthrimConfig>,
        router: Arc<ShardRouter>,
        validator: Arc<RequestValidator>,
        clients: Arc<ClientRegistry>,
        auth_codes: Arc<dyn AuthCodeStore>,
        challenges: Arc<dyn ChallengeStore>,
        sessions: Arc<dyn SessionStore>,
        consents: Arc<dyn ConsentStore>,
        users: Arc<dyn UserStore>,
        session_clients: Arc<dyn SessionClientStore>,
        dpop_jti: Arc<dyn DpopJtiStore>,
        issuer: Arc<TokenIssuer>,
        key_manager: Arc<KeyManager>,
    ) -> Self {
        Self {
            config,
            router,
            validator,
            clients,
            auth_codes,
            challenges,
            sessions,
            consents,
            users,
            session_clients,
            dpop_jti,
            issuer,
            key_manager,
        }
    }

    /// The client registry, shared with the HTTP layer for display lookups.
    #[must_use]
    pub fn clients(&self) -> &Arc<ClientRegistry> {
        &self.clients
    }

    /// Runs one authorization attempt.
    pub async fn authorize(&self, input: FlowInput) -> AuthorizeOutcome {
        // ---- Continuation consumption --------------------------------------
        //
        // The UI hands control back with a challenge id. Consuming it (type
        // checked, single use) is the only way these flags can become true.
        let mut confirmed = false;
        let mut consent_confirmed = false;
        let mut continuation_user: Option<String> = None;
        let mut params = input.params.clone();

        if let Some(challenge_id) = params.get("_confirmed").cloned() {
            match self
                .challenges
                .consume_challenge(&challenge_id, ChallengeKind::Reauth)
                .await
            {
                Ok(record) => {
                    if let ChallengePayload::Reauth { request, user_id } = record.payload {
                        confirmed = true;
                        continuation_user = Some(user_id);
                        params = snapshot_to_params(&request);
                    }
                }
                Err(_) => return AuthorizeOutcome::RenderError(AuthError::InvalidChallenge),
            }
        } else if let Some(challenge_id) = params.get("_consent_confirmed").cloned() {
            match self
                .challenges
                .consume_challenge(&challenge_id, ChallengeKind::Consent)
                .await
            {
                Ok(record) => {
                    if let ChallengePayload::Consent { request, user_id } = record.payload {
                        confirmed = true;
                        consent_confirmed = true;
                        continuation_user = Some(user_id);
                        params = snapshot_to_params(&request);
                    }
                }
                Err(_) => return AuthorizeOutcome::RenderError(AuthError::InvalidChallenge),
            }
        }

        // ---- Parse and validate --------------------------------------------

        let validation = if confirmed || consent_confirmed {
            self.validator.process_resumed(params).await
        } else {
            self.validator.process(params).await
        };
        let request = match validation {
            Ok(request) => request,
            Err(AuthorizeReject::Render(error)) => return AuthorizeOutcome::RenderError(error),
            Err(AuthorizeReject::Redirect {
                error,
                redirect_uri,
                state,
                response_mode,
                client,
            }) => {
                let params =
                    ResponseParams::for_error(&error, state.as_deref(), &self.config.issuer);
                return self
                    .deliver(response_mode, &redirect_uri, params, &client, None)
                    .await;
            }
        };

        // ---- Session lookup -------------------------------------------------

        let session = self.lookup_session(input.session_cookie.as_deref()).await;

        // id_token_hint: recover the expected subject for later comparison.
        let hinted_sub = match input.params.get("id_token_hint") {
            Some(hint) => self.verify_id_token_hint(hint).await,
            None => None,
        };

        // ---- prompt=none ----------------------------------------------------

        if request.prompt.none {
            return self
                .authorize_silent(&request, session, hinted_sub, &input)
                .await;
        }

        // ---- Re-authentication ---------------------------------------------

        let max_age_stale = request.snapshot.max_age.is_some_and(|max_age| {
            session
                .as_ref()
                .is_some_and(|(_, s)| now_unix() - s.auth_time > max_age)
        });
        if let Some((_, session_record)) = &session
            && (request.prompt.login || max_age_stale)
            && !confirmed
        {
            return self
                .park_and_redirect(
                    ChallengePayload::Reauth {
                        request: request.snapshot.clone(),
                        user_id: session_record.user_id.clone(),
                    },
                    UiKind::Reauth,
                )
                .await;
        }

        // ---- Authentication -------------------------------------------------

        let identity = match (&session, continuation_user) {
            (Some((session_id, record)), _) => ResolvedIdentity {
                user_id: record.user_id.clone(),
                session_id: Some(session_id.clone()),
                auth_time: record.auth_time,
                acr: record.acr.clone(),
                amr: Some(record.amr.clone()),
                anonymous: record.anonymous,
            },
            // Stateless tenants authenticate without a session; identity
            // arrives through the consumed continuation challenge.
            (None, Some(user_id)) if confirmed => ResolvedIdentity {
                user_id,
                session_id: None,
                auth_time: now_unix(),
                acr: None,
                amr: None,
                anonymous: false,
            },
            (None, _) => {
                return self
                    .park_and_redirect(
                        ChallengePayload::Login {
                            request: request.snapshot.clone(),
                        },
                        UiKind::Login,
                    )
                    .await;
            }
        };

        // ---- Consent --------------------------------------------------------

        if !consent_confirmed {
            let needs_consent = if request.client.skip_consent {
                // Trusted client: record the auto-grant once so logout and
                // audits see it like any other consent.
                let existing = self
                    .consents
                    .find(&identity.user_id, &request.client.client_id)
                    .await
                    .ok()
                    .flatten();
                if existing.is_none_or(|c| !c.covers(&request.snapshot.scope)) {
                    let record = ConsentRecord {
                        user_id: identity.user_id.clone(),
                        client_id: request.client.client_id.clone(),
                        scope: request.snapshot.scope.clone(),
                        granted_at: now_unix(),
                        expires_at: None,
                    };
                    if let Err(e) = self.consents.upsert(record).await {
                        tracing::warn!(error = %e, "failed to record auto-consent");
                    }
                }
                false
            } else {
                let covered = self
                    .consents
                    .find(&identity.user_id, &request.client.client_id)
                    .await
                    .ok()
                    .flatten()
                    .is_some_and(|c| c.covers(&request.snapshot.scope));
                request.prompt.consent || !covered
            };

            if needs_consent {
                return self
                    .park_and_redirect(
                        ChallengePayload::Consent {
                            request: request.snapshot.clone(),
                            user_id: identity.user_id.clone(),
                        },
                        UiKind::Consent,
                    )
                    .await;
            }
        }

        // ---- DPoP -----------------------------------------------------------

        let dpop_jkt = match self.resolve_dpop(&request, &input).await {
            Ok(jkt) => jkt,
            Err(error) => return self.error_redirect(&request, error).await,
        };

        // ---- Issuance -------------------------------------------------------

        match self.issue(&request, &identity, dpop_jkt, &input).await {
            Ok(outcome) => outcome,
            Err(error) => self.error_redirect(&request, error).await,
        }
    }

    // -------------------------------------------------------------------------
    // prompt=none
    // -------------------------------------------------------------------------

    async fn authorize_silent(
        &self,
        request: &ValidatedAuthRequest,
        session: Option<(SessionId, SessionRecord)>,
        hinted_sub: Option<String>,
        input: &FlowInput,
    ) -> AuthorizeOutcome {
        let Some((session_id, record)) = session else {
            return self.error_redirect(request, AuthError::LoginRequired).await;
        };
        if record.anonymous && !request.client.allow_anonymous_prompt_none {
            return self.error_redirect(request, AuthError::LoginRequired).await;
        }
        if let Some(expected) = hinted_sub
            && expected != record.user_id
        {
            return self.error_redirect(request, AuthError::LoginRequired).await;
        }
        if let Some(max_age) = request.snapshot.max_age
            && now_unix() - record.auth_time > max_age
        {
            return self.error_redirect(request, AuthError::LoginRequired).await;
        }

        let consent_ok = request.client.skip_consent
            || self
                .consents
                .find(&record.user_id, &request.client.client_id)
                .await
                .ok()
                .flatten()
                .is_some_and(|c| c.covers(&request.snapshot.scope));
        if !consent_ok {
            return self
                .error_redirect(request, AuthError::ConsentRequired)
                .await;
        }

        let identity = ResolvedIdentity {
            user_id: record.user_id.clone(),
            session_id: Some(session_id),
            auth_time: record.auth_time,
            acr: record.acr.clone(),
            amr: Some(record.amr.clone()),
            anonymous: record.anonymous,
        };
        let dpop_jkt = match self.resolve_dpop(request, input).await {
            Ok(jkt) => jkt,
            Err(error) => return self.error_redirect(request, error).await,
        };
        match self.issue(request, &identity, dpop_jkt, input).await {
            Ok(outcome) => outcome,
            Err(error) => self.error_redirect(request, error).await,
        }
    }

    // -------------------------------------------------------------------------
    // Interaction parking
    // -------------------------------------------------------------------------

    async fn park_and_redirect(
        &self,
        payload: ChallengePayload,
        ui: UiKind,
    ) -> AuthorizeOutcome {
        let ttl = self.config.ttl.challenge.as_secs() as i64;
        let record = ChallengeRecord::new(payload, ttl);
        let challenge_id = record.id.clone();
        if let Err(e) = self.challenges.store_challenge(record).await {
            tracing::error!(error = %e, "failed to park authorization request");
            return AuthorizeOutcome::ServerError(AuthError::internal("challenge store failed"));
        }

        let configured = match ui {
            UiKind::Login => self.config.ui.login_url.clone(),
            UiKind::Reauth => self.config.ui.reauth_url.clone(),
            UiKind::Consent => self.config.ui.consent_url.clone(),
        };
        if let Some(base) = configured {
            let sep = if base.contains('?') { '&' } else { '?' };
            return AuthorizeOutcome::UiRedirect(format!("{base}{sep}challenge={challenge_id}"));
        }
        if self.config.features.conformance_mode {
            let path = match ui {
                UiKind::Login => "/flow/login",
                UiKind::Reauth => "/flow/confirm",
                UiKind::Consent => "/auth/consent",
            };
            return AuthorizeOutcome::UiRedirect(format!(
                "{}{path}?challenge={challenge_id}",
                self.config.issuer
            ));
        }
        AuthorizeOutcome::ServerError(AuthError::configuration(
            "no interaction UI is configured and conformance mode is disabled",
        ))
    }

    // -------------------------------------------------------------------------
    // DPoP
    // -------------------------------------------------------------------------

    async fn resolve_dpop(
        &self,
        request: &ValidatedAuthRequest,
        input: &FlowInput,
    ) -> Result<Option<String>, AuthError> {
        let requires = request.client.dpop_bound_access_tokens;
        let Some(proof) = input.dpop_proof.as_deref() else {
            // PAR may already have captured the thumbprint.
            if let Some(jkt) = &request.snapshot.dpop_jkt {
                return Ok(Some(jkt.clone()));
            }
            if requires && self.config.features.dpop_strict {
                return Err(AuthError::invalid_dpop("DPoP proof is required"));
            }
            return Ok(None);
        };

        match validate_dpop_proof(
            proof,
            &input.method,
            &input.request_url,
            None,
            &self.dpop_jti,
            self.config.ttl.dpop_proof_max_age.as_secs() as i64,
        )
        .await
        {
            Ok(validation) => {
                if let Some(pushed) = &request.snapshot.dpop_jkt
                    && pushed != &validation.jkt
                {
                    return Err(AuthError::invalid_dpop(
                        "Proof key differs from the pushed thumbprint",
                    ));
                }
                Ok(Some(validation.jkt))
            }
            Err(error) => {
                if self.config.features.dpop_strict || requires {
                    Err(error)
                } else {
                    tracing::warn!("ignoring invalid DPoP proof in non-strict mode");
                    Ok(None)
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Issuance
    // -------------------------------------------------------------------------

    async fn issue(
        &self,
        request: &ValidatedAuthRequest,
        identity: &ResolvedIdentity,
        dpop_jkt: Option<String>,
        input: &FlowInput,
    ) -> Result<AuthorizeOutcome, AuthError> {
        let snapshot = &request.snapshot;
        let response_type = request.response_type;
        let sid = identity.session_id.as_ref().map(ToString::to_string);
        let mut params = ResponseParams::new();

        // Authorization code.
        let code = if response_type.code {
            let shard = self.router.auth_code_shard(
                &identity.user_id,
                &request.client.client_id,
                identity.session_id.as_ref(),
            );
            let code = AuthCode::generate(shard);
            let record = AuthCodeRecord {
                client_id: request.client.client_id.clone(),
                redirect_uri: snapshot.redirect_uri.clone(),
                user_id: identity.user_id.clone(),
                scope: snapshot.scope.clone(),
                code_challenge: snapshot.code_challenge.clone(),
                code_challenge_method: snapshot.code_challenge_method.clone(),
                nonce: snapshot.nonce.clone(),
                state: snapshot.state.clone(),
                claims: snapshot.claims.clone(),
                authorization_details: snapshot.authorization_details.clone(),
                auth_time: identity.auth_time,
                acr: identity.acr.clone(),
                dpop_jkt: dpop_jkt.clone(),
                sid: sid.clone(),
                issued_at: now_unix(),
                expires_at: now_unix() + self.config.ttl.auth_code.as_secs() as i64,
            };
            self.auth_codes
                .store_code(&code, record)
                .await
                .map_err(|_| AuthError::internal("code store failed"))?;
            let code_str = code.to_string();
            params.set("code", code_str.clone());
            Some(code_str)
        } else {
            None
        };

        // Access token.
        let access_token = if response_type.token {
            let token = self
                .issuer
                .issue_access_token(
                    &identity.user_id,
                    &request.client.client_id,
                    &snapshot.scope,
                    Vec::new(),
                    dpop_jkt.clone(),
                    snapshot.authorization_details.clone(),
                    sid.clone(),
                )
                .await?;
            params.set("access_token", token.clone());
            params.set(
                "token_type",
                if dpop_jkt.is_some() { "DPoP" } else { "Bearer" },
            );
            params.set(
                "expires_in",
                self.config.ttl.access_token.as_secs().to_string(),
            );
            Some(token)
        } else {
            None
        };

        // ID token.
        if response_type.id_token {
            let extra = if !response_type.code && !response_type.token {
                // Pure id_token responses embed scope-based user claims and
                // essential claims; everything else defers to UserInfo.
                self.id_token_user_claims(identity, snapshot).await
            } else {
                serde_json::Map::new()
            };
            let id_token = self
                .issuer
                .issue_id_token(IdTokenParams {
                    user_id: identity.user_id.clone(),
                    client_id: request.client.client_id.clone(),
                    nonce: snapshot.nonce.clone(),
                    auth_time: Some(identity.auth_time),
                    sid: sid.clone(),
                    acr: identity.acr.clone(),
                    amr: identity.amr.clone(),
                    code: code.clone(),
                    access_token: access_token.clone(),
                    device_secret: None,
                    extra,
                })
                .await?;
            params.set("id_token", id_token);
        }

        // Session-client association for front-channel token delivery.
        if response_type.has_front_channel_tokens()
            && let Some(sid) = &sid
            && let Err(e) = self
                .session_clients
                .record(sid, &request.client.client_id)
                .await
        {
            tracing::warn!(error = %e, "failed to record session-client association");
        }

        // Envelope parameters.
        params.set_opt("state", snapshot.state.as_deref());
        params.set("iss", self.config.issuer.clone());

        // session_state, when it can be computed.
        let mut new_browser_state = None;
        if sid.is_some()
            && let Some(origin) = session_state::rp_origin(&snapshot.redirect_uri)
        {
            let browser_state = match &input.browser_state_cookie {
                Some(value) if !value.is_empty() => value.clone(),
                _ => {
                    let fresh = session_state::new_browser_state();
                    new_browser_state = Some(fresh.clone());
                    fresh
                }
            };
            params.set(
                "session_state",
                session_state::compute_session_state(
                    &request.client.client_id,
                    &origin,
                    &browser_state,
                ),
            );
        }

        if !identity.anonymous
            && let Err(e) = self.users.touch_last_login(&identity.user_id).await
        {
            tracing::debug!(error = %e, "failed to stamp last login");
        }

        let delivery = respond::deliver(
            request.response_mode,
            &snapshot.redirect_uri,
            params,
            &request.client,
            &self.issuer,
            &self.config.issuer,
            self.config.ttl.jarm.as_secs() as i64,
        )
        .await?;

        Ok(AuthorizeOutcome::Delivered {
            delivery,
            browser_state_cookie: new_browser_state,
        })
    }

    async fn id_token_user_claims(
        &self,
        identity: &ResolvedIdentity,
        snapshot: &AuthRequestSnapshot,
    ) -> serde_json::Map<String, serde_json::Value> {
        let mut extra = serde_json::Map::new();
        let core = self.users.find_core(&identity.user_id).await.ok().flatten();
        let pii = self.users.find_pii(&identity.user_id).await.ok().flatten();
        let (Some(core), Some(pii)) = (core, pii) else {
            return extra;
        };

        let info = UserInfo::from_scope(&core, &pii, &snapshot.scope);
        if let Ok(serde_json::Value::Object(map)) = serde_json::to_value(&info) {
            for (key, value) in map {
                if key != "sub" {
                    extra.insert(key, value);
                }
            }
        }

        // Essential claims from the claims parameter's id_token member.
        if let Some(essential) = snapshot
            .claims
            .as_ref()
            .and_then(|c| c.get("id_token"))
            .and_then(|v| v.as_object())
        {
            let full = UserInfo::from_scope(&core, &pii, "openid profile email phone address");
            let full = serde_json::to_value(&full).unwrap_or_default();
            for (claim, spec) in essential {
                let is_essential = spec
                    .as_object()
                    .and_then(|s| s.get("essential"))
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if is_essential
                    && !extra.contains_key(claim)
                    && let Some(value) = full.get(claim)
                    && !value.is_null()
                {
                    extra.insert(claim.clone(), value.clone());
                }
            }
        }
        extra
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    async fn lookup_session(&self, cookie: Option<&str>) -> Option<(SessionId, SessionRecord)> {
        let value = cookie?;
        // Non-sharded cookie values are legacy or foreign: treated as no
        // session rather than an error.
        let session_id = SessionId::parse(value).ok()?;
        let record = self.sessions.get_session(&session_id).await.ok()??;
        Some((session_id, record))
    }

    async fn verify_id_token_hint(&self, hint: &str) -> Option<String> {
        #[derive(serde::Deserialize)]
        struct HintClaims {
            sub: String,
        }
        let jwks = self.key_manager.verification_jwks().await;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.algorithms = vec![Algorithm::RS256, Algorithm::RS384, Algorithm::RS512];
        validation.validate_aud = false;
        // An expired hint still names the right subject.
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        match authrim_crypto::verify_with_jwks::<HintClaims>(hint, &jwks, &validation) {
            Ok(data) => Some(data.claims.sub),
            Err(_) => {
                tracing::debug!("id_token_hint failed verification");
                None
            }
        }
    }

    async fn error_redirect(
        &self,
        request: &ValidatedAuthRequest,
        error: AuthError,
    ) -> AuthorizeOutcome {
        let params = ResponseParams::for_error(
            &error,
            request.snapshot.state.as_deref(),
            &self.config.issuer,
        );
        self.deliver(
            request.response_mode,
            &request.snapshot.redirect_uri,
            params,
            &request.client,
            None,
        )
        .await
    }

    async fn deliver(
        &self,
        mode: ResponseMode,
        redirect_uri: &str,
        params: ResponseParams,
        client: &Arc<crate::types::Client>,
        browser_state_cookie: Option<String>,
    ) -> AuthorizeOutcome {
        match respond::deliver(
            mode,
            redirect_uri,
            params,
            client,
            &self.issuer,
            &self.config.issuer,
            self.config.ttl.jarm.as_secs() as i64,
        )
        .await
        {
            Ok(delivery) => AuthorizeOutcome::Delivered {
                delivery,
                browser_state_cookie,
            },
            Err(error) => AuthorizeOutcome::ServerError(error),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum UiKind {
    Login,
    Reauth,
    Consent,
}

/// Rebuilds the raw parameter map from a parked snapshot so a continuation
/// re-enters the same validation path as a fresh request.
fn snapshot_to_params(snapshot: &AuthRequestSnapshot) -> RawParams {
    let mut params = RawParams::new();
    params.insert("client_id".to_string(), snapshot.client_id.clone());
    params.insert("redirect_uri".to_string(), snapshot.redirect_uri.clone());
    params.insert("response_type".to_string(), snapshot.response_type.clone());
    params.insert("scope".to_string(), snapshot.scope.clone());
    let mut set = |key: &str, value: &Option<String>| {
        if let Some(value) = value {
            params.insert(key.to_string(), value.clone());
        }
    };
    set("state", &snapshot.state);
    set("nonce", &snapshot.nonce);
    set("response_mode", &snapshot.response_mode);
    set("code_challenge", &snapshot.code_challenge);
    set("code_challenge_method", &snapshot.code_challenge_method);
    set("acr_values", &snapshot.acr_values);
    set("login_hint", &snapshot.login_hint);
    if let Some(claims) = &snapshot.claims {
        params.insert("claims".to_string(), claims.to_string());
    }
    if let Some(details) = &snapshot.authorization_details {
        params.insert("authorization_details".to_string(), details.to_string());
    }
    if let Some(max_age) = snapshot.max_age {
        params.insert("max_age".to_string(), max_age.to_string());
    }
    // prompt deliberately not restored: the interaction it demanded has
    // happened, and restoring prompt=login would loop the reauth park.
    params
}
