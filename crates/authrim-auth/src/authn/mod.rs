//! Alternative authenticators: passkey, email-OTP, DID, SAML.
//!
//! Each authenticator verifies a credential, then hands the result to the
//! [`LoginCoordinator`], which creates the browser session (Human profile
//! tenants only) and, when the login was reached from a parked
//! authorization request, mints the continuation challenge that re-enters
//! the authorization state machine.

pub mod did;
pub mod email_otp;
pub mod passkey;
pub mod saml;

use std::sync::Arc;

use authrim_config::AuthrimConfig;
use authrim_core::id::SessionId;
use authrim_core::time::now_unix;
use authrim_state::{
    ChallengeKind, ChallengePayload, ChallengeRecord, ChallengeStore, SessionRecord, SessionStore,
    ShardRouter,
};

use crate::AuthResult;
use crate::error::AuthError;
use crate::registry::ClientRegistry;

/// The result of a completed login.
#[derive(Debug, Clone)]
pub struct LoginCompletion {
    /// The new session id, to set as the session cookie. `None` for
    /// stateless (AI-Ephemeral) tenants.
    pub session_id: Option<SessionId>,
    /// Where to send the user agent to resume a parked authorization
    /// request, when the login was part of one.
    pub resume_url: Option<String>,
}

/// Creates sessions and continuation challenges after credential
/// verification.
pub struct LoginCoordinator {
    config: Arc<AuthrimConfig>,
    router: Arc<ShardRouter>,
    sessions: Arc<dyn SessionStore>,
    challenges: Arc<dyn ChallengeStore>,
    clients: Arc<ClientRegistry>,
}

impl LoginCoordinator {
    /// Creates the coordinator.
    #[must_use]
    pub fn new(
        config: Arc<AuthrimConfig>,
        router: Arc<ShardRouter>,
        sessions: Arc<dyn SessionStore>,
        challenges: Arc<dyn ChallengeStore>,
        clients: Arc<ClientRegistry>,
    ) -> Self {
        Self {
            config,
            router,
            sessions,
            challenges,
            clients,
        }
    }

    /// Completes a login for `user_id`.
    ///
    /// `login_challenge` is the parked Login challenge id when the
    /// authenticator was reached from an authorization flow; consuming it
    /// here (single use, type checked) is what authorizes the continuation.
    ///
    /// # Errors
    ///
    /// Returns the uniform challenge error when the login challenge cannot
    /// be consumed, or an internal error when session creation fails.
    pub async fn establish(
        &self,
        user_id: &str,
        amr: Vec<String>,
        acr: Option<String>,
        session_data: serde_json::Value,
        login_challenge: Option<&str>,
    ) -> AuthResult<LoginCompletion> {
        // Resolve the parked request first: its client decides whether a
        // session may be created at all.
        let parked = match login_challenge {
            Some(id) => {
                let record = self
                    .challenges
                    .consume_challenge(id, ChallengeKind::Login)
                    .await?;
                match record.payload {
                    ChallengePayload::Login { request } => Some(request),
                    _ => return Err(AuthError::InvalidChallenge),
                }
            }
            None => None,
        };

        let stateful = match &parked {
            Some(request) => {
                let client = self
                    .clients
                    .get(&request.client_id)
                    .await
                    .map_err(|_| AuthError::internal("client lookup failed"))?;
                match client {
                    Some(client) => self.config.tenant_profile(&client.tenant_id).uses_do_for_state,
                    None => true,
                }
            }
            // Direct API logins always get a session.
            None => true,
        };

        let session_id = if stateful {
            let id = self.router.new_session_id();
            let record = SessionRecord {
                user_id: user_id.to_string(),
                expires_at: now_unix() + self.config.ttl.session.as_secs() as i64,
                auth_time: now_unix(),
                amr,
                acr,
                anonymous: false,
                data: session_data,
            };
            self.sessions
                .create_session(&id, record)
                .await
                .map_err(|_| AuthError::internal("session creation failed"))?;
            Some(id)
        } else {
            None
        };

        let resume_url = match parked {
            Some(request) => {
                let continuation = ChallengeRecord::new(
                    ChallengePayload::Reauth {
                        request,
                        user_id: user_id.to_string(),
                    },
                    self.config.ttl.challenge.as_secs() as i64,
                );
                let id = continuation.id.clone();
                self.challenges
                    .store_challenge(continuation)
                    .await
                    .map_err(|_| AuthError::internal("continuation store failed"))?;
                Some(format!("{}/authorize?_confirmed={id}", self.config.issuer))
            }
            None => None,
        };

        Ok(LoginCompletion {
            session_id,
            resume_url,
        })
    }
}
