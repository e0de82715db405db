//! Email one-time codes.
//!
//! A six-digit code is mailed to the address and only its keyed hash is
//! stored: `HMAC-SHA256(server_key, email ‖ otp_session ‖ issued_at ‖ code)`.
//! The browser is bound to the attempt by an HttpOnly cookie whose value is
//! the challenge id. Send and verify both run under a latency floor with
//! jitter so response timing reveals nothing about address existence or
//! code correctness, and every verify failure surfaces the same error.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use authrim_config::AuthrimConfig;
use authrim_core::time::now_unix;
use authrim_crypto::digest::{constant_time_eq, hmac_sha256};
use authrim_state::{
    ChallengeKind, ChallengePayload, ChallengeRecord, ChallengeStore, RateLimiter,
};

use crate::AuthResult;
use crate::authn::{LoginCompletion, LoginCoordinator};
use crate::error::AuthError;
use crate::storage::{NewUser, UserStore};

/// Email delivery is an external collaborator.
#[async_trait]
pub trait OtpMailer: Send + Sync {
    /// Sends the code to the address. The code must not be logged.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery fails.
    async fn send_code(&self, email: &str, code: &str) -> AuthResult<()>;
}

/// Result of a send: the cookie value binding the browser to the attempt.
#[derive(Debug, Clone)]
pub struct OtpSendResult {
    /// Challenge id, set as the `authrim_otp_session` cookie.
    pub otp_session: String,
}

/// The email-OTP authenticator.
pub struct EmailOtpService {
    config: Arc<AuthrimConfig>,
    challenges: Arc<dyn ChallengeStore>,
    rate_limiter: Arc<dyn RateLimiter>,
    users: Arc<dyn UserStore>,
    coordinator: Arc<LoginCoordinator>,
    mailer: Arc<dyn OtpMailer>,
    otp_key: Vec<u8>,
}

impl EmailOtpService {
    /// Creates the service. `otp_key` is the server-held HMAC key.
    #[must_use]
    pub fn new(
        config: Arc<AuthrimConfig>,
        challenges: Arc<dyn ChallengeStore>,
        rate_limiter: Arc<dyn RateLimiter>,
        users: Arc<dyn UserStore>,
        coordinator: Arc<LoginCoordinator>,
        mailer: Arc<dyn OtpMailer>,
        otp_key: Vec<u8>,
    ) -> Self {
        Self {
            config,
            challenges,
            rate_limiter,
            users,
            coordinator,
            mailer,
            otp_key,
        }
    }

    /// Issues and mails a code.
    ///
    /// # Errors
    ///
    /// Returns `RateLimited` past the per-address budget; everything else
    /// collapses to the uniform challenge error.
    pub async fn send(&self, email: &str) -> AuthResult<OtpSendResult> {
        let started = Instant::now();
        let result = self.send_inner(email).await;
        self.latency_floor(started).await;
        result
    }

    async fn send_inner(&self, email: &str) -> AuthResult<OtpSendResult> {
        let bucket = self.config.rate_limits.bucket("email-code");
        let decision = self
            .rate_limiter
            .increment("email-code", &email.to_ascii_lowercase(), bucket)
            .await
            .map_err(|_| AuthError::internal("rate limiter unavailable"))?;
        if !decision.allowed {
            return Err(AuthError::RateLimited {
                retry_after: decision.retry_after,
            });
        }

        let code = self.generate_code();
        let issued_at = now_unix();
        let record = ChallengeRecord::new(
            ChallengePayload::EmailCode {
                email: email.to_string(),
                code_hash: String::new(), // filled below; needs the id as salt
                otp_session_id: String::new(),
                issued_at,
            },
            self.config.ttl.otp_session.as_secs() as i64,
        );
        let otp_session = record.id.clone();
        let code_hash = self.hash_code(email, &otp_session, issued_at, &code);
        let record = ChallengeRecord {
            payload: ChallengePayload::EmailCode {
                email: email.to_string(),
                code_hash,
                otp_session_id: otp_session.clone(),
                issued_at,
            },
            ..record
        };

        self.challenges
            .store_challenge(record)
            .await
            .map_err(|_| AuthError::internal("challenge store failed"))?;
        self.mailer
            .send_code(email, &code)
            .await
            .map_err(|_| AuthError::internal("mail delivery failed"))?;

        tracing::info!(email_domain = email.split('@').nth(1).unwrap_or(""), "sent email code");
        Ok(OtpSendResult { otp_session })
    }

    /// Verifies a submitted code.
    ///
    /// `otp_session` is the cookie value from the send step;
    /// `login_challenge` resumes a parked authorization flow.
    ///
    /// # Errors
    ///
    /// Every failure mode (unknown session, expired challenge, wrong
    /// address, wrong code) returns the same uniform error.
    pub async fn verify(
        &self,
        otp_session: &str,
        email: &str,
        code: &str,
        login_challenge: Option<&str>,
    ) -> AuthResult<LoginCompletion> {
        let started = Instant::now();
        let result = self.verify_inner(otp_session, email, code, login_challenge).await;
        self.latency_floor(started).await;
        result
    }

    async fn verify_inner(
        &self,
        otp_session: &str,
        email: &str,
        code: &str,
        login_challenge: Option<&str>,
    ) -> AuthResult<LoginCompletion> {
        let record = self
            .challenges
            .consume_challenge(otp_session, ChallengeKind::EmailCode)
            .await?;
        let ChallengePayload::EmailCode {
            email: stored_email,
            code_hash,
            otp_session_id,
            issued_at,
        } = record.payload
        else {
            return Err(AuthError::InvalidChallenge);
        };

        let submitted_hash = self.hash_code(email, &otp_session_id, issued_at, code);
        let email_ok = constant_time_eq(
            stored_email.to_ascii_lowercase().as_bytes(),
            email.to_ascii_lowercase().as_bytes(),
        );
        let code_ok = constant_time_eq(submitted_hash.as_bytes(), code_hash.as_bytes());
        if !email_ok || !code_ok {
            return Err(AuthError::InvalidChallenge);
        }

        // JIT provisioning: a first-time address becomes a user here.
        let user_id = match self.users.find_id_by_email(email).await {
            Ok(Some(id)) => id,
            Ok(None) => self
                .users
                .create(NewUser {
                    tenant_id: "default".to_string(),
                    user_type: "human".to_string(),
                    email: Some(email.to_string()),
                    name: None,
                    email_verified: true,
                })
                .await
                .map_err(|_| AuthError::internal("user provisioning failed"))?,
            Err(_) => return Err(AuthError::internal("user lookup failed")),
        };

        self.coordinator
            .establish(
                &user_id,
                vec!["otp".to_string()],
                None,
                serde_json::json!({ "email": email }),
                login_challenge,
            )
            .await
    }

    fn generate_code(&self) -> String {
        use rand::Rng;
        let digits = self.config.email_otp.code_length.clamp(4, 10);
        let max = 10u64.pow(digits);
        let value = rand::rngs::OsRng.gen_range(0..max);
        format!("{value:0width$}", width = digits as usize)
    }

    fn hash_code(&self, email: &str, otp_session: &str, issued_at: i64, code: &str) -> String {
        let salt = format!("{}|{otp_session}|{issued_at}|{code}", email.to_ascii_lowercase());
        hex::encode(hmac_sha256(&self.otp_key, salt.as_bytes()))
    }

    /// Pads handler latency to the configured floor plus jitter.
    async fn latency_floor(&self, started: Instant) {
        use rand::Rng;
        let jitter = rand::rngs::OsRng.gen_range(0..=self.config.email_otp.jitter_ms);
        let floor = std::time::Duration::from_millis(self.config.email_otp.floor_ms + jitter);
        if let Some(remaining) = floor.checked_sub(started.elapsed()) {
            tokio::time::sleep(remaining).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use authrim_state::{InMemoryChallengeStore, InMemoryRateLimiter, InMemorySessionStore, ShardRouter};
    use tokio::sync::Mutex;

    use crate::registry::ClientRegistry;
    use crate::storage::ClientStore;
    use crate::types::{Client, UserCore, UserPii};

    struct NullClientStore;

    #[async_trait]
    impl ClientStore for NullClientStore {
        async fn find_by_client_id(&self, _client_id: &str) -> AuthResult<Option<Client>> {
            Ok(None)
        }
    }

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl OtpMailer for RecordingMailer {
        async fn send_code(&self, email: &str, code: &str) -> AuthResult<()> {
            self.sent.lock().await.push((email.to_string(), code.to_string()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeUserStore {
        users: Mutex<Vec<(String, String)>>, // (id, email)
    }

    #[async_trait]
    impl UserStore for FakeUserStore {
        async fn find_core(&self, user_id: &str) -> AuthResult<Option<UserCore>> {
            Ok(self.users.lock().await.iter().find(|(id, _)| id == user_id).map(
                |(id, _)| UserCore {
                    id: id.clone(),
                    tenant_id: "default".to_string(),
                    email_verified: true,
                    user_type: "human".to_string(),
                    is_active: true,
                    last_login_at: None,
                },
            ))
        }

        async fn find_pii(&self, _user_id: &str) -> AuthResult<Option<UserPii>> {
            Ok(None)
        }

        async fn find_id_by_email(&self, email: &str) -> AuthResult<Option<String>> {
            Ok(self
                .users
                .lock()
                .await
                .iter()
                .find(|(_, e)| e == email)
                .map(|(id, _)| id.clone()))
        }

        async fn create(&self, user: NewUser) -> AuthResult<String> {
            let id = format!("user-{}", self.users.lock().await.len() + 1);
            self.users
                .lock()
                .await
                .push((id.clone(), user.email.unwrap_or_default()));
            Ok(id)
        }

        async fn touch_last_login(&self, _user_id: &str) -> AuthResult<()> {
            Ok(())
        }

        async fn verify_password(
            &self,
            _email: &str,
            _password: &str,
        ) -> AuthResult<Option<String>> {
            Ok(None)
        }

        async fn verify_password_for_user(&self, _user_id: &str, _password: &str) -> AuthResult<bool> {
            Ok(false)
        }
    }

    struct Fixture {
        service: EmailOtpService,
        mailer: Arc<RecordingMailer>,
    }

    fn fixture() -> Fixture {
        let mut config = AuthrimConfig::default();
        // Keep the latency floor out of unit tests.
        config.email_otp.floor_ms = 0;
        config.email_otp.jitter_ms = 0;
        let config = Arc::new(config);

        let challenges: Arc<dyn ChallengeStore> = Arc::new(InMemoryChallengeStore::new(4));
        let router = Arc::new(ShardRouter::new(4, "us", 1));
        let sessions: Arc<dyn authrim_state::SessionStore> =
            Arc::new(InMemorySessionStore::new(4));
        let clients = Arc::new(ClientRegistry::new(
            Arc::new(NullClientStore),
            std::time::Duration::from_secs(60),
        ));
        let coordinator = Arc::new(LoginCoordinator::new(
            Arc::clone(&config),
            router,
            sessions,
            Arc::clone(&challenges),
            clients,
        ));
        let mailer = Arc::new(RecordingMailer::default());
        let service = EmailOtpService::new(
            config,
            challenges,
            Arc::new(InMemoryRateLimiter::new()),
            Arc::new(FakeUserStore::default()),
            coordinator,
            Arc::clone(&mailer) as Arc<dyn OtpMailer>,
            b"test-otp-key".to_vec(),
        );
        Fixture { service, mailer }
    }

    #[tokio::test]
    async fn test_send_then_verify() {
        let f = fixture();
        let sent = f.service.send("u@example.com").await.unwrap();
        let code = f.mailer.sent.lock().await[0].1.clone();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));

        let completion = f
            .service
            .verify(&sent.otp_session, "u@example.com", &code, None)
            .await
            .unwrap();
        assert!(completion.session_id.is_some());
        assert!(completion.resume_url.is_none());
    }

    #[tokio::test]
    async fn test_wrong_code_uniform_error() {
        let f = fixture();
        let sent = f.service.send("u@example.com").await.unwrap();

        let err = f
            .service
            .verify(&sent.otp_session, "u@example.com", "000001", None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidChallenge));
    }

    #[tokio::test]
    async fn test_verify_is_single_use() {
        let f = fixture();
        let sent = f.service.send("u@example.com").await.unwrap();
        let code = f.mailer.sent.lock().await[0].1.clone();

        // A wrong attempt burns the challenge entirely.
        let _ = f
            .service
            .verify(&sent.otp_session, "u@example.com", "999999", None)
            .await;
        let err = f
            .service
            .verify(&sent.otp_session, "u@example.com", &code, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidChallenge));
    }

    #[tokio::test]
    async fn test_rate_limit_three_per_window() {
        let f = fixture();
        f.service.send("u@x.example").await.unwrap();
        f.service.send("u@x.example").await.unwrap();
        f.service.send("u@x.example").await.unwrap();

        let err = f.service.send("u@x.example").await.unwrap_err();
        let AuthError::RateLimited { retry_after } = err else {
            panic!("expected rate limit");
        };
        assert!(retry_after > 0);
    }

    #[tokio::test]
    async fn test_stored_secret_is_hash_not_cleartext() {
        let f = fixture();
        let sent = f.service.send("u@example.com").await.unwrap();
        let code = f.mailer.sent.lock().await[0].1.clone();

        let record = f
            .service
            .challenges
            .get_challenge(&sent.otp_session)
            .await
            .unwrap()
            .unwrap();
        let ChallengePayload::EmailCode { code_hash, .. } = record.payload else {
            panic!("expected email code challenge");
        };
        assert_ne!(code_hash, code);
        assert!(!code_hash.contains(&code), "cleartext must never be stored");
        assert_eq!(code_hash.len(), 64, "hex-encoded HMAC-SHA256");
    }

    #[tokio::test]
    async fn test_latency_floor_applies() {
        let mut config = AuthrimConfig::default();
        config.email_otp.floor_ms = 50;
        config.email_otp.jitter_ms = 0;

        let f = fixture();
        let service = EmailOtpService { config: Arc::new(config), ..f.service };
        let started = Instant::now();
        // Verify against a nonexistent session still takes the floor.
        let _ = service.verify("missing", "u@example.com", "123456", None).await;
        assert!(started.elapsed() >= std::time::Duration::from_millis(50));
    }
}
