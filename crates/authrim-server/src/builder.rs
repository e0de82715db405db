//! Server construction.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use authrim_auth::authn::LoginCoordinator;
use authrim_auth::authn::did::DidService;
use authrim_auth::authn::email_otp::{EmailOtpService, OtpMailer};
use authrim_auth::authn::passkey::PasskeyService;
use authrim_auth::authn::saml::SamlService;
use authrim_auth::flow::AuthorizationService;
use authrim_auth::logout::LogoutService;
use authrim_auth::token::endpoint::TokenService;
use authrim_auth::token::issuer::TokenIssuer;
use authrim_auth::{AppState, AuthResult, ClientRegistry, OutboundFetcher, RequestValidator, build_router};
use authrim_config::AuthrimConfig;
use authrim_crypto::keys::SigningAlgorithm;
use authrim_state::{
    InMemoryAuthCodeShards, InMemoryChallengeStore, InMemoryDpopJtiStore, InMemoryParRequestStore,
    InMemoryRateLimiter, InMemorySessionStore, KeyManager, ShardRouter,
};
use authrim_store_memory::{
    MemoryClientStore, MemoryConsentStore, MemoryIdentityProviderStore, MemoryLinkedIdentityStore,
    MemoryPasskeyStore, MemorySamlReplayStore, MemorySessionClientStore, MemoryUserStore,
};

/// Mailer that logs delivery without the code; a real deployment plugs in
/// an SMTP or API-backed implementation.
struct LogOnlyMailer;

#[async_trait]
impl OtpMailer for LogOnlyMailer {
    async fn send_code(&self, email: &str, _code: &str) -> AuthResult<()> {
        tracing::info!(
            email_domain = email.split('@').nth(1).unwrap_or(""),
            "email code issued (no mailer configured)"
        );
        Ok(())
    }
}

/// Builds a [`Server`].
pub struct ServerBuilder {
    config: AuthrimConfig,
    bind: SocketAddr,
    mailer: Option<Arc<dyn OtpMailer>>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    /// Creates a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: AuthrimConfig::default(),
            bind: SocketAddr::from(([127, 0, 0, 1], 8787)),
            mailer: None,
        }
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: AuthrimConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the bind address.
    #[must_use]
    pub fn with_bind(mut self, bind: SocketAddr) -> Self {
        self.bind = bind;
        self
    }

    /// Sets the OTP mailer.
    #[must_use]
    pub fn with_mailer(mut self, mailer: Arc<dyn OtpMailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    /// Builds the server, constructing every actor and store.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid configuration.
    pub fn build(self) -> anyhow::Result<Server> {
        self.config.validate().context("configuration invalid")?;
        let config = Arc::new(self.config);
        let shard_count = config.sharding.shard_count;

        // Routing and ephemeral-state actors.
        let router = Arc::new(ShardRouter::new(
            shard_count,
            config.region.clone(),
            config.generation,
        ));
        let auth_codes = Arc::new(InMemoryAuthCodeShards::new(
            shard_count,
            config.sharding.max_codes_per_user,
        ));
        let par_requests = Arc::new(InMemoryParRequestStore::new(shard_count));
        let challenges = Arc::new(InMemoryChallengeStore::new(shard_count));
        let sessions = Arc::new(InMemorySessionStore::new(shard_count));
        let rate_limiter = Arc::new(InMemoryRateLimiter::new());
        let dpop_jti = Arc::new(InMemoryDpopJtiStore::new());
        let algorithm = SigningAlgorithm::parse(&config.signing.algorithm)
            .context("unsupported signing algorithm")?;
        let key_manager = Arc::new(KeyManager::new(
            algorithm,
            config.signing.rotation_interval.as_secs() as i64,
            config.signing.retirement_grace.as_secs() as i64,
        ));

        // Relational stores.
        let client_store = Arc::new(MemoryClientStore::new());
        let users = Arc::new(MemoryUserStore::new());
        let consents = Arc::new(MemoryConsentStore::new());
        let session_clients = Arc::new(MemorySessionClientStore::new());
        let passkey_store = Arc::new(MemoryPasskeyStore::new());
        let linked_identities = Arc::new(MemoryLinkedIdentityStore::new());
        let identity_providers = Arc::new(MemoryIdentityProviderStore::new());
        let saml_replay = Arc::new(MemorySamlReplayStore::new());

        let clients = Arc::new(ClientRegistry::new(
            client_store.clone(),
            std::time::Duration::from_secs(300),
        ));
        let fetcher = Arc::new(
            OutboundFetcher::new(config.outbound.clone())
                .map_err(|e| anyhow::anyhow!("{e}"))?,
        );

        // Services.
        let validator = Arc::new(RequestValidator::new(
            Arc::clone(&config),
            Arc::clone(&clients),
            par_requests.clone(),
            Arc::clone(&key_manager),
            Arc::clone(&fetcher),
        ));
        let token_issuer = Arc::new(
            TokenIssuer::new(Arc::clone(&config), Arc::clone(&key_manager))
                .map_err(|e| anyhow::anyhow!("{e}"))?,
        );
        let authorization = Arc::new(AuthorizationService::new(
            Arc::clone(&config),
            Arc::clone(&router),
            Arc::clone(&validator),
            Arc::clone(&clients),
            auth_codes.clone(),
            challenges.clone(),
            sessions.clone(),
            consents.clone(),
            users.clone(),
            session_clients.clone(),
            dpop_jti.clone(),
            Arc::clone(&token_issuer),
            Arc::clone(&key_manager),
        ));
        let tokens = Arc::new(TokenService::new(
            Arc::clone(&config),
            Arc::clone(&clients),
            auth_codes,
            session_clients.clone(),
            dpop_jti.clone(),
            Arc::clone(&token_issuer),
            Arc::clone(&key_manager),
            Arc::clone(&fetcher),
        ));
        let coordinator = Arc::new(LoginCoordinator::new(
            Arc::clone(&config),
            Arc::clone(&router),
            sessions.clone(),
            challenges.clone(),
            Arc::clone(&clients),
        ));

        // The OTP HMAC key is process-local; a multi-node deployment loads
        // a shared secret instead.
        let otp_key: Vec<u8> = {
            use rand::RngCore;
            let mut key = vec![0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut key);
            key
        };
        let mailer = self.mailer.unwrap_or_else(|| Arc::new(LogOnlyMailer));
        let email_otp = Arc::new(EmailOtpService::new(
            Arc::clone(&config),
            challenges.clone(),
            rate_limiter.clone(),
            users.clone(),
            Arc::clone(&coordinator),
            mailer,
            otp_key,
        ));
        let passkeys = Arc::new(PasskeyService::new(
            Arc::clone(&config),
            challenges.clone(),
            passkey_store,
            Arc::clone(&coordinator),
        ));
        let dids = Arc::new(DidService::new(
            Arc::clone(&config),
            challenges.clone(),
            linked_identities.clone(),
            Arc::clone(&coordinator),
            Arc::clone(&fetcher),
        ));
        let saml = Arc::new(SamlService::new(
            Arc::clone(&config),
            identity_providers,
            saml_replay,
            users.clone(),
            linked_identities,
            Arc::clone(&coordinator),
        ));
        let logout = Arc::new(
            LogoutService::new(
                Arc::clone(&config),
                sessions.clone(),
                session_clients.clone(),
                Arc::clone(&clients),
                Arc::clone(&token_issuer),
                Arc::clone(&key_manager),
            )
            .map_err(|e| anyhow::anyhow!("{e}"))?,
        );

        let state = AppState {
            config: Arc::clone(&config),
            authorization,
            tokens,
            router,
            par_requests,
            rate_limiter,
            challenges,
            sessions,
            consents,
            users,
            dpop_jti,
            clients,
            key_manager,
            token_issuer,
            coordinator,
            passkeys,
            email_otp,
            dids,
            saml,
            logout,
        };

        Ok(Server {
            state,
            bind: self.bind,
        })
    }
}

/// A runnable authorization server.
pub struct Server {
    state: AppState,
    bind: SocketAddr,
}

impl Server {
    /// The handler state, for programmatic access in tests.
    #[must_use]
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Runs until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if binding or serving fails.
    pub async fn run(self) -> anyhow::Result<()> {
        let app = build_router(self.state).layer(tower_http::trace::TraceLayer::new_for_http());
        let listener = tokio::net::TcpListener::bind(self.bind)
            .await
            .context("failed to bind")?;
        tracing::info!(addr = %self.bind, "authrim listening");
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
            })
            .await
            .context("server error")
    }
}
