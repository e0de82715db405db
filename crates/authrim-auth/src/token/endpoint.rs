//! Token endpoint: authorization-code redemption and token exchange.
//!
//! The code grant consumes the authorization code atomically (a second
//! redemption of the same code fails), verifies PKCE and the redirect URI
//! binding, enforces DPoP key binding, and only then mints tokens. Nothing
//! is committed until every check has passed.

use std::sync::Arc;

use argon2::password_hash::PasswordHash;
use argon2::{Argon2, PasswordVerifier};
use jsonwebtoken::{Algorithm, Validation};
use serde::{Deserialize, Serialize};

use authrim_config::AuthrimConfig;
use authrim_core::id::AuthCode;
use authrim_crypto::digest::{base64url_encode, sha256};
use authrim_crypto::verify_with_jwks;
use authrim_state::{AuthCodeStore, DpopJtiStore, KeyManager};

use crate::error::AuthError;
use crate::registry::ClientRegistry;
use crate::request::fetch::OutboundFetcher;
use crate::request::jar::client_jwks;
use crate::storage::SessionClientStore;
use crate::token::dpop::validate_dpop_proof;
use crate::token::issuer::{IdTokenParams, TokenIssuer};
use crate::types::{Client, ClientAuthMethod};

/// RFC 8693 token-exchange grant type.
pub const GRANT_TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
/// Subject token type for native SSO: an ID token.
pub const TOKEN_TYPE_ID_TOKEN: &str = "urn:ietf:params:oauth:token-type:id_token";
/// Actor token type for native SSO: a device secret.
pub const TOKEN_TYPE_DEVICE_SECRET: &str = "urn:openid:params:token-type:device-secret";
/// Access token type URN.
pub const TOKEN_TYPE_ACCESS_TOKEN: &str = "urn:ietf:params:oauth:token-type:access_token";

/// Parameters accepted at the token endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenRequest {
    /// Grant type.
    pub grant_type: String,
    /// Authorization code (code grant).
    #[serde(default)]
    pub code: Option<String>,
    /// Redirect URI the code was delivered to.
    #[serde(default)]
    pub redirect_uri: Option<String>,
    /// PKCE verifier.
    #[serde(default)]
    pub code_verifier: Option<String>,
    /// Client id (public clients and `client_secret_post`).
    #[serde(default)]
    pub client_id: Option<String>,
    /// Client secret (`client_secret_post`).
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Client assertion (`private_key_jwt`).
    #[serde(default)]
    pub client_assertion: Option<String>,
    /// Client assertion type.
    #[serde(default)]
    pub client_assertion_type: Option<String>,
    /// Subject token (token exchange).
    #[serde(default)]
    pub subject_token: Option<String>,
    /// Subject token type.
    #[serde(default)]
    pub subject_token_type: Option<String>,
    /// Actor token (token exchange).
    #[serde(default)]
    pub actor_token: Option<String>,
    /// Actor token type.
    #[serde(default)]
    pub actor_token_type: Option<String>,
    /// Requested downgrade scope (token exchange).
    #[serde(default)]
    pub scope: Option<String>,
    /// Requested resources. Multiple values are gathered by the handler.
    #[serde(default)]
    pub resource: Vec<String>,
    /// Requested audiences. Multiple values are gathered by the handler.
    #[serde(default)]
    pub audience: Vec<String>,
}

/// A successful token response.
#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    /// The access token.
    pub access_token: String,
    /// `Bearer`, or `DPoP` for bound tokens.
    pub token_type: String,
    /// Lifetime in seconds.
    pub expires_in: u64,
    /// Granted scope.
    pub scope: String,
    /// ID token, when `openid` was granted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// RFC 8693 issued token type, on exchange responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued_token_type: Option<String>,
}

/// The token endpoint service.
pub struct TokenService {
    config: Arc<AuthrimConfig>,
    clients: Arc<ClientRegistry>,
    auth_codes: Arc<dyn AuthCodeStore>,
    session_clients: Arc<dyn SessionClientStore>,
    dpop_jti: Arc<dyn DpopJtiStore>,
    issuer: Arc<TokenIssuer>,
    key_manager: Arc<KeyManager>,
    fetcher: Arc<OutboundFetcher>,
}

impl TokenService {
    /// Creates the service.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<AuthrimConfig>,
        clients: Arc<ClientRegistry>,
        auth_codes: Arc<dyn AuthCodeStore>,
        session_clients: Arc<dyn SessionClientStore>,
        dpop_jti: Arc<dyn DpopJtiStore>,
        issuer: Arc<TokenIssuer>,
        key_manager: Arc<KeyManager>,
        fetcher: Arc<OutboundFetcher>,
    ) -> Self {
        Self {
            config,
            clients,
            auth_codes,
            session_clients,
            dpop_jti,
            issuer,
            key_manager,
            fetcher,
        }
    }

    /// Handles a token request.
    ///
    /// `dpop_proof` is the `DPoP` header value if the client sent one;
    /// `endpoint_url` is the public URL of the token endpoint for `htu`
    /// matching.
    ///
    /// # Errors
    ///
    /// Returns the OAuth error to serialize into the JSON error envelope.
    pub async fn handle(
        &self,
        request: TokenRequest,
        dpop_proof: Option<&str>,
        endpoint_url: &str,
    ) -> Result<TokenResponse, AuthError> {
        let client = self.authenticate_client(&request).await?;

        match request.grant_type.as_str() {
            "authorization_code" => {
                self.code_grant(&client, &request, dpop_proof, endpoint_url)
                    .await
            }
            GRANT_TOKEN_EXCHANGE => self.exchange_grant(&client, &request).await,
            other => Err(AuthError::invalid_request(format!(
                "Unsupported grant_type: {other}"
            ))),
        }
    }

    // -------------------------------------------------------------------------
    // Client authentication
    // -------------------------------------------------------------------------

    /// Authenticates a client from token-endpoint-style parameters. Shared
    /// with the PAR endpoint, which uses the same client authentication.
    ///
    /// # Errors
    ///
    /// Returns `ClientAuth` on any authentication failure.
    pub async fn authenticate(&self, request: &TokenRequest) -> Result<Arc<Client>, AuthError> {
        self.authenticate_client(request).await
    }

    async fn authenticate_client(&self, request: &TokenRequest) -> Result<Arc<Client>, AuthError> {
        let client_id = request
            .client_id
            .as_deref()
            .ok_or_else(|| AuthError::client_auth("client_id is required"))?;
        let client = self
            .clients
            .get(client_id)
            .await
            .map_err(|_| AuthError::internal("client lookup failed"))?
            .filter(|c| c.active)
            .ok_or_else(|| AuthError::client_auth("Unknown client"))?;

        match client.auth_method {
            ClientAuthMethod::None => Ok(client),
            ClientAuthMethod::ClientSecretPost | ClientAuthMethod::ClientSecretBasic => {
                let secret = request
                    .client_secret
                    .as_deref()
                    .ok_or_else(|| AuthError::client_auth("client_secret is required"))?;
                let hash = client
                    .client_secret_hash
                    .as_deref()
                    .ok_or_else(|| AuthError::client_auth("Client has no secret"))?;
                let parsed = PasswordHash::new(hash)
                    .map_err(|_| AuthError::internal("stored secret hash is malformed"))?;
                Argon2::default()
                    .verify_password(secret.as_bytes(), &parsed)
                    .map_err(|_| AuthError::client_auth("Client authentication failed"))?;
                Ok(client)
            }
            ClientAuthMethod::PrivateKeyJwt => {
                let assertion = request
                    .client_assertion
                    .as_deref()
                    .ok_or_else(|| AuthError::client_auth("client_assertion is required"))?;
                if request.client_assertion_type.as_deref()
                    != Some("urn:ietf:params:oauth:client-assertion-type:jwt-bearer")
                {
                    return Err(AuthError::client_auth("Unsupported client_assertion_type"));
                }
                self.verify_client_assertion(&client, assertion).await?;
                Ok(client)
            }
        }
    }

    async fn verify_client_assertion(
        &self,
        client: &Arc<Client>,
        assertion: &str,
    ) -> Result<(), AuthError> {
        #[derive(Deserialize)]
        struct AssertionClaims {
            iss: String,
            sub: String,
            jti: String,
            exp: i64,
        }

        let jwks = client_jwks(client, &self.fetcher)
            .await
            .map_err(|_| AuthError::client_auth("Client keys are unavailable"))?;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.algorithms = vec![
            Algorithm::RS256,
            Algorithm::RS384,
            Algorithm::RS512,
            Algorithm::ES256,
            Algorithm::ES384,
            Algorithm::EdDSA,
        ];
        validation.set_audience(&[self.config.issuer.as_str()]);
        let data = verify_with_jwks::<AssertionClaims>(assertion, &jwks, &validation)
            .map_err(|_| AuthError::client_auth("Client assertion verification failed"))?;

        if data.claims.iss != client.client_id || data.claims.sub != client.client_id {
            return Err(AuthError::client_auth(
                "Client assertion iss/sub must equal client_id",
            ));
        }
        // Replay guard: the assertion's jti is tracked under a synthetic
        // per-client key for the assertion's own lifetime.
        let ttl = (data.claims.exp - authrim_core::time::now_unix()).max(60);
        let first_use = self
            .dpop_jti
            .mark_used(&format!("client-assertion:{}", client.client_id), &data.claims.jti, ttl)
            .await
            .map_err(|_| AuthError::internal("jti store unavailable"))?;
        if !first_use {
            return Err(AuthError::client_auth("Client assertion was already used"));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Authorization-code grant
    // -------------------------------------------------------------------------

    async fn code_grant(
        &self,
        client: &Arc<Client>,
        request: &TokenRequest,
        dpop_proof: Option<&str>,
        endpoint_url: &str,
    ) -> Result<TokenResponse, AuthError> {
        let code_str = request
            .code
            .as_deref()
            .ok_or_else(|| AuthError::invalid_request("code is required"))?;
        let code = AuthCode::parse(code_str)
            .map_err(|_| AuthError::invalid_grant("Invalid authorization code"))?;

        // Atomic consume: a second redemption of the same code fails here.
        let record = self
            .auth_codes
            .consume_code(&code)
            .await
            .map_err(|_| AuthError::invalid_grant("Invalid authorization code"))?;

        if record.client_id != client.client_id {
            return Err(AuthError::invalid_grant("Invalid authorization code"));
        }
        match request.redirect_uri.as_deref() {
            Some(uri) if uri == record.redirect_uri => {}
            _ => {
                return Err(AuthError::invalid_grant(
                    "redirect_uri does not match the authorization request",
                ));
            }
        }

        // PKCE.
        if let Some(challenge) = &record.code_challenge {
            let verifier = request
                .code_verifier
                .as_deref()
                .ok_or_else(|| AuthError::invalid_grant("code_verifier is required"))?;
            let computed = base64url_encode(sha256(verifier.as_bytes()));
            if !authrim_crypto::constant_time_eq(computed.as_bytes(), challenge.as_bytes()) {
                return Err(AuthError::invalid_grant("PKCE verification failed"));
            }
        }

        // DPoP binding. A code bound to a key can only be redeemed with a
        // proof of possession of the same key.
        let mut token_jkt = None;
        if record.dpop_jkt.is_some() || client.dpop_bound_access_tokens || dpop_proof.is_some() {
            let proof = dpop_proof
                .ok_or_else(|| AuthError::invalid_grant("DPoP proof is required for this code"))?;
            let validation = validate_dpop_proof(
                proof,
                "POST",
                endpoint_url,
                None,
                &self.dpop_jti,
                self.config.ttl.dpop_proof_max_age.as_secs() as i64,
            )
            .await?;
            if let Some(bound) = &record.dpop_jkt
                && bound != &validation.jkt
            {
                return Err(AuthError::invalid_grant(
                    "DPoP key does not match the bound key",
                ));
            }
            token_jkt = Some(validation.jkt);
        }

        let access_token = self
            .issuer
            .issue_access_token(
                &record.user_id,
                &client.client_id,
                &record.scope,
                Vec::new(),
                token_jkt.clone(),
                record.authorization_details.clone(),
                record.sid.clone(),
            )
            .await?;

        let id_token = if record.scope.split_whitespace().any(|s| s == "openid") {
            Some(
                self.issuer
                    .issue_id_token(IdTokenParams {
                        user_id: record.user_id.clone(),
                        client_id: client.client_id.clone(),
                        nonce: record.nonce.clone(),
                        auth_time: Some(record.auth_time),
                        sid: record.sid.clone(),
                        acr: record.acr.clone(),
                        access_token: Some(access_token.clone()),
                        ..IdTokenParams::default()
                    })
                    .await?,
            )
        } else {
            None
        };

        // Token issuance inside a session registers the RP for logout.
        if let Some(sid) = &record.sid
            && let Err(e) = self.session_clients.record(sid, &client.client_id).await
        {
            tracing::warn!(error = %e, "failed to record session-client association");
        }

        Ok(TokenResponse {
            access_token,
            token_type: if token_jkt.is_some() {
                "DPoP".to_string()
            } else {
                "Bearer".to_string()
            },
            expires_in: self.config.ttl.access_token.as_secs(),
            scope: record.scope,
            id_token,
            issued_token_type: None,
        })
    }

    // -------------------------------------------------------------------------
    // Token exchange (native SSO)
    // -------------------------------------------------------------------------

    async fn exchange_grant(
        &self,
        client: &Arc<Client>,
        request: &TokenRequest,
    ) -> Result<TokenResponse, AuthError> {
        // Native SSO shape: an ID token subject plus a device-secret actor.
        if request.subject_token_type.as_deref() != Some(TOKEN_TYPE_ID_TOKEN)
            || request.actor_token_type.as_deref() != Some(TOKEN_TYPE_DEVICE_SECRET)
        {
            return Err(AuthError::invalid_request(
                "Unsupported token exchange profile",
            ));
        }
        let subject_token = request
            .subject_token
            .as_deref()
            .ok_or_else(|| AuthError::invalid_request("subject_token is required"))?;
        if request.actor_token.as_deref().is_none_or(str::is_empty) {
            return Err(AuthError::invalid_request("actor_token is required"));
        }

        #[derive(Deserialize)]
        struct SubjectClaims {
            sub: String,
            aud: serde_json::Value,
            #[serde(default)]
            sid: Option<String>,
            #[serde(default)]
            auth_time: Option<i64>,
            #[serde(default)]
            scope: Option<String>,
            #[serde(default)]
            azp: Option<String>,
        }

        let jwks = self.key_manager.verification_jwks().await;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.algorithms = vec![Algorithm::RS256, Algorithm::RS384, Algorithm::RS512];
        validation.validate_aud = false;
        validation.set_issuer(&[self.config.issuer.as_str()]);
        let data = verify_with_jwks::<SubjectClaims>(subject_token, &jwks, &validation)
            .map_err(|_| AuthError::invalid_grant("Subject token verification failed"))?;
        let subject = data.claims;

        // Audience validation: the requesting client must appear in the
        // subject token's aud, or the subject token's client must be on the
        // requester's allowlist. An empty allowlist allows nothing.
        let audiences: Vec<String> = match &subject.aud {
            serde_json::Value::String(aud) => vec![aud.clone()],
            serde_json::Value::Array(values) => values
                .iter()
                .filter_map(|v| v.as_str().map(ToString::to_string))
                .collect(),
            _ => Vec::new(),
        };
        let subject_client = subject.azp.clone().or_else(|| audiences.first().cloned());
        let audience_ok = audiences.iter().any(|aud| aud == &client.client_id)
            || subject_client.as_deref().is_some_and(|subject_client| {
                client
                    .allowed_subject_token_clients
                    .iter()
                    .any(|allowed| allowed == subject_client)
            });
        if !audience_ok {
            return Err(AuthError::invalid_grant(
                "Subject token audience does not permit this client",
            ));
        }

        // Scope downgrade: requested ∩ subject ∩ client-allowed.
        let subject_scope = subject.scope.unwrap_or_else(|| "openid".to_string());
        let subject_scopes: Vec<&str> = subject_scope.split_whitespace().collect();
        let requested = request.scope.clone().unwrap_or_else(|| subject_scope.clone());
        let granted: Vec<&str> = requested
            .split_whitespace()
            .filter(|scope| subject_scopes.contains(scope))
            .filter(|scope| client.are_scopes_allowed(scope))
            .collect();
        if granted.is_empty() {
            return Err(AuthError::invalid_scope(
                "No requested scope survives the downgrade",
            ));
        }
        let granted = granted.join(" ");

        // resource / audience parameters, bounded.
        let max = self.config.token_exchange.max_audiences as usize;
        let mut target_audiences: Vec<String> = Vec::new();
        for value in request.resource.iter().chain(request.audience.iter()) {
            if target_audiences.len() >= max {
                return Err(AuthError::invalid_request(
                    "Too many resource/audience values",
                ));
            }
            if !target_audiences.contains(value) {
                target_audiences.push(value.clone());
            }
        }

        let access_token = self
            .issuer
            .issue_access_token(
                &subject.sub,
                &client.client_id,
                &granted,
                target_audiences,
                None,
                None,
                subject.sid.clone(),
            )
            .await?;

        let id_token = self
            .issuer
            .issue_id_token(IdTokenParams {
                user_id: subject.sub.clone(),
                client_id: client.client_id.clone(),
                auth_time: subject.auth_time,
                sid: subject.sid.clone(),
                access_token: Some(access_token.clone()),
                device_secret: request.actor_token.clone(),
                ..IdTokenParams::default()
            })
            .await?;

        if let Some(sid) = &subject.sid
            && let Err(e) = self.session_clients.record(sid, &client.client_id).await
        {
            tracing::warn!(error = %e, "failed to record session-client association");
        }

        Ok(TokenResponse {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: self.config.ttl.access_token.as_secs(),
            scope: granted,
            id_token: Some(id_token),
            issued_token_type: Some(TOKEN_TYPE_ACCESS_TOKEN.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argon2::password_hash::{PasswordHasher, SaltString};
    use async_trait::async_trait;

    use authrim_config::AuthrimConfig;
    use authrim_core::time::now_unix;
    use authrim_crypto::Jwks;
    use authrim_crypto::keys::{SigningAlgorithm, SigningKeyPair};
    use authrim_state::{AuthCodeRecord, InMemoryAuthCodeShards, InMemoryDpopJtiStore};

    use crate::AuthResult;
    use crate::registry::ClientRegistry;
    use crate::storage::ClientStore;
    use crate::types::DelegationMode;

    const ISSUER: &str = "https://issuer.example";
    const ENDPOINT: &str = "https://issuer.example/token";
    const REDIRECT: &str = "https://rp.example/cb";

    struct FixedClientStore {
        clients: Vec<Client>,
    }

    #[async_trait]
    impl ClientStore for FixedClientStore {
        async fn find_by_client_id(&self, client_id: &str) -> AuthResult<Option<Client>> {
            Ok(self
                .clients
                .iter()
                .find(|c| c.client_id == client_id)
                .cloned())
        }
    }

    struct NullSessionClients;

    #[async_trait]
    impl crate::storage::SessionClientStore for NullSessionClients {
        async fn record(&self, _session_id: &str, _client_id: &str) -> AuthResult<()> {
            Ok(())
        }

        async fn list_clients(&self, _session_id: &str) -> AuthResult<Vec<String>> {
            Ok(Vec::new())
        }

        async fn remove_session(&self, _session_id: &str) -> AuthResult<()> {
            Ok(())
        }
    }

    fn base_client(client_id: &str) -> Client {
        Client {
            client_id: client_id.to_string(),
            name: "Test RP".to_string(),
            tenant_id: String::new(),
            redirect_uris: vec![REDIRECT.to_string()],
            post_logout_redirect_uris: Vec::new(),
            allowed_response_types: Vec::new(),
            requestable_scopes: Vec::new(),
            client_secret_hash: None,
            auth_method: ClientAuthMethod::None,
            jwks: None,
            jwks_uri: None,
            dpop_bound_access_tokens: false,
            skip_consent: true,
            allow_anonymous_prompt_none: false,
            delegation_mode: DelegationMode::None,
            frontchannel_logout_uri: None,
            backchannel_logout_uri: None,
            allowed_subject_token_clients: Vec::new(),
            active: true,
        }
    }

    fn argon2_hash(secret: &str) -> String {
        let salt = SaltString::generate(&mut rand::rngs::OsRng);
        Argon2::default()
            .hash_password(secret.as_bytes(), &salt)
            .unwrap()
            .to_string()
    }

    struct Fixture {
        service: TokenService,
        auth_codes: Arc<InMemoryAuthCodeShards>,
        key_manager: Arc<KeyManager>,
    }

    fn fixture(clients: Vec<Client>) -> Fixture {
        let mut config = AuthrimConfig::default();
        config.issuer = ISSUER.to_string();
        let config = Arc::new(config);

        let auth_codes = Arc::new(InMemoryAuthCodeShards::new(4, 4));
        let key_manager = Arc::new(KeyManager::new(SigningAlgorithm::RS256, 3600, 7200));
        let registry = Arc::new(ClientRegistry::new(
            Arc::new(FixedClientStore { clients }),
            std::time::Duration::from_secs(60),
        ));
        let issuer =
            Arc::new(TokenIssuer::new(Arc::clone(&config), Arc::clone(&key_manager)).unwrap());
        let fetcher = Arc::new(
            OutboundFetcher::new(config.outbound.clone()).unwrap(),
        );

        let service = TokenService::new(
            config,
            registry,
            auth_codes.clone(),
            Arc::new(NullSessionClients),
            Arc::new(InMemoryDpopJtiStore::new()),
            issuer,
            Arc::clone(&key_manager),
            fetcher,
        );
        Fixture {
            service,
            auth_codes,
            key_manager,
        }
    }

    impl Fixture {
        async fn seed_code(&self, client_id: &str, dpop_jkt: Option<String>) -> String {
            let code = AuthCode::generate(0);
            let record = AuthCodeRecord {
                client_id: client_id.to_string(),
                redirect_uri: REDIRECT.to_string(),
                user_id: "user-1".to_string(),
                scope: "openid".to_string(),
                code_challenge: None,
                code_challenge_method: None,
                nonce: None,
                state: None,
                claims: None,
                authorization_details: None,
                auth_time: now_unix(),
                acr: None,
                dpop_jkt,
                sid: None,
                issued_at: now_unix(),
                expires_at: now_unix() + 600,
            };
            self.auth_codes.store_code(&code, record).await.unwrap();
            code.to_string()
        }
    }

    fn code_request(client_id: &str, code: &str) -> TokenRequest {
        TokenRequest {
            grant_type: "authorization_code".to_string(),
            code: Some(code.to_string()),
            redirect_uri: Some(REDIRECT.to_string()),
            client_id: Some(client_id.to_string()),
            ..TokenRequest::default()
        }
    }

    // -------------------------------------------------------------------------
    // DPoP proof helpers (ES256; JOSE signatures are the fixed-width r ‖ s form)
    // -------------------------------------------------------------------------

    struct ProofKey {
        signing_key: p256::ecdsa::SigningKey,
        jwk: authrim_crypto::Jwk,
    }

    fn proof_key() -> ProofKey {
        let signing_key = p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
        let point = signing_key.verifying_key().to_encoded_point(false);
        let jwk = authrim_crypto::Jwk {
            kty: "EC".to_string(),
            kid: None,
            use_: None,
            alg: Some("ES256".to_string()),
            n: None,
            e: None,
            crv: Some("P-256".to_string()),
            x: Some(base64url_encode(point.x().unwrap())),
            y: Some(base64url_encode(point.y().unwrap())),
        };
        ProofKey { signing_key, jwk }
    }

    fn make_proof(key: &ProofKey) -> String {
        use p256::ecdsa::signature::Signer;
        let header = serde_json::json!({
            "typ": "dpop+jwt",
            "alg": "ES256",
            "jwk": key.jwk,
        });
        let claims = serde_json::json!({
            "jti": uuid::Uuid::new_v4().to_string(),
            "htm": "POST",
            "htu": ENDPOINT,
            "iat": now_unix(),
        });
        let header_b64 = base64url_encode(serde_json::to_vec(&header).unwrap());
        let payload_b64 = base64url_encode(serde_json::to_vec(&claims).unwrap());
        let signing_input = format!("{header_b64}.{payload_b64}");
        let signature: p256::ecdsa::Signature = key.signing_key.sign(signing_input.as_bytes());
        format!("{signing_input}.{}", base64url_encode(signature.to_bytes()))
    }

    // -------------------------------------------------------------------------
    // DPoP-bound code redemption
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_dpop_bound_code_with_matching_key() {
        let f = fixture(vec![base_client("cid1")]);
        let key = proof_key();
        let jkt = key.jwk.thumbprint().unwrap();
        let code = f.seed_code("cid1", Some(jkt.clone())).await;

        let response = f
            .service
            .handle(code_request("cid1", &code), Some(&make_proof(&key)), ENDPOINT)
            .await
            .unwrap();
        assert_eq!(response.token_type, "DPoP");

        let payload = response.access_token.split('.').nth(1).unwrap();
        let claims: serde_json::Value =
            serde_json::from_slice(&authrim_crypto::base64url_decode(payload).unwrap()).unwrap();
        assert_eq!(claims["cnf"]["jkt"], jkt.as_str());
    }

    #[tokio::test]
    async fn test_dpop_bound_code_with_wrong_key_rejected() {
        let f = fixture(vec![base_client("cid1")]);
        let bound_key = proof_key();
        let other_key = proof_key();
        let code = f
            .seed_code("cid1", Some(bound_key.jwk.thumbprint().unwrap()))
            .await;

        let result = f
            .service
            .handle(
                code_request("cid1", &code),
                Some(&make_proof(&other_key)),
                ENDPOINT,
            )
            .await;
        assert!(matches!(result.unwrap_err(), AuthError::InvalidGrant { .. }));
    }

    #[tokio::test]
    async fn test_dpop_bound_code_without_proof_rejected() {
        let f = fixture(vec![base_client("cid1")]);
        let key = proof_key();
        let code = f.seed_code("cid1", Some(key.jwk.thumbprint().unwrap())).await;

        let result = f.service.handle(code_request("cid1", &code), None, ENDPOINT).await;
        assert!(matches!(result.unwrap_err(), AuthError::InvalidGrant { .. }));
    }

    // -------------------------------------------------------------------------
    // Client authentication
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_client_secret_post_wrong_then_right() {
        let mut client = base_client("cid1");
        client.auth_method = ClientAuthMethod::ClientSecretPost;
        client.client_secret_hash = Some(argon2_hash("correct-horse"));
        let f = fixture(vec![client]);
        let code = f.seed_code("cid1", None).await;

        // Wrong secret fails before the code is touched.
        let mut request = code_request("cid1", &code);
        request.client_secret = Some("battery-staple".to_string());
        let rejected = f.service.handle(request, None, ENDPOINT).await;
        assert!(matches!(rejected.unwrap_err(), AuthError::ClientAuth { .. }));

        // The right secret then redeems the same code.
        let mut request = code_request("cid1", &code);
        request.client_secret = Some("correct-horse".to_string());
        let response = f.service.handle(request, None, ENDPOINT).await.unwrap();
        assert_eq!(response.token_type, "Bearer");
        assert!(response.id_token.is_some());
    }

    #[tokio::test]
    async fn test_client_secret_missing_rejected() {
        let mut client = base_client("cid1");
        client.auth_method = ClientAuthMethod::ClientSecretBasic;
        client.client_secret_hash = Some(argon2_hash("s3cret"));
        let f = fixture(vec![client]);
        let code = f.seed_code("cid1", None).await;

        let result = f.service.handle(code_request("cid1", &code), None, ENDPOINT).await;
        assert!(matches!(result.unwrap_err(), AuthError::ClientAuth { .. }));
    }

    #[tokio::test]
    async fn test_private_key_jwt_assertion_and_replay() {
        let client_key = SigningKeyPair::generate(SigningAlgorithm::RS256).unwrap();
        let mut client = base_client("cid1");
        client.auth_method = ClientAuthMethod::PrivateKeyJwt;
        client.jwks = Some(Jwks {
            keys: vec![client_key.public_jwk()],
        });
        let f = fixture(vec![client]);

        let assertion = client_key
            .sign(&serde_json::json!({
                "iss": "cid1",
                "sub": "cid1",
                "aud": ISSUER,
                "jti": uuid::Uuid::new_v4().to_string(),
                "exp": now_unix() + 300,
            }))
            .unwrap();
        let with_assertion = |code: &str| TokenRequest {
            client_assertion: Some(assertion.clone()),
            client_assertion_type: Some(
                "urn:ietf:params:oauth:client-assertion-type:jwt-bearer".to_string(),
            ),
            ..code_request("cid1", code)
        };

        let code = f.seed_code("cid1", None).await;
        let response = f.service.handle(with_assertion(&code), None, ENDPOINT).await.unwrap();
        assert!(!response.access_token.is_empty());

        // The same assertion cannot authenticate a second request: its jti
        // is burned.
        let second = f.seed_code("cid1", None).await;
        let replay = f.service.handle(with_assertion(&second), None, ENDPOINT).await;
        assert!(matches!(replay.unwrap_err(), AuthError::ClientAuth { .. }));
    }

    #[tokio::test]
    async fn test_private_key_jwt_wrong_assertion_type_rejected() {
        let client_key = SigningKeyPair::generate(SigningAlgorithm::RS256).unwrap();
        let mut client = base_client("cid1");
        client.auth_method = ClientAuthMethod::PrivateKeyJwt;
        client.jwks = Some(Jwks {
            keys: vec![client_key.public_jwk()],
        });
        let f = fixture(vec![client]);
        let code = f.seed_code("cid1", None).await;

        let mut request = code_request("cid1", &code);
        request.client_assertion = Some("a.b.c".to_string());
        request.client_assertion_type = Some("urn:example:wrong".to_string());
        let result = f.service.handle(request, None, ENDPOINT).await;
        assert!(matches!(result.unwrap_err(), AuthError::ClientAuth { .. }));
    }

    // -------------------------------------------------------------------------
    // Token exchange
    // -------------------------------------------------------------------------

    async fn subject_token(f: &Fixture, aud: &str, scope: &str) -> String {
        let key = f.key_manager.get_active_key().await.unwrap();
        key.key_pair
            .sign(&serde_json::json!({
                "iss": ISSUER,
                "sub": "user-1",
                "aud": aud,
                "azp": aud,
                "sid": "0_session_9f8a0c6e-1234-4abc-8def-aaaaaaaaaaaa",
                "auth_time": now_unix() - 30,
                "scope": scope,
                "exp": now_unix() + 600,
            }))
            .unwrap()
    }

    fn exchange_request(client_id: &str, subject: &str, scope: Option<&str>) -> TokenRequest {
        TokenRequest {
            grant_type: GRANT_TOKEN_EXCHANGE.to_string(),
            client_id: Some(client_id.to_string()),
            subject_token: Some(subject.to_string()),
            subject_token_type: Some(TOKEN_TYPE_ID_TOKEN.to_string()),
            actor_token: Some("device-secret-value".to_string()),
            actor_token_type: Some(TOKEN_TYPE_DEVICE_SECRET.to_string()),
            scope: scope.map(ToString::to_string),
            ..TokenRequest::default()
        }
    }

    #[tokio::test]
    async fn test_exchange_scope_downgrade() {
        // Requester allowed via the subject client allowlist; granted scope
        // is requested ∩ subject ∩ client-allowed.
        let mut mobile = base_client("mobile");
        mobile.allowed_subject_token_clients = vec!["web".to_string()];
        mobile.requestable_scopes = vec!["openid".to_string(), "profile".to_string()];
        let f = fixture(vec![mobile]);

        let subject = subject_token(&f, "web", "openid profile email").await;
        let response = f
            .service
            .handle(
                exchange_request("mobile", &subject, Some("openid profile email offline_access")),
                None,
                ENDPOINT,
            )
            .await
            .unwrap();

        assert_eq!(response.scope, "openid profile");
        assert_eq!(
            response.issued_token_type.as_deref(),
            Some(TOKEN_TYPE_ACCESS_TOKEN)
        );
        let id_token = response.id_token.expect("exchange issues an ID token");
        let payload = id_token.split('.').nth(1).unwrap();
        let claims: serde_json::Value =
            serde_json::from_slice(&authrim_crypto::base64url_decode(payload).unwrap()).unwrap();
        // ds_hash binds the device secret delivered alongside.
        assert!(claims["ds_hash"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_exchange_requester_in_subject_audience() {
        // No allowlist needed when the subject token was issued to the
        // requesting client itself.
        let f = fixture(vec![base_client("web")]);
        let subject = subject_token(&f, "web", "openid").await;

        let response = f
            .service
            .handle(exchange_request("web", &subject, None), None, ENDPOINT)
            .await
            .unwrap();
        assert_eq!(response.scope, "openid");
    }

    #[tokio::test]
    async fn test_exchange_audience_denied() {
        // Requester is not in the subject token's aud and has an empty
        // allowlist; empty means "allow none", not "allow all".
        let f = fixture(vec![base_client("rogue")]);
        let subject = subject_token(&f, "web", "openid").await;

        let result = f
            .service
            .handle(exchange_request("rogue", &subject, None), None, ENDPOINT)
            .await;
        assert!(matches!(result.unwrap_err(), AuthError::InvalidGrant { .. }));
    }

    #[tokio::test]
    async fn test_exchange_no_surviving_scope_rejected() {
        let mut mobile = base_client("mobile");
        mobile.allowed_subject_token_clients = vec!["web".to_string()];
        mobile.requestable_scopes = vec!["openid".to_string()];
        let f = fixture(vec![mobile]);

        // Requested scope is outside the subject token's grant.
        let subject = subject_token(&f, "web", "openid").await;
        let result = f
            .service
            .handle(
                exchange_request("mobile", &subject, Some("payments")),
                None,
                ENDPOINT,
            )
            .await;
        assert!(matches!(
            result.unwrap_err(),
            AuthError::Validation { .. }
        ));
    }

    #[tokio::test]
    async fn test_exchange_audience_count_bounded() {
        let mut web = base_client("web");
        web.allowed_subject_token_clients = Vec::new();
        let f = fixture(vec![web]);
        let subject = subject_token(&f, "web", "openid").await;

        let mut request = exchange_request("web", &subject, None);
        request.resource = (0..11).map(|i| format!("https://rs{i}.example")).collect();
        let result = f.service.handle(request, None, ENDPOINT).await;
        assert!(matches!(result.unwrap_err(), AuthError::Validation { .. }));
    }
}
