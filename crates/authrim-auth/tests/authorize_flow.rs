//! End-to-end authorization flow scenarios against the in-memory stores.

use std::collections::BTreeMap;
use std::sync::Arc;

use authrim_auth::flow::{AuthorizationService, AuthorizeOutcome, Delivery, FlowInput};
use authrim_auth::storage::{ClientStore, UserStore};
use authrim_auth::token::endpoint::{TokenRequest, TokenService};
use authrim_auth::token::issuer::TokenIssuer;
use authrim_auth::types::{Client, ClientAuthMethod, DelegationMode};
use authrim_auth::{AuthError, ClientRegistry, OutboundFetcher, RequestValidator};
use authrim_config::AuthrimConfig;
use authrim_core::id::SessionId;
use authrim_core::time::now_unix;
use authrim_crypto::digest::{base64url_decode, base64url_encode, sha256};
use authrim_crypto::keys::SigningAlgorithm;
use authrim_state::{
    InMemoryAuthCodeShards, InMemoryChallengeStore, InMemoryDpopJtiStore, InMemoryParRequestStore,
    InMemorySessionStore, KeyManager, ParRecord, ParRequestStore, SessionRecord, SessionStore,
    ShardRouter,
};
use authrim_store_memory::{
    MemoryClientStore, MemoryConsentStore, MemorySessionClientStore, MemoryUserStore,
};

const ISSUER: &str = "https://issuer.example";
const REDIRECT: &str = "https://rp.example/cb";
const PKCE_CHALLENGE: &str = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";
const PKCE_VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

struct Fixture {
    authorization: AuthorizationService,
    tokens: TokenService,
    sessions: Arc<InMemorySessionStore>,
    par_requests: Arc<InMemoryParRequestStore>,
    router: Arc<ShardRouter>,
    client_store: Arc<MemoryClientStore>,
    users: Arc<MemoryUserStore>,
}

fn test_client() -> Client {
    Client {
        client_id: "cid1".to_string(),
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

async fn fixture() -> Fixture {
    let mut config = AuthrimConfig::default();
    config.issuer = ISSUER.to_string();
    let config = Arc::new(config);

    let router = Arc::new(ShardRouter::new(8, "us", 1));
    let auth_codes = Arc::new(InMemoryAuthCodeShards::new(8, 1));
    let par_requests = Arc::new(InMemoryParRequestStore::new(8));
    let challenges = Arc::new(InMemoryChallengeStore::new(8));
    let sessions = Arc::new(InMemorySessionStore::new(8));
    let dpop_jti = Arc::new(InMemoryDpopJtiStore::new());
    let key_manager = Arc::new(KeyManager::new(SigningAlgorithm::RS256, 3600, 7200));

    let client_store = Arc::new(MemoryClientStore::new());
    client_store.insert(test_client()).await;
    let users = Arc::new(MemoryUserStore::new());
    let consents = Arc::new(MemoryConsentStore::new());
    let session_clients = Arc::new(MemorySessionClientStore::new());

    let clients = Arc::new(ClientRegistry::new(
        client_store.clone(),
        std::time::Duration::from_secs(60),
    ));
    let fetcher = Arc::new(OutboundFetcher::new(config.outbound.clone()).unwrap());

    let validator = Arc::new(RequestValidator::new(
        Arc::clone(&config),
        Arc::clone(&clients),
        par_requests.clone(),
        Arc::clone(&key_manager),
        Arc::clone(&fetcher),
    ));
    let token_issuer = Arc::new(TokenIssuer::new(Arc::clone(&config), Arc::clone(&key_manager)).unwrap());

    let authorization = AuthorizationService::new(
        Arc::clone(&config),
        Arc::clone(&router),
        validator,
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
    );
    let tokens = TokenService::new(
        Arc::clone(&config),
        Arc::clone(&clients),
        auth_codes,
        session_clients,
        dpop_jti,
        token_issuer,
        Arc::clone(&key_manager),
        fetcher,
    );

    Fixture {
        authorization,
        tokens,
        sessions,
        par_requests,
        router,
        client_store,
        users,
    }
}

impl Fixture {
    async fn live_session(&self, user_id: &str) -> SessionId {
        let id = self.router.new_session_id();
        self.sessions
            .create_session(
                &id,
                SessionRecord {
                    user_id: user_id.to_string(),
                    expires_at: now_unix() + 3600,
                    auth_time: now_unix(),
                    amr: vec!["pwd".to_string()],
                    acr: None,
                    anonymous: false,
                    data: serde_json::json!({}),
                },
            )
            .await
            .unwrap();
        id
    }

    async fn authorize(
        &self,
        params: BTreeMap<String, String>,
        session: Option<&SessionId>,
    ) -> AuthorizeOutcome {
        self.authorization
            .authorize(FlowInput {
                params,
                method: "GET".to_string(),
                request_url: format!("{ISSUER}/authorize"),
                session_cookie: session.map(ToString::to_string),
                browser_state_cookie: None,
                dpop_proof: None,
            })
            .await
    }
}

fn base_params() -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert("response_type".to_string(), "code".to_string());
    params.insert("client_id".to_string(), "cid1".to_string());
    params.insert("redirect_uri".to_string(), REDIRECT.to_string());
    params.insert("scope".to_string(), "openid".to_string());
    params.insert("state".to_string(), "xyz".to_string());
    params.insert("code_challenge".to_string(), PKCE_CHALLENGE.to_string());
    params.insert("code_challenge_method".to_string(), "S256".to_string());
    params.insert("nonce".to_string(), "n0".to_string());
    params
}

fn expect_redirect(outcome: AuthorizeOutcome) -> String {
    match outcome {
        AuthorizeOutcome::Delivered {
            delivery: Delivery::Redirect(url),
            ..
        } => url,
        AuthorizeOutcome::Delivered { .. } => panic!("expected redirect delivery"),
        AuthorizeOutcome::UiRedirect(url) => panic!("unexpected UI redirect to {url}"),
        AuthorizeOutcome::RenderError(e) => panic!("unexpected render error: {e}"),
        AuthorizeOutcome::ServerError(e) => panic!("unexpected server error: {e}"),
    }
}

fn query_params(url: &str) -> BTreeMap<String, String> {
    let parsed = url::Url::parse(url).unwrap();
    parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn fragment_params(url: &str) -> BTreeMap<String, String> {
    let parsed = url::Url::parse(url).unwrap();
    let fragment = parsed.fragment().expect("fragment expected");
    url::form_urlencoded::parse(fragment.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn decode_jwt_payload(token: &str) -> serde_json::Value {
    let payload = token.split('.').nth(1).unwrap();
    serde_json::from_slice(&base64url_decode(payload).unwrap()).unwrap()
}

// =============================================================================
// Canonical code + PKCE
// =============================================================================

#[tokio::test]
async fn canonical_code_flow_delivers_code_state_iss() {
    let f = fixture().await;
    let session = f.live_session("user-1").await;

    let url = expect_redirect(f.authorize(base_params(), Some(&session)).await);
    assert!(url.starts_with(&format!("{REDIRECT}?")));

    let params = query_params(&url);
    let code = params.get("code").expect("code delivered");
    assert!(code.len() >= 43);
    assert_eq!(params.get("state").map(String::as_str), Some("xyz"));
    assert_eq!(params.get("iss").map(String::as_str), Some(ISSUER));
    assert!(params.get("id_token").is_none());
}

// =============================================================================
// Invalid PKCE method
// =============================================================================

#[tokio::test]
async fn plain_pkce_method_rejected_via_redirect() {
    let f = fixture().await;
    let session = f.live_session("user-1").await;

    let mut params = base_params();
    params.insert("code_challenge_method".to_string(), "plain".to_string());

    let url = expect_redirect(f.authorize(params, Some(&session)).await);
    let params = query_params(&url);
    assert_eq!(params.get("error").map(String::as_str), Some("invalid_request"));
    assert!(
        params
            .get("error_description")
            .is_some_and(|d| d.contains("code_challenge_method"))
    );
    assert_eq!(params.get("state").map(String::as_str), Some("xyz"));
    assert_eq!(params.get("iss").map(String::as_str), Some(ISSUER));
    assert!(params.get("code").is_none());
}

// =============================================================================
// Hybrid code id_token
// =============================================================================

#[tokio::test]
async fn hybrid_flow_uses_fragment_and_binds_c_hash() {
    let f = fixture().await;
    let session = f.live_session("user-1").await;

    let mut params = base_params();
    params.insert("response_type".to_string(), "code id_token".to_string());

    let url = expect_redirect(f.authorize(params, Some(&session)).await);
    assert!(url.starts_with(&format!("{REDIRECT}#")));

    let params = fragment_params(&url);
    let code = params.get("code").expect("code delivered");
    let id_token = params.get("id_token").expect("id_token delivered");
    assert_eq!(params.get("state").map(String::as_str), Some("xyz"));
    assert_eq!(params.get("iss").map(String::as_str), Some(ISSUER));

    let claims = decode_jwt_payload(id_token);
    assert_eq!(claims["nonce"], "n0");
    assert_eq!(claims["sid"], session.to_string());
    assert!(claims["auth_time"].as_i64().is_some());

    // Invariant 4: c_hash is the left half of SHA-256 over the code.
    let digest = sha256(code.as_bytes());
    let expected = base64url_encode(&digest[..16]);
    assert_eq!(claims["c_hash"], expected.as_str());
}

// =============================================================================
// Pushed authorization requests
// =============================================================================

#[tokio::test]
async fn pushed_request_resolves_once_then_fails() {
    let f = fixture().await;
    let session = f.live_session("user-1").await;

    let uri = f.router.new_par_uri();
    let wire = uri.to_string();
    assert!(wire.starts_with("urn:ietf:params:oauth:request_uri:g1:us:"));

    f.par_requests
        .store_request(
            &uri,
            ParRecord {
                client_id: "cid1".to_string(),
                params: base_params(),
                dpop_jkt: None,
                created_at: now_unix(),
                expires_at: now_unix() + 600,
            },
        )
        .await
        .unwrap();

    let mut params = BTreeMap::new();
    params.insert("client_id".to_string(), "cid1".to_string());
    params.insert("request_uri".to_string(), wire.clone());
    let url = expect_redirect(f.authorize(params.clone(), Some(&session)).await);
    assert!(query_params(&url).contains_key("code"));

    // Second resolution of the same request_uri fails: single use.
    match f.authorize(params, Some(&session)).await {
        AuthorizeOutcome::RenderError(error) => {
            assert_eq!(error.oauth_error_code(), "invalid_request_uri");
        }
        _ => panic!("expected render error on reused request_uri"),
    }
}

// =============================================================================
// Invariants
// =============================================================================

#[tokio::test]
async fn second_code_redemption_fails() {
    let f = fixture().await;
    let session = f.live_session("user-1").await;

    let url = expect_redirect(f.authorize(base_params(), Some(&session)).await);
    let code = query_params(&url).remove("code").unwrap();

    let request = TokenRequest {
        grant_type: "authorization_code".to_string(),
        code: Some(code.clone()),
        redirect_uri: Some(REDIRECT.to_string()),
        code_verifier: Some(PKCE_VERIFIER.to_string()),
        client_id: Some("cid1".to_string()),
        ..TokenRequest::default()
    };

    let first = f
        .tokens
        .handle(request.clone(), None, &format!("{ISSUER}/token"))
        .await
        .unwrap();
    assert!(!first.access_token.is_empty());
    assert!(first.id_token.is_some());

    let second = f
        .tokens
        .handle(request, None, &format!("{ISSUER}/token"))
        .await;
    assert!(matches!(second.unwrap_err(), AuthError::InvalidGrant { .. }));
}

#[tokio::test]
async fn wrong_pkce_verifier_fails_redemption() {
    let f = fixture().await;
    let session = f.live_session("user-1").await;

    let url = expect_redirect(f.authorize(base_params(), Some(&session)).await);
    let code = query_params(&url).remove("code").unwrap();

    let request = TokenRequest {
        grant_type: "authorization_code".to_string(),
        code: Some(code),
        redirect_uri: Some(REDIRECT.to_string()),
        code_verifier: Some("wrong-verifier-wrong-verifier-wrong-verifier-wrong".to_string()),
        client_id: Some("cid1".to_string()),
        ..TokenRequest::default()
    };
    let result = f.tokens.handle(request, None, &format!("{ISSUER}/token")).await;
    assert!(matches!(result.unwrap_err(), AuthError::InvalidGrant { .. }));
}

#[tokio::test]
async fn id_token_without_nonce_rejected() {
    let f = fixture().await;
    let session = f.live_session("user-1").await;

    let mut params = base_params();
    params.insert("response_type".to_string(), "code id_token".to_string());
    params.remove("nonce");

    let url = expect_redirect(f.authorize(params, Some(&session)).await);
    let params = fragment_params(&url);
    assert_eq!(params.get("error").map(String::as_str), Some("invalid_request"));
    assert!(params.get("id_token").is_none());
    assert!(params.get("code").is_none());
}

#[tokio::test]
async fn unregistered_redirect_never_receives_a_code() {
    let f = fixture().await;
    let session = f.live_session("user-1").await;

    let mut params = base_params();
    params.insert(
        "redirect_uri".to_string(),
        "https://rp.example/cb/extra".to_string(),
    );

    match f.authorize(params, Some(&session)).await {
        AuthorizeOutcome::RenderError(error) => {
            assert_eq!(error.oauth_error_code(), "invalid_request");
        }
        AuthorizeOutcome::Delivered { .. } => panic!("must not deliver to an unregistered URI"),
        _ => panic!("expected render error"),
    }
}

#[tokio::test]
async fn no_session_parks_login_challenge() {
    let f = fixture().await;

    // No configured UI and conformance off: configuration error.
    match f.authorize(base_params(), None).await {
        AuthorizeOutcome::ServerError(error) => {
            assert_eq!(error.http_status(), 500);
        }
        _ => panic!("expected configuration error without a login UI"),
    }
}

#[tokio::test]
async fn prompt_none_without_session_is_login_required() {
    let f = fixture().await;

    let mut params = base_params();
    params.insert("prompt".to_string(), "none".to_string());

    let url = expect_redirect(f.authorize(params, None).await);
    let params = query_params(&url);
    assert_eq!(params.get("error").map(String::as_str), Some("login_required"));
    assert_eq!(params.get("iss").map(String::as_str), Some(ISSUER));
}

#[tokio::test]
async fn max_age_zero_with_stale_session_requires_reauth() {
    let f = fixture().await;

    // A session authenticated two seconds ago.
    let id = f.router.new_session_id();
    f.sessions
        .create_session(
            &id,
            SessionRecord {
                user_id: "user-1".to_string(),
                expires_at: now_unix() + 3600,
                auth_time: now_unix() - 2,
                amr: vec!["pwd".to_string()],
                acr: None,
                anonymous: false,
                data: serde_json::json!({}),
            },
        )
        .await
        .unwrap();

    let mut params = base_params();
    params.insert("max_age".to_string(), "0".to_string());

    // Stale under max_age=0, no reauth UI configured: configuration error
    // (with a UI configured this parks a reauth challenge instead).
    match f.authorize(params, Some(&id)).await {
        AuthorizeOutcome::ServerError(_) | AuthorizeOutcome::UiRedirect(_) => {}
        _ => panic!("expected a reauth interaction"),
    }
}

#[tokio::test]
async fn access_token_at_token_endpoint_carries_issuer_audience() {
    let f = fixture().await;
    let session = f.live_session("user-1").await;

    let url = expect_redirect(f.authorize(base_params(), Some(&session)).await);
    let code = query_params(&url).remove("code").unwrap();

    let response = f
        .tokens
        .handle(
            TokenRequest {
                grant_type: "authorization_code".to_string(),
                code: Some(code),
                redirect_uri: Some(REDIRECT.to_string()),
                code_verifier: Some(PKCE_VERIFIER.to_string()),
                client_id: Some("cid1".to_string()),
                ..TokenRequest::default()
            },
            None,
            &format!("{ISSUER}/token"),
        )
        .await
        .unwrap();

    let claims = decode_jwt_payload(&response.access_token);
    assert_eq!(claims["iss"], ISSUER);
    assert_eq!(claims["aud"][0], ISSUER);
    assert_eq!(claims["client_id"], "cid1");
    assert_eq!(claims["sub"], "user-1");

    // The ID token's at_hash binds the access token.
    let id_claims = decode_jwt_payload(&response.id_token.unwrap());
    let digest = sha256(response.access_token.as_bytes());
    assert_eq!(id_claims["at_hash"], base64url_encode(&digest[..16]).as_str());
}

#[tokio::test]
async fn code_survives_shard_count_reload() {
    let f = fixture().await;
    let session = f.live_session("user-1").await;

    let url = expect_redirect(f.authorize(base_params(), Some(&session)).await);
    let code = query_params(&url).remove("code").unwrap();

    // Shard count changes mid-flight; the embedded index keeps the code
    // resolvable.
    f.router.reload_shard_count(4);

    let response = f
        .tokens
        .handle(
            TokenRequest {
                grant_type: "authorization_code".to_string(),
                code: Some(code),
                redirect_uri: Some(REDIRECT.to_string()),
                code_verifier: Some(PKCE_VERIFIER.to_string()),
                client_id: Some("cid1".to_string()),
                ..TokenRequest::default()
            },
            None,
            &format!("{ISSUER}/token"),
        )
        .await;
    assert!(response.is_ok());
}

#[tokio::test]
async fn session_state_emitted_with_session_and_origin() {
    let f = fixture().await;
    let session = f.live_session("user-1").await;

    match f.authorize(base_params(), Some(&session)).await {
        AuthorizeOutcome::Delivered {
            delivery: Delivery::Redirect(url),
            browser_state_cookie,
        } => {
            let params = query_params(&url);
            let session_state = params.get("session_state").expect("session_state emitted");
            assert!(session_state.contains('.'));
            assert!(browser_state_cookie.is_some(), "fresh browser state minted");
        }
        _ => panic!("expected delivery"),
    }
}

#[tokio::test]
async fn users_are_untouched_by_flow_errors() {
    // Regression guard: a rejected request must not provision users.
    let f = fixture().await;
    let mut params = base_params();
    params.insert("scope".to_string(), String::new());
    let session = f.live_session("user-1").await;
    let _ = f.authorize(params, Some(&session)).await;
    assert!(f.users.find_id_by_email("ghost@example.com").await.unwrap().is_none());
    // Client registry still serves the registered client.
    assert!(f.client_store.find_by_client_id("cid1").await.unwrap().is_some());
}
