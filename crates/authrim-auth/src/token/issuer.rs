//! Access token, ID token and JARM issuance.
//!
//! All signed artefacts carry the active key's `kid`. The active key is
//! cached in-process for a short TTL to amortize the PKCS#8 import cost;
//! the cache is swapped atomically so readers never block.

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};

use authrim_config::AuthrimConfig;
use authrim_core::time::now_unix;
use authrim_crypto::digest::half_hash;
use authrim_crypto::keys::SigningAlgorithm;
use authrim_state::key_manager::{ActiveKey, KeyManager};

use crate::error::AuthError;

/// Confirmation claim for DPoP-bound tokens (RFC 9449).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confirmation {
    /// JWK thumbprint of the bound key.
    pub jkt: String,
}

/// Access token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// Issuer.
    pub iss: String,
    /// Subject (user or client id).
    pub sub: String,
    /// Audiences.
    pub aud: Vec<String>,
    /// Expiry (unix seconds).
    pub exp: i64,
    /// Issued at (unix seconds).
    pub iat: i64,
    /// Unique token id.
    pub jti: String,
    /// Granted scope.
    pub scope: String,
    /// Requesting client.
    pub client_id: String,
    /// DPoP binding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cnf: Option<Confirmation>,
    /// Granted authorization details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_details: Option<serde_json::Value>,
    /// Session id for logout correlation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
}

/// ID token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdTokenClaims {
    /// Issuer.
    pub iss: String,
    /// Subject.
    pub sub: String,
    /// Audience (the client).
    pub aud: String,
    /// Expiry (unix seconds).
    pub exp: i64,
    /// Issued at (unix seconds).
    pub iat: i64,
    /// When the user authenticated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_time: Option<i64>,
    /// Nonce from the authorization request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Authentication context class reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acr: Option<String>,
    /// Authentication methods.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amr: Option<Vec<String>>,
    /// Session id for logout correlation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    /// Left-half hash of the code delivered alongside.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub c_hash: Option<String>,
    /// Left-half hash of the access token delivered alongside.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub at_hash: Option<String>,
    /// Left-half hash of the device secret delivered alongside.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ds_hash: Option<String>,
    /// Scope-based user claims (pure `id_token` responses only) and
    /// essential claims from the `claims` parameter.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Inputs for ID token issuance.
#[derive(Debug, Clone, Default)]
pub struct IdTokenParams {
    /// Subject.
    pub user_id: String,
    /// Audience client.
    pub client_id: String,
    /// Nonce to echo.
    pub nonce: Option<String>,
    /// Authentication time.
    pub auth_time: Option<i64>,
    /// Session id.
    pub sid: Option<String>,
    /// ACR.
    pub acr: Option<String>,
    /// AMR.
    pub amr: Option<Vec<String>>,
    /// Code delivered alongside (hashed into `c_hash`).
    pub code: Option<String>,
    /// Access token delivered alongside (hashed into `at_hash`).
    pub access_token: Option<String>,
    /// Device secret delivered alongside (hashed into `ds_hash`).
    pub device_secret: Option<String>,
    /// Extra claims (scope-based user claims, essential claims).
    pub extra: serde_json::Map<String, serde_json::Value>,
}

struct CachedKey {
    key: ActiveKey,
    fetched_at: Instant,
}

/// The token issuer.
pub struct TokenIssuer {
    config: Arc<AuthrimConfig>,
    key_manager: Arc<KeyManager>,
    algorithm: SigningAlgorithm,
    cached_key: ArcSwapOption<CachedKey>,
}

impl TokenIssuer {
    /// Creates an issuer.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown signing algorithm.
    pub fn new(config: Arc<AuthrimConfig>, key_manager: Arc<KeyManager>) -> Result<Self, AuthError> {
        let algorithm = SigningAlgorithm::parse(&config.signing.algorithm)
            .map_err(|_| AuthError::configuration("unsupported signing algorithm"))?;
        Ok(Self {
            config,
            key_manager,
            algorithm,
            cached_key: ArcSwapOption::empty(),
        })
    }

    /// The configured signing algorithm.
    #[must_use]
    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }

    /// The active signing key, via the in-process cache.
    ///
    /// # Errors
    ///
    /// Returns an internal error if no key can be obtained.
    pub async fn active_key(&self) -> Result<ActiveKey, AuthError> {
        if let Some(cached) = self.cached_key.load_full()
            && cached.fetched_at.elapsed() < self.config.signing.key_cache_ttl
        {
            return Ok(cached.key.clone());
        }
        let key = self
            .key_manager
            .get_active_key()
            .await
            .map_err(|_| AuthError::internal("signing key unavailable"))?;
        self.cached_key.store(Some(Arc::new(CachedKey {
            key: key.clone(),
            fetched_at: Instant::now(),
        })));
        Ok(key)
    }

    /// Issues an access token. `aud` defaults to the issuer itself when the
    /// request named no resource.
    ///
    /// # Errors
    ///
    /// Returns an internal error on signing failure.
    pub async fn issue_access_token(
        &self,
        user_id: &str,
        client_id: &str,
        scope: &str,
        audiences: Vec<String>,
        dpop_jkt: Option<String>,
        authorization_details: Option<serde_json::Value>,
        sid: Option<String>,
    ) -> Result<String, AuthError> {
        let now = now_unix();
        let aud = if audiences.is_empty() {
            vec![self.config.issuer.clone()]
        } else {
            audiences
        };
        let claims = AccessTokenClaims {
            iss: self.config.issuer.clone(),
            sub: user_id.to_string(),
            aud,
            exp: now + self.config.ttl.access_token.as_secs() as i64,
            iat: now,
            jti: uuid::Uuid::new_v4().to_string(),
            scope: scope.to_string(),
            client_id: client_id.to_string(),
            cnf: dpop_jkt.map(|jkt| Confirmation { jkt }),
            authorization_details,
            sid,
        };
        let key = self.active_key().await?;
        Ok(key.key_pair.sign(&claims)?)
    }

    /// Issues an ID token, computing the binding hash claims for whatever
    /// artefacts are delivered alongside it.
    ///
    /// # Errors
    ///
    /// Returns an internal error on signing failure.
    pub async fn issue_id_token(&self, params: IdTokenParams) -> Result<String, AuthError> {
        let now = now_unix();
        let claims = IdTokenClaims {
            iss: self.config.issuer.clone(),
            sub: params.user_id,
            aud: params.client_id,
            exp: now + self.config.ttl.id_token.as_secs() as i64,
            iat: now,
            auth_time: params.auth_time,
            nonce: params.nonce,
            acr: params.acr,
            amr: params.amr,
            sid: params.sid,
            c_hash: params.code.as_deref().map(|c| half_hash(self.algorithm, c)),
            at_hash: params
                .access_token
                .as_deref()
                .map(|t| half_hash(self.algorithm, t)),
            ds_hash: params
                .device_secret
                .as_deref()
                .map(|s| half_hash(self.algorithm, s)),
            extra: params.extra,
        };
        let key = self.active_key().await?;
        Ok(key.key_pair.sign(&claims)?)
    }

    /// Signs an arbitrary claim set with the active key (JARM envelopes,
    /// logout tokens).
    ///
    /// # Errors
    ///
    /// Returns an internal error on signing failure.
    pub async fn sign_claims<T: Serialize>(&self, claims: &T) -> Result<String, AuthError> {
        let key = self.active_key().await?;
        Ok(key.key_pair.sign(claims)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use authrim_crypto::digest::base64url_decode;

    fn issuer() -> TokenIssuer {
        let config = Arc::new(AuthrimConfig::default());
        let key_manager = Arc::new(KeyManager::new(SigningAlgorithm::RS256, 3600, 7200));
        TokenIssuer::new(config, key_manager).unwrap()
    }

    fn decode_payload(token: &str) -> serde_json::Value {
        let payload = token.split('.').nth(1).unwrap();
        serde_json::from_slice(&base64url_decode(payload).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_access_token_shape() {
        let issuer = issuer();
        let token = issuer
            .issue_access_token("user-1", "cid1", "openid", Vec::new(), None, None, None)
            .await
            .unwrap();

        let claims = decode_payload(&token);
        assert_eq!(claims["iss"], "http://localhost:8787");
        assert_eq!(claims["aud"][0], "http://localhost:8787");
        assert_eq!(claims["client_id"], "cid1");
        assert_eq!(claims["scope"], "openid");
        assert!(claims["jti"].as_str().is_some());
        assert_eq!(
            claims["exp"].as_i64().unwrap() - claims["iat"].as_i64().unwrap(),
            3600
        );
        assert!(claims.get("cnf").is_none());
    }

    #[tokio::test]
    async fn test_dpop_bound_access_token_carries_cnf() {
        let issuer = issuer();
        let token = issuer
            .issue_access_token(
                "user-1",
                "cid1",
                "openid",
                Vec::new(),
                Some("thumb".to_string()),
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(decode_payload(&token)["cnf"]["jkt"], "thumb");
    }

    #[tokio::test]
    async fn test_id_token_hash_claims() {
        let issuer = issuer();
        let code = "3_auth_somecode";
        let access_token = "opaque-at";
        let token = issuer
            .issue_id_token(IdTokenParams {
                user_id: "user-1".to_string(),
                client_id: "cid1".to_string(),
                nonce: Some("n0".to_string()),
                auth_time: Some(1000),
                sid: Some("0_session_x".to_string()),
                code: Some(code.to_string()),
                access_token: Some(access_token.to_string()),
                ..IdTokenParams::default()
            })
            .await
            .unwrap();

        let claims = decode_payload(&token);
        assert_eq!(claims["nonce"], "n0");
        assert_eq!(claims["auth_time"], 1000);
        assert_eq!(
            claims["c_hash"],
            half_hash(SigningAlgorithm::RS256, code).as_str()
        );
        assert_eq!(
            claims["at_hash"],
            half_hash(SigningAlgorithm::RS256, access_token).as_str()
        );
        assert!(claims.get("ds_hash").is_none());
    }

    #[tokio::test]
    async fn test_id_token_kid_header_matches_key_manager() {
        let config = Arc::new(AuthrimConfig::default());
        let key_manager = Arc::new(KeyManager::new(SigningAlgorithm::RS256, 3600, 7200));
        let issuer = TokenIssuer::new(config, Arc::clone(&key_manager)).unwrap();

        let token = issuer
            .issue_id_token(IdTokenParams {
                user_id: "u".to_string(),
                client_id: "c".to_string(),
                ..IdTokenParams::default()
            })
            .await
            .unwrap();

        let header = jsonwebtoken::decode_header(&token).unwrap();
        let kids: Vec<String> = key_manager
            .get_all_public_keys()
            .await
            .into_iter()
            .filter_map(|k| k.kid)
            .collect();
        assert!(kids.contains(&header.kid.unwrap()));
    }

    #[tokio::test]
    async fn test_extra_claims_flattened() {
        let issuer = issuer();
        let mut extra = serde_json::Map::new();
        extra.insert("email".to_string(), serde_json::json!("u@example.com"));
        let token = issuer
            .issue_id_token(IdTokenParams {
                user_id: "u".to_string(),
                client_id: "c".to_string(),
                extra,
                ..IdTokenParams::default()
            })
            .await
            .unwrap();
        assert_eq!(decode_payload(&token)["email"], "u@example.com");
    }
}
