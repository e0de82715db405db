//! # authrim-config
//!
//! Configuration for the Authrim authorization server.
//!
//! All sections deserialize with `#[serde(default)]`, so a minimal TOML file
//! only needs to override what differs from the defaults:
//!
//! ```toml
//! issuer = "https://issuer.example"
//! region = "us"
//!
//! [sharding]
//! shard_count = 16
//!
//! [ttl]
//! auth_code = "10m"
//! session = "24h"
//!
//! [features]
//! fapi2 = true
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    Parse {
        /// Description of the parse failure.
        message: String,
    },

    /// A configuration value is invalid.
    #[error("Invalid configuration value for {field}: {message}")]
    InvalidValue {
        /// The offending field path.
        field: String,
        /// Description of the problem.
        message: String,
    },
}

impl ConfigError {
    /// Creates a new `Parse` error.
    #[must_use]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Creates a new `InvalidValue` error.
    #[must_use]
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Root Authrim configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthrimConfig {
    /// Issuer URL, the `iss` claim of every token and error response.
    pub issuer: String,

    /// Region label embedded in PAR request URIs.
    pub region: String,

    /// Deployment generation tag embedded in PAR request URIs.
    pub generation: u32,

    /// Shard routing configuration.
    pub sharding: ShardingConfig,

    /// TTLs for all ephemeral state.
    pub ttl: TtlConfig,

    /// Cookie names and attributes.
    pub cookies: CookieConfig,

    /// Rate-limit buckets.
    pub rate_limits: RateLimitConfig,

    /// Feature flags.
    pub features: FeatureFlags,

    /// Tenant profiles keyed by tenant id. The `default` tenant applies to
    /// clients with no explicit tenant.
    pub tenants: HashMap<String, TenantProfile>,

    /// Token signing configuration.
    pub signing: SigningConfig,

    /// External UI endpoints for login/consent/reauth.
    pub ui: UiConfig,

    /// Email one-time-code settings.
    pub email_otp: EmailOtpConfig,

    /// Token-exchange limits.
    pub token_exchange: TokenExchangeConfig,

    /// Outbound fetch limits (JWKS, request_uri, did:web).
    pub outbound: OutboundConfig,
}

impl Default for AuthrimConfig {
    fn default() -> Self {
        Self {
            issuer: "http://localhost:8787".to_string(),
            region: "us".to_string(),
            generation: 1,
            sharding: ShardingConfig::default(),
            ttl: TtlConfig::default(),
            cookies: CookieConfig::default(),
            rate_limits: RateLimitConfig::default(),
            features: FeatureFlags::default(),
            tenants: HashMap::new(),
            signing: SigningConfig::default(),
            ui: UiConfig::default(),
            email_otp: EmailOtpConfig::default(),
            token_exchange: TokenExchangeConfig::default(),
            outbound: OutboundConfig::default(),
        }
    }
}

impl AuthrimConfig {
    /// Parses configuration from a TOML string and validates it.
    ///
    /// # Errors
    ///
    /// Returns a `Parse` error for malformed TOML or an `InvalidValue`
    /// error from validation.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidValue` error naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let issuer = url::Url::parse(&self.issuer)
            .map_err(|e| ConfigError::invalid_value("issuer", e.to_string()))?;
        if issuer.scheme() != "https" && issuer.scheme() != "http" {
            return Err(ConfigError::invalid_value(
                "issuer",
                "must be an http(s) URL",
            ));
        }
        if self.sharding.shard_count == 0 {
            return Err(ConfigError::invalid_value(
                "sharding.shard_count",
                "must be at least 1",
            ));
        }
        if !(1..=100).contains(&self.token_exchange.max_audiences) {
            return Err(ConfigError::invalid_value(
                "token_exchange.max_audiences",
                "must be between 1 and 100",
            ));
        }
        match self.cookies.same_site.as_str() {
            "lax" | "none" => {}
            other => {
                return Err(ConfigError::invalid_value(
                    "cookies.same_site",
                    format!("must be \"lax\" or \"none\", got \"{other}\""),
                ));
            }
        }
        Ok(())
    }

    /// Resolves the profile for a tenant, falling back to the built-in
    /// Human profile when neither the tenant nor `default` is configured.
    #[must_use]
    pub fn tenant_profile(&self, tenant_id: &str) -> TenantProfile {
        self.tenants
            .get(tenant_id)
            .or_else(|| self.tenants.get("default"))
            .cloned()
            .unwrap_or_default()
    }

    /// Effective PAR request TTL, tightened under FAPI 2.0.
    #[must_use]
    pub fn par_ttl(&self) -> Duration {
        if self.features.fapi2 {
            self.ttl.par_request_fapi
        } else {
            self.ttl.par_request
        }
    }
}

/// Shard routing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShardingConfig {
    /// Number of shards for each sharded actor family. Runtime-reloadable;
    /// identifiers embed their shard index so in-flight state survives a
    /// count change.
    pub shard_count: u32,

    /// Maximum live authorization codes per (user, client) pair before
    /// oldest-first eviction.
    pub max_codes_per_user: u32,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            shard_count: 8,
            max_codes_per_user: 1,
        }
    }
}

/// TTLs for ephemeral state.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TtlConfig {
    /// Authorization code lifetime.
    #[serde(with = "humantime_serde")]
    pub auth_code: Duration,

    /// Pushed authorization request lifetime.
    #[serde(with = "humantime_serde")]
    pub par_request: Duration,

    /// Pushed authorization request lifetime under FAPI 2.0.
    #[serde(with = "humantime_serde")]
    pub par_request_fapi: Duration,

    /// Login / consent / authenticator challenge lifetime.
    #[serde(with = "humantime_serde")]
    pub challenge: Duration,

    /// Browser session lifetime.
    #[serde(with = "humantime_serde")]
    pub session: Duration,

    /// Maximum age of a DPoP proof (`iat` window and jti retention).
    #[serde(with = "humantime_serde")]
    pub dpop_proof_max_age: Duration,

    /// JARM response JWT lifetime.
    #[serde(with = "humantime_serde")]
    pub jarm: Duration,

    /// Access token lifetime.
    #[serde(with = "humantime_serde")]
    pub access_token: Duration,

    /// ID token lifetime.
    #[serde(with = "humantime_serde")]
    pub id_token: Duration,

    /// Email-OTP session cookie lifetime.
    #[serde(with = "humantime_serde")]
    pub otp_session: Duration,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            auth_code: Duration::from_secs(600),
            par_request: Duration::from_secs(600),
            par_request_fapi: Duration::from_secs(60),
            challenge: Duration::from_secs(600),
            session: Duration::from_secs(24 * 3600),
            dpop_proof_max_age: Duration::from_secs(60),
            jarm: Duration::from_secs(600),
            access_token: Duration::from_secs(3600),
            id_token: Duration::from_secs(3600),
            otp_session: Duration::from_secs(300),
        }
    }
}

/// Cookie names and attributes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CookieConfig {
    /// Browser-session cookie (HttpOnly).
    pub session_cookie: String,

    /// Browser-state cookie for the session-check iframe (not HttpOnly).
    pub browser_state_cookie: String,

    /// Email-OTP binding cookie (HttpOnly).
    pub otp_session_cookie: String,

    /// SameSite attribute: "lax" or "none".
    pub same_site: String,

    /// Secure attribute. Disabled only for local development.
    pub secure: bool,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            session_cookie: "authrim_session".to_string(),
            browser_state_cookie: "authrim_browser_state".to_string(),
            otp_session_cookie: "authrim_otp_session".to_string(),
            same_site: "lax".to_string(),
            secure: true,
        }
    }
}

/// A fixed-window rate-limit bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RateLimitBucket {
    /// Window length in seconds.
    pub window_seconds: u64,
    /// Maximum requests per window.
    pub max_requests: u32,
}

/// Named rate-limit buckets.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Buckets keyed by name. Unknown names fall back to the `authorize`
    /// bucket's parameters.
    pub buckets: HashMap<String, RateLimitBucket>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut buckets = HashMap::new();
        buckets.insert(
            "authorize".to_string(),
            RateLimitBucket {
                window_seconds: 60,
                max_requests: 120,
            },
        );
        buckets.insert(
            "par".to_string(),
            RateLimitBucket {
                window_seconds: 60,
                max_requests: 60,
            },
        );
        buckets.insert(
            "email-code".to_string(),
            RateLimitBucket {
                window_seconds: 900,
                max_requests: 3,
            },
        );
        buckets.insert(
            "passkey".to_string(),
            RateLimitBucket {
                window_seconds: 60,
                max_requests: 30,
            },
        );
        buckets.insert(
            "did".to_string(),
            RateLimitBucket {
                window_seconds: 60,
                max_requests: 30,
            },
        );
        Self { buckets }
    }
}

impl RateLimitConfig {
    /// Looks up a bucket by name, falling back to `authorize`.
    #[must_use]
    pub fn bucket(&self, name: &str) -> RateLimitBucket {
        self.buckets
            .get(name)
            .or_else(|| self.buckets.get("authorize"))
            .copied()
            .unwrap_or(RateLimitBucket {
                window_seconds: 60,
                max_requests: 120,
            })
    }
}

/// Feature flags.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Enable fetching `request_uri` values over HTTPS
    /// (Request-Object-by-Reference). Disabled by default.
    pub request_uri_https_enabled: bool,

    /// Domain allowlist for HTTPS `request_uri` fetches. Empty list means
    /// no domain is allowed even when the feature is enabled.
    pub request_uri_allowed_domains: Vec<String>,

    /// Enable Rich Authorization Requests (`authorization_details`).
    pub rar_enabled: bool,

    /// Allowed `authorization_details` type values when RAR is enabled.
    pub rar_allowed_types: Vec<String>,

    /// FAPI 2.0 profile: PAR required, PKCE S256 mandatory, tightened TTLs.
    pub fapi2: bool,

    /// Serve built-in login/consent/reauth forms instead of redirecting to
    /// the configured UI URLs.
    pub conformance_mode: bool,

    /// Permit plain-HTTP redirect URIs. Development only.
    pub allow_insecure_http_redirects: bool,

    /// Accept unsigned (`alg=none`) request objects. Never honored in
    /// production builds; off by default everywhere.
    pub allow_unsigned_request_objects: bool,

    /// Abort authorization on any DPoP proof validation failure. When off,
    /// failures on clients that do not require DPoP are logged and the
    /// request continues unbound.
    pub dpop_strict: bool,

    /// Require the `state` parameter on every authorization request (it is
    /// always required for `response_type=none`).
    pub require_state: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            request_uri_https_enabled: false,
            request_uri_allowed_domains: Vec::new(),
            rar_enabled: false,
            rar_allowed_types: Vec::new(),
            fapi2: false,
            conformance_mode: false,
            allow_insecure_http_redirects: false,
            allow_unsigned_request_objects: false,
            dpop_strict: false,
            require_state: false,
        }
    }
}

/// Per-tenant execution profile.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TenantProfile {
    /// Whether this tenant keeps state in the sharded actors. The Human
    /// profile does; the AI-Ephemeral profile does not, which disables
    /// session creation and restricts response types to `code`.
    pub uses_do_for_state: bool,

    /// Response types this tenant may use. Empty means the full supported
    /// set.
    pub allowed_response_types: Vec<String>,
}

impl Default for TenantProfile {
    fn default() -> Self {
        Self {
            uses_do_for_state: true,
            allowed_response_types: Vec::new(),
        }
    }
}

impl TenantProfile {
    /// The AI-Ephemeral profile: stateless, `code` only.
    #[must_use]
    pub fn ai_ephemeral() -> Self {
        Self {
            uses_do_for_state: false,
            allowed_response_types: vec!["code".to_string()],
        }
    }

    /// Returns `true` if the profile allows the given response type.
    #[must_use]
    pub fn allows_response_type(&self, response_type: &str) -> bool {
        self.allowed_response_types.is_empty()
            || self
                .allowed_response_types
                .iter()
                .any(|rt| rt == response_type)
    }
}

/// Token signing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SigningConfig {
    /// Signing algorithm: "RS256", "RS384" or "RS512".
    pub algorithm: String,

    /// In-process cache TTL for the active signing key. Amortizes the
    /// PKCS#8 import cost.
    #[serde(with = "humantime_serde")]
    pub key_cache_ttl: Duration,

    /// Minimum interval between effective rotations; a rotate call inside
    /// the interval returns the current key.
    #[serde(with = "humantime_serde")]
    pub rotation_interval: Duration,

    /// How long archived keys stay in the JWKS after rotation.
    #[serde(with = "humantime_serde")]
    pub retirement_grace: Duration,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            algorithm: "RS256".to_string(),
            key_cache_ttl: Duration::from_secs(60),
            rotation_interval: Duration::from_secs(24 * 3600),
            retirement_grace: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// External UI endpoints.
///
/// When a URL is unset and conformance mode is off, flows needing that UI
/// fail with a configuration error rather than a broken redirect.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct UiConfig {
    /// Login UI URL.
    pub login_url: Option<String>,

    /// Consent UI URL.
    pub consent_url: Option<String>,

    /// Re-authentication UI URL.
    pub reauth_url: Option<String>,
}

/// Email one-time-code settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EmailOtpConfig {
    /// Number of digits in the code.
    pub code_length: u32,

    /// Minimum handler latency in milliseconds. Send and verify never
    /// return faster than this, defeating timing enumeration.
    pub floor_ms: u64,

    /// Random jitter added on top of the floor, in milliseconds.
    pub jitter_ms: u64,
}

impl Default for EmailOtpConfig {
    fn default() -> Self {
        Self {
            code_length: 6,
            floor_ms: 500,
            jitter_ms: 100,
        }
    }
}

/// Token-exchange limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TokenExchangeConfig {
    /// Maximum combined `resource` / `audience` parameters per request.
    pub max_audiences: u32,
}

impl Default for TokenExchangeConfig {
    fn default() -> Self {
        Self { max_audiences: 10 }
    }
}

/// Outbound fetch limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutboundConfig {
    /// Timeout for every outbound fetch.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Maximum response body size in bytes.
    pub max_body_bytes: usize,

    /// Maximum redirects followed per fetch.
    pub max_redirects: u32,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_body_bytes: 100 * 1024,
            max_redirects: 3,
        }
    }
}
