//! Response delivery.
//!
//! The four delivery modes (query, fragment, form_post, JARM) share one
//! `ResponseParams` map. `iss` (RFC 9207) and the echoed `state` ride in
//! the map like any other parameter, for successes and errors alike.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use url::Url;

use authrim_core::time::now_unix;
use authrim_crypto::digest::base64url_encode;

use crate::error::AuthError;
use crate::request::types::ResponseMode;
use crate::token::issuer::TokenIssuer;
use crate::types::Client;

/// Ordered parameter map for an authorization response.
#[derive(Debug, Clone, Default)]
pub struct ResponseParams(pub BTreeMap<String, String>);

impl ResponseParams {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a parameter.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Inserts a parameter when the value is present.
    pub fn set_opt(&mut self, key: impl Into<String>, value: Option<impl Into<String>>) {
        if let Some(value) = value {
            self.set(key, value);
        }
    }

    /// Builds the error parameter set: `error`, optional description,
    /// echoed `state`, and `iss`.
    #[must_use]
    pub fn for_error(error: &AuthError, state: Option<&str>, issuer: &str) -> Self {
        let mut params = Self::new();
        params.set("error", error.oauth_error_code());
        let description = error.wire_description();
        if !description.is_empty() {
            params.set("error_description", description);
        }
        params.set_opt("state", state);
        params.set("iss", issuer);
        params
    }
}

/// A response ready for the HTTP layer.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// 302 redirect to the given URL.
    Redirect(String),
    /// Auto-submitting HTML form under a nonce-based CSP.
    FormPost {
        /// Rendered HTML document.
        html: String,
        /// CSP nonce for the `Content-Security-Policy` header.
        csp_nonce: String,
    },
}

/// JARM envelope claims: the response parameters plus the envelope members.
#[derive(Serialize)]
struct JarmClaims {
    iss: String,
    aud: String,
    exp: i64,
    iat: i64,
    #[serde(flatten)]
    params: BTreeMap<String, String>,
}

/// Builds the delivery for a response parameter map in the given mode.
///
/// For the JARM modes the parameters are wrapped in a signed JWT
/// (`iss`/`aud`/`exp`/`iat` envelope) and, when the client registered an
/// encryption key, additionally encrypted to it; the single `response`
/// parameter then travels in the underlying mode.
///
/// # Errors
///
/// Returns an internal error if the redirect URI cannot be assembled or the
/// JARM envelope cannot be signed.
pub async fn deliver(
    mode: ResponseMode,
    redirect_uri: &str,
    mut params: ResponseParams,
    client: &Arc<Client>,
    issuer: &Arc<TokenIssuer>,
    issuer_url: &str,
    jarm_ttl_secs: i64,
) -> Result<Delivery, AuthError> {
    if mode.is_jarm() {
        let now = now_unix();
        let claims = JarmClaims {
            iss: issuer_url.to_string(),
            aud: client.client_id.clone(),
            exp: now + jarm_ttl_secs,
            iat: now,
            params: params.0.clone(),
        };
        let mut response = issuer.sign_claims(&claims).await?;

        // Encrypt to the client when it registered an encryption key.
        if let Some(enc_key) = client
            .jwks
            .as_ref()
            .and_then(|jwks| jwks.keys.iter().find(|k| k.use_.as_deref() == Some("enc")))
            && enc_key.kty == "RSA"
        {
            let decoding = enc_key
                .n
                .as_deref()
                .zip(enc_key.e.as_deref())
                .ok_or_else(|| AuthError::internal("client enc key missing members"))?;
            let public_key = rsa_public_from_components(decoding.0, decoding.1)?;
            response = authrim_crypto::encrypt_compact(
                response.as_bytes(),
                &public_key,
                enc_key.kid.as_deref(),
                Some("JWT"),
            )?;
        }

        let mut jarm_params = ResponseParams::new();
        jarm_params.set("response", response);
        params = jarm_params;
    }

    match mode {
        ResponseMode::Query | ResponseMode::QueryJwt | ResponseMode::Jwt => {
            let mut url = Url::parse(redirect_uri)
                .map_err(|_| AuthError::internal("redirect URI unparseable at delivery"))?;
            for (key, value) in &params.0 {
                url.query_pairs_mut().append_pair(key, value);
            }
            Ok(Delivery::Redirect(url.to_string()))
        }
        ResponseMode::Fragment | ResponseMode::FragmentJwt => {
            let fragment = serde_urlencoded::to_string(&params.0)
                .map_err(|_| AuthError::internal("fragment encoding failed"))?;
            Ok(Delivery::Redirect(format!("{redirect_uri}#{fragment}")))
        }
        ResponseMode::FormPost | ResponseMode::FormPostJwt => {
            Ok(render_form_post(redirect_uri, &params))
        }
    }
}

fn rsa_public_from_components(n: &str, e: &str) -> Result<rsa::RsaPublicKey, AuthError> {
    let n = authrim_crypto::base64url_decode(n)?;
    let e = authrim_crypto::base64url_decode(e)?;
    rsa::RsaPublicKey::new(
        rsa::BigUint::from_bytes_be(&n),
        rsa::BigUint::from_bytes_be(&e),
    )
    .map_err(|_| AuthError::internal("client enc key is invalid"))
}

/// Renders the auto-submitting form_post page. The inline submit script is
/// authorized by a fresh CSP nonce; everything else is blocked.
fn render_form_post(action: &str, params: &ResponseParams) -> Delivery {
    use rand::RngCore;
    let mut nonce_bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let csp_nonce = base64url_encode(nonce_bytes);

    let mut fields = String::new();
    for (key, value) in &params.0 {
        fields.push_str(&format!(
            r#"<input type="hidden" name="{}" value="{}"/>"#,
            html_escape(key),
            html_escape(value)
        ));
    }
    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Submitting…</title></head>
<body onload="document.forms[0].submit()">
<form method="post" action="{}">
{}
<noscript><button type="submit">Continue</button></noscript>
</form>
<script nonce="{}">document.forms[0].submit();</script>
</body>
</html>"#,
        html_escape(action),
        fields,
        csp_nonce
    );
    Delivery::FormPost { html, csp_nonce }
}

/// Minimal HTML attribute/text escaping.
pub(crate) fn html_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use authrim_config::AuthrimConfig;
    use authrim_crypto::keys::SigningAlgorithm;
    use authrim_state::KeyManager;

    use crate::types::{ClientAuthMethod, DelegationMode};

    fn client() -> Arc<Client> {
        Arc::new(Client {
            client_id: "cid1".to_string(),
            name: "RP".to_string(),
            tenant_id: String::new(),
            redirect_uris: vec!["https://rp.example/cb".to_string()],
            post_logout_redirect_uris: Vec::new(),
            allowed_response_types: Vec::new(),
            requestable_scopes: Vec::new(),
            client_secret_hash: None,
            auth_method: ClientAuthMethod::None,
            jwks: None,
            jwks_uri: None,
            dpop_bound_access_tokens: false,
            skip_consent: false,
            allow_anonymous_prompt_none: false,
            delegation_mode: DelegationMode::None,
            frontchannel_logout_uri: None,
            backchannel_logout_uri: None,
            allowed_subject_token_clients: Vec::new(),
            active: true,
        })
    }

    fn issuer() -> Arc<TokenIssuer> {
        let config = Arc::new(AuthrimConfig::default());
        let key_manager = Arc::new(KeyManager::new(SigningAlgorithm::RS256, 3600, 7200));
        Arc::new(TokenIssuer::new(config, key_manager).unwrap())
    }

    #[tokio::test]
    async fn test_query_delivery() {
        let mut params = ResponseParams::new();
        params.set("code", "3_auth_abc");
        params.set("state", "xyz");
        params.set("iss", "https://issuer.example");

        let delivery = deliver(
            ResponseMode::Query,
            "https://rp.example/cb",
            params,
            &client(),
            &issuer(),
            "https://issuer.example",
            600,
        )
        .await
        .unwrap();

        let Delivery::Redirect(url) = delivery else {
            panic!("expected redirect");
        };
        assert!(url.starts_with("https://rp.example/cb?"));
        assert!(url.contains("code=3_auth_abc"));
        assert!(url.contains("state=xyz"));
        assert!(url.contains("iss=https%3A%2F%2Fissuer.example"));
        assert!(!url.contains('#'));
    }

    #[tokio::test]
    async fn test_fragment_delivery() {
        let mut params = ResponseParams::new();
        params.set("id_token", "a.b.c");
        params.set("state", "xyz");

        let delivery = deliver(
            ResponseMode::Fragment,
            "https://rp.example/cb",
            params,
            &client(),
            &issuer(),
            "https://issuer.example",
            600,
        )
        .await
        .unwrap();

        let Delivery::Redirect(url) = delivery else {
            panic!("expected redirect");
        };
        assert!(url.starts_with("https://rp.example/cb#"));
        assert!(url.contains("id_token=a.b.c"));
    }

    #[tokio::test]
    async fn test_form_post_escapes_and_nonces() {
        let mut params = ResponseParams::new();
        params.set("state", r#""><script>alert(1)</script>"#);

        let delivery = deliver(
            ResponseMode::FormPost,
            "https://rp.example/cb",
            params,
            &client(),
            &issuer(),
            "https://issuer.example",
            600,
        )
        .await
        .unwrap();

        let Delivery::FormPost { html, csp_nonce } = delivery else {
            panic!("expected form post");
        };
        assert!(!html.contains("<script>alert"));
        assert!(html.contains(&format!(r#"<script nonce="{csp_nonce}">"#)));
    }

    #[tokio::test]
    async fn test_jarm_wraps_params_in_signed_jwt() {
        let mut params = ResponseParams::new();
        params.set("code", "0_auth_abc");
        params.set("state", "xyz");

        let token_issuer = issuer();
        let delivery = deliver(
            ResponseMode::QueryJwt,
            "https://rp.example/cb",
            params,
            &client(),
            &token_issuer,
            "https://issuer.example",
            600,
        )
        .await
        .unwrap();

        let Delivery::Redirect(url) = delivery else {
            panic!("expected redirect");
        };
        let parsed = Url::parse(&url).unwrap();
        let (_, response) = parsed
            .query_pairs()
            .find(|(k, _)| k == "response")
            .expect("single response parameter");
        assert_eq!(parsed.query_pairs().count(), 1);

        // Verify the envelope and payload.
        let payload = response.split('.').nth(1).unwrap();
        let claims: serde_json::Value =
            serde_json::from_slice(&authrim_crypto::base64url_decode(payload).unwrap()).unwrap();
        assert_eq!(claims["iss"], "https://issuer.example");
        assert_eq!(claims["aud"], "cid1");
        assert_eq!(claims["code"], "0_auth_abc");
        assert_eq!(claims["state"], "xyz");
        assert!(claims["exp"].as_i64().unwrap() > now_unix());
    }

    #[test]
    fn test_error_params_always_carry_iss_and_state() {
        let params = ResponseParams::for_error(
            &AuthError::invalid_request("bad"),
            Some("xyz"),
            "https://issuer.example",
        );
        assert_eq!(params.0["error"], "invalid_request");
        assert_eq!(params.0["state"], "xyz");
        assert_eq!(params.0["iss"], "https://issuer.example");
    }
}
