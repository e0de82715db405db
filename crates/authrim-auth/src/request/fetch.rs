//! SSRF-guarded outbound fetches.
//!
//! Everything the server fetches on behalf of a request (client JWKS
//! documents, HTTPS `request_uri` references, `did:web` documents) goes
//! through this fetcher: HTTPS only, bounded body size, bounded timeout,
//! manual redirect following with the guard re-applied at every hop, and
//! internal address ranges blocked.

use std::net::IpAddr;
use std::time::Duration;

use ipnetwork::IpNetwork;
use url::{Host, Url};

use authrim_config::OutboundConfig;

use crate::error::AuthError;

/// Blocked address ranges: loopback, RFC 1918, link-local, CGNAT,
/// unspecified, and their IPv6 equivalents.
const BLOCKED_RANGES: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "::1/128",
    "::/128",
    "fc00::/7",
    "fe80::/10",
];

/// Outbound HTTP fetcher with SSRF protections.
pub struct OutboundFetcher {
    client: reqwest::Client,
    config: OutboundConfig,
}

impl OutboundFetcher {
    /// Creates a fetcher. Redirects are followed manually so the guard can
    /// run against every hop.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the HTTP client cannot be constructed.
    pub fn new(config: OutboundConfig) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.timeout)
            .build()
            .map_err(|e| AuthError::internal(format!("http client: {e}")))?;
        Ok(Self { client, config })
    }

    /// The configured per-fetch timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Checks a URL against the SSRF policy.
    ///
    /// # Errors
    ///
    /// Returns `invalid_request` naming the violated rule.
    pub fn guard_url(&self, url: &Url, allowed_domains: Option<&[String]>) -> Result<(), AuthError> {
        if url.scheme() != "https" {
            return Err(AuthError::invalid_request(
                "Outbound references must use https",
            ));
        }
        match url.host() {
            Some(Host::Ipv4(ip)) => Self::guard_ip(IpAddr::V4(ip))?,
            Some(Host::Ipv6(ip)) => Self::guard_ip(IpAddr::V6(ip))?,
            Some(Host::Domain(domain)) => {
                let lower = domain.to_ascii_lowercase();
                if lower == "localhost" || lower.ends_with(".localhost") || lower.ends_with(".local")
                {
                    return Err(AuthError::invalid_request(
                        "Outbound references must not target internal hosts",
                    ));
                }
                if let Some(allowed) = allowed_domains {
                    let permitted = allowed.iter().any(|suffix| {
                        let suffix = suffix.to_ascii_lowercase();
                        lower == suffix || lower.ends_with(&format!(".{suffix}"))
                    });
                    if !permitted {
                        return Err(AuthError::invalid_request(
                            "Host is not on the allowlist",
                        ));
                    }
                }
            }
            None => {
                return Err(AuthError::invalid_request("URL has no host"));
            }
        }
        Ok(())
    }

    fn guard_ip(ip: IpAddr) -> Result<(), AuthError> {
        for range in BLOCKED_RANGES {
            let network: IpNetwork = range.parse().expect("static ranges parse");
            if network.contains(ip) {
                return Err(AuthError::invalid_request(
                    "Outbound references must not target internal addresses",
                ));
            }
        }
        Ok(())
    }

    /// Fetches a URL as text, following redirects manually with the guard
    /// re-applied per hop and the body size capped.
    ///
    /// # Errors
    ///
    /// Returns `invalid_request` for guard violations, oversized bodies and
    /// redirect-limit breaches; timeouts surface as `invalid_request` with
    /// a timeout description.
    pub async fn fetch_text(
        &self,
        url: &Url,
        allowed_domains: Option<&[String]>,
    ) -> Result<String, AuthError> {
        let mut current = url.clone();
        for _hop in 0..=self.config.max_redirects {
            self.guard_url(&current, allowed_domains)?;

            let response = self
                .client
                .get(current.clone())
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        AuthError::invalid_request("Outbound fetch timed out")
                    } else {
                        AuthError::invalid_request("Outbound fetch failed")
                    }
                })?;

            if response.status().is_redirection() {
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| AuthError::invalid_request("Redirect without location"))?;
                current = current
                    .join(location)
                    .map_err(|_| AuthError::invalid_request("Invalid redirect location"))?;
                continue;
            }

            if !response.status().is_success() {
                return Err(AuthError::invalid_request(format!(
                    "Outbound fetch returned status {}",
                    response.status().as_u16()
                )));
            }

            if let Some(length) = response.content_length()
                && length > self.config.max_body_bytes as u64
            {
                return Err(AuthError::invalid_request("Response body too large"));
            }
            let body = response
                .bytes()
                .await
                .map_err(|_| AuthError::invalid_request("Failed to read response body"))?;
            if body.len() > self.config.max_body_bytes {
                return Err(AuthError::invalid_request("Response body too large"));
            }
            return String::from_utf8(body.to_vec())
                .map_err(|_| AuthError::invalid_request("Response body is not UTF-8"));
        }
        Err(AuthError::invalid_request("Too many redirects"))
    }

    /// Fetches and parses a JWKS document.
    ///
    /// # Errors
    ///
    /// Propagates fetch errors; malformed documents yield `invalid_request`.
    pub async fn fetch_jwks(&self, url: &Url) -> Result<authrim_crypto::Jwks, AuthError> {
        let body = self.fetch_text(url, None).await?;
        serde_json::from_str(&body)
            .map_err(|_| AuthError::invalid_request("JWKS document is malformed"))
    }
}
