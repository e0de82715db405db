//! The authorization request validation ladder.
//!
//! Source merging happens first (query/body, then PAR substitution, then
//! the request object), then validation. The ladder resolves the client and
//! redirect URI before anything else: failures after that point are
//! delivered as OAuth error redirects, failures before are rendered to the
//! user agent directly.

use std::collections::BTreeMap;
use std::sync::Arc;

use url::Url;

use authrim_config::{AuthrimConfig, TenantProfile};
use authrim_core::id::ParRequestUri;
use authrim_state::{AuthRequestSnapshot, KeyManager, ParRequestStore};

use crate::error::AuthError;
use crate::registry::ClientRegistry;
use crate::request::fetch::OutboundFetcher;
use crate::request::jar::process_request_object;
use crate::request::rar::validate_authorization_details;
use crate::request::types::{PromptSet, ResponseMode, ResponseTypeSet};
use crate::types::Client;

/// Raw authorization parameters after HTTP extraction, before merging.
pub type RawParams = BTreeMap<String, String>;

/// A fully validated authorization request.
#[derive(Clone)]
pub struct ValidatedAuthRequest {
    /// The resolved client.
    pub client: Arc<Client>,
    /// The client's tenant profile.
    pub tenant: TenantProfile,
    /// Normalized parameters, ready to park in a challenge.
    pub snapshot: AuthRequestSnapshot,
    /// Parsed response type.
    pub response_type: ResponseTypeSet,
    /// Effective response mode.
    pub response_mode: ResponseMode,
    /// Parsed prompt set.
    pub prompt: PromptSet,
}

/// A rejected authorization request, tagged with its delivery shape.
pub enum AuthorizeReject {
    /// No trustworthy redirect URI: render to the user agent.
    Render(AuthError),
    /// The redirect URI was validated before the failure: deliver the OAuth
    /// error to the client.
    Redirect {
        /// The failure.
        error: AuthError,
        /// Where to deliver it.
        redirect_uri: String,
        /// `state` to echo.
        state: Option<String>,
        /// Delivery mode for the error parameters.
        response_mode: ResponseMode,
        /// The resolved client (JARM error responses need its identity).
        client: Arc<Client>,
    },
}

impl AuthorizeReject {
    fn render(error: AuthError) -> Self {
        Self::Render(error)
    }
}

/// PKCE challenge shape: `^[A-Za-z0-9_-]{43,128}$`.
fn is_valid_code_challenge(challenge: &str) -> bool {
    static PATTERN: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r"^[A-Za-z0-9_-]{43,128}$").expect("static pattern"));
    PATTERN.is_match(challenge)
}

/// The request parser and validator.
pub struct RequestValidator {
    config: Arc<AuthrimConfig>,
    clients: Arc<ClientRegistry>,
    par_requests: Arc<dyn ParRequestStore>,
    key_manager: Arc<KeyManager>,
    fetcher: Arc<OutboundFetcher>,
}

impl RequestValidator {
    /// Creates a validator.
    #[must_use]
    pub fn new(
        config: Arc<AuthrimConfig>,
        clients: Arc<ClientRegistry>,
        par_requests: Arc<dyn ParRequestStore>,
        key_manager: Arc<KeyManager>,
        fetcher: Arc<OutboundFetcher>,
    ) -> Self {
        Self {
            config,
            clients,
            par_requests,
            key_manager,
            fetcher,
        }
    }

    /// Runs source merging and the full validation ladder.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthorizeReject`] tagged with the correct delivery
    /// shape for the failure point.
    pub async fn process(&self, params: RawParams) -> Result<ValidatedAuthRequest, AuthorizeReject> {
        self.process_inner(params, false).await
    }

    /// Re-validates a continuation restored from a parked snapshot. The
    /// snapshot was already admitted once (including any PAR requirement),
    /// so source-level constraints are not re-imposed.
    ///
    /// # Errors
    ///
    /// As for [`Self::process`].
    pub async fn process_resumed(
        &self,
        params: RawParams,
    ) -> Result<ValidatedAuthRequest, AuthorizeReject> {
        self.process_inner(params, true).await
    }

    async fn process_inner(
        &self,
        mut params: RawParams,
        resumed: bool,
    ) -> Result<ValidatedAuthRequest, AuthorizeReject> {
        // ---- Source merging -------------------------------------------------

        let mut par_dpop_jkt = None;
        let mut from_par = false;
        if let Some(request_uri) = params.get("request_uri").cloned() {
            if ParRequestUri::is_par_uri(&request_uri) {
                let uri = ParRequestUri::parse(&request_uri).map_err(|_| {
                    AuthorizeReject::render(AuthError::invalid_request_uri(
                        "Malformed request_uri",
                    ))
                })?;
                // client_id from the query, when present, must match the
                // pushed one; the consume itself enforces the binding.
                let client_id = params.get("client_id").cloned().unwrap_or_default();
                let record = self
                    .par_requests
                    .consume_request(&uri, &client_id)
                    .await
                    .map_err(|_| {
                        AuthorizeReject::render(AuthError::invalid_request_uri(
                            "Unknown or expired request_uri",
                        ))
                    })?;
                par_dpop_jkt = record.dpop_jkt;
                from_par = true;
                // Substitute all parameters with the pushed snapshot.
                params = record.params;
            } else if self.config.features.request_uri_https_enabled {
                let url = Url::parse(&request_uri).map_err(|_| {
                    AuthorizeReject::render(AuthError::invalid_request_uri(
                        "Malformed request_uri",
                    ))
                })?;
                let allowed = self.config.features.request_uri_allowed_domains.clone();
                let body = self
                    .fetcher
                    .fetch_text(&url, Some(&allowed))
                    .await
                    .map_err(|_| {
                        AuthorizeReject::render(AuthError::invalid_request_uri(
                            "request_uri could not be retrieved",
                        ))
                    })?;
                // The retrieved content continues through the pipeline as a
                // request object.
                params.insert("request".to_string(), body.trim().to_string());
            } else {
                return Err(AuthorizeReject::render(AuthError::RequestUriNotSupported));
            }
        }

        if let Some(request_jwt) = params.get("request").cloned() {
            let client_id = params.get("client_id").cloned().unwrap_or_default();
            let client = self.resolve_client(&client_id).await?;
            let query_redirect = params.get("redirect_uri").cloned();

            let object_params = process_request_object(
                &request_jwt,
                &client,
                &self.config.issuer,
                self.config.features.allow_unsigned_request_objects,
                &self.key_manager,
                &self.fetcher,
            )
            .await
            .map_err(AuthorizeReject::render)?;

            if let (Some(query), Some(object)) =
                (query_redirect.as_deref(), object_params.get("redirect_uri"))
                && query != object
            {
                return Err(AuthorizeReject::render(AuthError::invalid_request_object(
                    "redirect_uri in request object does not match the query",
                )));
            }
            // Claims in the request object override query/body values.
            for (key, value) in object_params {
                params.insert(key, value);
            }
            params.remove("request");
        }

        // ---- Client and redirect URI ---------------------------------------

        let client_id = params.get("client_id").cloned().unwrap_or_default();
        let client = self.resolve_client(&client_id).await?;
        let tenant = self.config.tenant_profile(&client.tenant_id);

        let redirect_uri = params.get("redirect_uri").cloned().ok_or_else(|| {
            AuthorizeReject::render(AuthError::invalid_request("redirect_uri is required"))
        })?;
        self.check_redirect_uri(&client, &redirect_uri)?;

        // From here on, the redirect URI is trusted: failures go back to
        // the client.
        let state = params.get("state").cloned();
        if self.config.features.fapi2 && !from_par && !resumed {
            return Err(AuthorizeReject::Redirect {
                error: AuthError::invalid_request(
                    "Pushed authorization requests are required under FAPI 2.0",
                ),
                redirect_uri: redirect_uri.clone(),
                state: state.clone(),
                response_mode: ResponseMode::Query,
                client: Arc::clone(&client),
            });
        }
        let reject = |error: AuthError, mode: ResponseMode| AuthorizeReject::Redirect {
            error,
            redirect_uri: redirect_uri.clone(),
            state: state.clone(),
            response_mode: mode,
            client: Arc::clone(&client),
        };

        // ---- Response type and mode ----------------------------------------

        let response_type_raw = params.get("response_type").cloned().unwrap_or_default();
        let response_type = ResponseTypeSet::parse(&response_type_raw)
            .map_err(|e| reject(e, ResponseMode::Query))?;
        let default_mode = ResponseMode::default_for(response_type);

        if !client.allows_response_type(&response_type.canonical()) {
            return Err(reject(
                AuthError::unsupported_response_type(
                    "response_type is not allowed for this client",
                ),
                default_mode,
            ));
        }
        if !tenant.allows_response_type(&response_type.canonical()) {
            return Err(reject(
                AuthError::unsupported_response_type(
                    "response_type is not allowed for this tenant profile",
                ),
                default_mode,
            ));
        }

        let requested_mode = match params.get("response_mode") {
            Some(raw) => {
                Some(ResponseMode::parse(raw).map_err(|e| reject(e, default_mode))?)
            }
            None => None,
        };
        let response_mode = ResponseMode::resolve(requested_mode, response_type)
            .map_err(|e| reject(e, default_mode))?;

        // ---- Scope ---------------------------------------------------------

        let scope = params.get("scope").cloned().unwrap_or_default();
        if scope.trim().is_empty() {
            return Err(reject(
                AuthError::invalid_request("scope is required"),
                response_mode,
            ));
        }
        if !client.are_scopes_allowed(&scope) {
            return Err(reject(
                AuthError::invalid_scope("Requested scope exceeds the client's registration"),
                response_mode,
            ));
        }

        // ---- State and nonce -----------------------------------------------

        if state.is_none() && (self.config.features.require_state || response_type.none) {
            return Err(reject(
                AuthError::invalid_request("state is required"),
                response_mode,
            ));
        }
        let nonce = params.get("nonce").cloned();
        if response_type.id_token && nonce.is_none() {
            return Err(reject(
                AuthError::invalid_request("nonce is required when response_type includes id_token"),
                response_mode,
            ));
        }

        // ---- PKCE ----------------------------------------------------------

        let code_challenge = params.get("code_challenge").cloned();
        let code_challenge_method = params.get("code_challenge_method").cloned();
        if let Some(method) = &code_challenge_method
            && method != "S256"
        {
            return Err(reject(
                AuthError::invalid_request(format!(
                    "Unsupported code_challenge_method: {method}. Only S256 is supported"
                )),
                response_mode,
            ));
        }
        if code_challenge.is_some() != code_challenge_method.is_some() {
            return Err(reject(
                AuthError::invalid_request(
                    "code_challenge and code_challenge_method must be supplied together",
                ),
                response_mode,
            ));
        }
        if let Some(challenge) = &code_challenge
            && !is_valid_code_challenge(challenge)
        {
            return Err(reject(
                AuthError::invalid_request("code_challenge is malformed"),
                response_mode,
            ));
        }
        if self.config.features.fapi2 && !response_type.none && code_challenge.is_none() {
            return Err(reject(
                AuthError::invalid_request("PKCE is required under FAPI 2.0"),
                response_mode,
            ));
        }

        // ---- Claims --------------------------------------------------------

        let claims = match params.get("claims") {
            Some(raw) => Some(parse_claims(raw).map_err(|e| reject(e, response_mode))?),
            None => None,
        };

        // ---- Rich authorization requests -----------------------------------

        let authorization_details = match params.get("authorization_details") {
            Some(raw) if self.config.features.rar_enabled => Some(
                validate_authorization_details(raw, &self.config.features.rar_allowed_types)
                    .map_err(|e| reject(e, response_mode))?,
            ),
            Some(_) => {
                tracing::debug!("ignoring authorization_details: RAR is disabled");
                None
            }
            None => None,
        };

        // ---- max_age and prompt --------------------------------------------

        let max_age = match params.get("max_age") {
            Some(raw) => Some(raw.parse::<i64>().ok().filter(|v| *v >= 0).ok_or_else(|| {
                reject(
                    AuthError::invalid_request("max_age must be a non-negative integer"),
                    response_mode,
                )
            })?),
            None => None,
        };
        let prompt = match params.get("prompt") {
            Some(raw) => PromptSet::parse(raw).map_err(|e| reject(e, response_mode))?,
            None => PromptSet::default(),
        };

        let snapshot = AuthRequestSnapshot {
            client_id: client.client_id.clone(),
            redirect_uri,
            response_type: response_type.canonical(),
            scope,
            state,
            nonce,
            response_mode: params.get("response_mode").cloned(),
            code_challenge,
            code_challenge_method,
            claims,
            authorization_details,
            max_age,
            prompt: params.get("prompt").cloned(),
            acr_values: params.get("acr_values").cloned(),
            login_hint: params.get("login_hint").cloned(),
            dpop_jkt: par_dpop_jkt,
        };

        Ok(ValidatedAuthRequest {
            client,
            tenant,
            snapshot,
            response_type,
            response_mode,
            prompt,
        })
    }

    async fn resolve_client(&self, client_id: &str) -> Result<Arc<Client>, AuthorizeReject> {
        if client_id.is_empty()
            || client_id.len() > 256
            || !client_id.chars().all(|c| c.is_ascii_graphic())
        {
            return Err(AuthorizeReject::render(AuthError::invalid_request(
                "client_id is malformed",
            )));
        }
        match self.clients.get(client_id).await {
            Ok(Some(client)) if client.active => Ok(client),
            Ok(_) => Err(AuthorizeReject::render(AuthError::invalid_request(
                "Unknown client",
            ))),
            Err(e) => {
                tracing::error!(error = %e, "client lookup failed");
                Err(AuthorizeReject::render(AuthError::internal(
                    "client lookup failed",
                )))
            }
        }
    }

    fn check_redirect_uri(
        &self,
        client: &Arc<Client>,
        redirect_uri: &str,
    ) -> Result<(), AuthorizeReject> {
        let parsed = Url::parse(redirect_uri).map_err(|_| {
            AuthorizeReject::render(AuthError::invalid_request("redirect_uri is malformed"))
        })?;
        match parsed.scheme() {
            "https" => {}
            "http" if self.config.features.allow_insecure_http_redirects => {}
            _ => {
                return Err(AuthorizeReject::render(AuthError::invalid_request(
                    "redirect_uri must use https",
                )));
            }
        }

        // Normalized equality against the registration is the only accepted
        // match; no substring or origin comparison.
        if client.is_redirect_uri_registered(redirect_uri) {
            return Ok(());
        }

        Err(AuthorizeReject::render(AuthError::invalid_request(
            "redirect_uri is not registered for this client",
        )))
    }
}

/// Parses the `claims` parameter: a JSON object whose only members are
/// `userinfo` and/or `id_token`, each itself an object.
fn parse_claims(raw: &str) -> Result<serde_json::Value, AuthError> {
    let parsed: serde_json::Value = serde_json::from_str(raw)
        .map_err(|_| AuthError::invalid_request("claims must be valid JSON"))?;
    let object = parsed
        .as_object()
        .ok_or_else(|| AuthError::invalid_request("claims must be a JSON object"))?;
    for (key, value) in object {
        if key != "userinfo" && key != "id_token" {
            return Err(AuthError::invalid_request(format!(
                "claims contains an unknown member: {key}"
            )));
        }
        if !value.is_object() {
            return Err(AuthError::invalid_request(
                "claims members must be objects",
            ));
        }
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_challenge_boundaries() {
        assert!(is_valid_code_challenge(&"a".repeat(43)));
        assert!(is_valid_code_challenge(&"a".repeat(128)));
        assert!(!is_valid_code_challenge(&"a".repeat(42)));
        assert!(!is_valid_code_challenge(&"a".repeat(129)));
        assert!(!is_valid_code_challenge(&format!("{}+", "a".repeat(43))));
        assert!(is_valid_code_challenge(
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        ));
    }

    #[test]
    fn test_parse_claims_shapes() {
        assert!(parse_claims(r#"{"userinfo":{},"id_token":{}}"#).is_ok());
        assert!(parse_claims(r#"{"id_token":{"acr":{"essential":true}}}"#).is_ok());
        assert!(parse_claims(r#"{"other":{}}"#).is_err());
        assert!(parse_claims(r#"{"userinfo":[]}"#).is_err());
        assert!(parse_claims(r#"[]"#).is_err());
        assert!(parse_claims("not json").is_err());
    }
}
