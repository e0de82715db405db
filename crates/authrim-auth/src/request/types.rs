//! Response types, response modes and prompt sets.

use std::fmt;

use crate::error::AuthError;

// =============================================================================
// Response type
// =============================================================================

/// The requested response type, parsed as a set of members.
///
/// Supported combinations are exactly `{code, id_token, token, code
/// id_token, code token, id_token token, code id_token token, none}`;
/// `none` must not be combined with anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseTypeSet {
    /// `code` member present.
    pub code: bool,
    /// `id_token` member present.
    pub id_token: bool,
    /// `token` member present.
    pub token: bool,
    /// `none` requested.
    pub none: bool,
}

impl ResponseTypeSet {
    /// Parses a `response_type` value.
    ///
    /// # Errors
    ///
    /// Returns `unsupported_response_type` for empty values, unknown
    /// members, duplicates, or `none` combined with other members.
    pub fn parse(value: &str) -> Result<Self, AuthError> {
        let mut set = Self::default();
        let mut members = 0usize;
        for member in value.split_whitespace() {
            members += 1;
            let slot = match member {
                "code" => &mut set.code,
                "id_token" => &mut set.id_token,
                "token" => &mut set.token,
                "none" => &mut set.none,
                other => {
                    return Err(AuthError::unsupported_response_type(format!(
                        "Unknown response_type member: {other}"
                    )));
                }
            };
            if *slot {
                return Err(AuthError::unsupported_response_type(
                    "Duplicate response_type member",
                ));
            }
            *slot = true;
        }
        if members == 0 {
            return Err(AuthError::unsupported_response_type(
                "response_type must not be empty",
            ));
        }
        if set.none && members > 1 {
            return Err(AuthError::unsupported_response_type(
                "response_type none must not be combined",
            ));
        }
        Ok(set)
    }

    /// Canonical space-separated form (`code id_token token` ordering).
    #[must_use]
    pub fn canonical(&self) -> String {
        if self.none {
            return "none".to_string();
        }
        let mut members = Vec::new();
        if self.code {
            members.push("code");
        }
        if self.id_token {
            members.push("id_token");
        }
        if self.token {
            members.push("token");
        }
        members.join(" ")
    }

    /// Returns `true` for the pure authorization-code shape.
    #[must_use]
    pub fn is_code_only(&self) -> bool {
        self.code && !self.id_token && !self.token && !self.none
    }

    /// Returns `true` if any artefact is delivered in the front channel
    /// (anything carrying `id_token` or `token`).
    #[must_use]
    pub fn has_front_channel_tokens(&self) -> bool {
        self.id_token || self.token
    }
}

impl fmt::Display for ResponseTypeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

// =============================================================================
// Response mode
// =============================================================================

/// How response parameters are delivered to the redirect URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseMode {
    /// Query-string parameters.
    Query,
    /// Fragment parameters.
    Fragment,
    /// Auto-submitting HTML form POST.
    FormPost,
    /// JARM over the query string.
    QueryJwt,
    /// JARM over the fragment.
    FragmentJwt,
    /// JARM over form POST.
    FormPostJwt,
    /// Bare `jwt`: JARM over the default mode for the response type.
    Jwt,
}

impl ResponseMode {
    /// Parses a `response_mode` value.
    ///
    /// # Errors
    ///
    /// Returns `invalid_request` for unknown modes.
    pub fn parse(value: &str) -> Result<Self, AuthError> {
        match value {
            "query" => Ok(Self::Query),
            "fragment" => Ok(Self::Fragment),
            "form_post" => Ok(Self::FormPost),
            "query.jwt" => Ok(Self::QueryJwt),
            "fragment.jwt" => Ok(Self::FragmentJwt),
            "form_post.jwt" => Ok(Self::FormPostJwt),
            "jwt" => Ok(Self::Jwt),
            other => Err(AuthError::invalid_request(format!(
                "Unsupported response_mode: {other}"
            ))),
        }
    }

    /// The default mode for a response type: pure `code` (and `none`) use
    /// the query string, anything carrying front-channel tokens uses the
    /// fragment.
    #[must_use]
    pub fn default_for(response_type: ResponseTypeSet) -> Self {
        if response_type.has_front_channel_tokens() {
            Self::Fragment
        } else {
            Self::Query
        }
    }

    /// Resolves the effective mode: the requested mode, or the default;
    /// bare `jwt` resolves to the JARM variant of the default.
    ///
    /// # Errors
    ///
    /// Returns `invalid_request` when the combination is incoherent
    /// (fragment delivery for a pure `code` request).
    pub fn resolve(
        requested: Option<Self>,
        response_type: ResponseTypeSet,
    ) -> Result<Self, AuthError> {
        let mode = match requested {
            None => Self::default_for(response_type),
            Some(Self::Jwt) => match Self::default_for(response_type) {
                Self::Fragment => Self::FragmentJwt,
                _ => Self::QueryJwt,
            },
            Some(mode) => mode,
        };
        if matches!(mode, Self::Fragment | Self::FragmentJwt)
            && response_type.is_code_only()
        {
            return Err(AuthError::invalid_request(
                "response_mode fragment is not allowed for response_type code",
            ));
        }
        Ok(mode)
    }

    /// Returns `true` for the JARM variants.
    #[must_use]
    pub fn is_jarm(&self) -> bool {
        matches!(
            self,
            Self::QueryJwt | Self::FragmentJwt | Self::FormPostJwt | Self::Jwt
        )
    }

    /// The wire form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Fragment => "fragment",
            Self::FormPost => "form_post",
            Self::QueryJwt => "query.jwt",
            Self::FragmentJwt => "fragment.jwt",
            Self::FormPostJwt => "form_post.jwt",
            Self::Jwt => "jwt",
        }
    }
}

impl fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Prompt
// =============================================================================

/// The `prompt` parameter, parsed as a set of tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PromptSet {
    /// No interaction allowed.
    pub none: bool,
    /// Force re-authentication.
    pub login: bool,
    /// Force consent collection.
    pub consent: bool,
    /// Force account selection.
    pub select_account: bool,
}

impl PromptSet {
    /// Parses a `prompt` value.
    ///
    /// # Errors
    ///
    /// Returns `invalid_request` for unknown tokens or `none` combined with
    /// any other token.
    pub fn parse(value: &str) -> Result<Self, AuthError> {
        let mut set = Self::default();
        let mut tokens = 0usize;
        for token in value.split_whitespace() {
            tokens += 1;
            match token {
                "none" => set.none = true,
                "login" => set.login = true,
                "consent" => set.consent = true,
                "select_account" => set.select_account = true,
                other => {
                    return Err(AuthError::invalid_request(format!(
                        "Unknown prompt token: {other}"
                    )));
                }
            }
        }
        if set.none && tokens > 1 {
            return Err(AuthError::invalid_request(
                "prompt none must not be combined",
            ));
        }
        Ok(set)
    }
}
