//! Redirect URI normalization and matching.
//!
//! A redirect URI from a request is accepted only when it equals one of the
//! client's registered redirect URIs under a defined normalization:
//!
//! - scheme and host lowercased
//! - default ports stripped (`:443` for https, `:80` for http)
//! - trailing-slash neutral (`/cb` and `/cb/` compare equal)
//!
//! No substring, prefix or origin comparison is ever performed. Query and
//! fragment components participate in the comparison verbatim.

use url::Url;

/// Normalizes a redirect URI to its canonical comparison form.
///
/// # Errors
///
/// Returns `url::ParseError` if the input is not an absolute URL.
pub fn normalize_redirect_uri(uri: &str) -> Result<String, url::ParseError> {
    // The url crate already lowercases scheme/host and strips known default
    // ports during parsing.
    let parsed = Url::parse(uri)?;
    let mut normalized = parsed.to_string();

    // Trailing-slash neutrality on the path component only: a URL whose path
    // ends in '/' (other than the bare root) compares equal to one without.
    if parsed.path() != "/" && parsed.path().ends_with('/') && parsed.query().is_none() {
        if let Some(stripped) = normalized.strip_suffix('/') {
            normalized = stripped.to_string();
        }
    } else if parsed.path() == "/" && parsed.query().is_none() && parsed.fragment().is_none() {
        // `https://rp.example` and `https://rp.example/` are the same URL.
        if let Some(stripped) = normalized.strip_suffix('/') {
            normalized = stripped.to_string();
        }
    }

    Ok(normalized)
}

/// Returns `true` if `requested` matches `registered` under normalization.
///
/// Either side failing to parse yields `false`; an unparseable URI can
/// never match.
#[must_use]
pub fn redirect_uri_matches(registered: &str, requested: &str) -> bool {
    match (
        normalize_redirect_uri(registered),
        normalize_redirect_uri(requested),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_scheme_and_host() {
        assert!(redirect_uri_matches(
            "https://rp.example/cb",
            "HTTPS://RP.EXAMPLE/cb"
        ));
    }

    #[test]
    fn test_path_is_case_sensitive() {
        assert!(!redirect_uri_matches(
            "https://rp.example/cb",
            "https://rp.example/CB"
        ));
    }

    #[test]
    fn test_default_port_stripped() {
        assert!(redirect_uri_matches(
            "https://rp.example/cb",
            "https://rp.example:443/cb"
        ));
        assert!(redirect_uri_matches(
            "http://rp.example/cb",
            "http://rp.example:80/cb"
        ));
    }

    #[test]
    fn test_non_default_port_significant() {
        assert!(!redirect_uri_matches(
            "https://rp.example/cb",
            "https://rp.example:8443/cb"
        ));
    }

    #[test]
    fn test_trailing_slash_neutral() {
        assert!(redirect_uri_matches(
            "https://rp.example/cb",
            "https://rp.example/cb/"
        ));
        assert!(redirect_uri_matches(
            "https://rp.example/",
            "https://rp.example"
        ));
    }

    #[test]
    fn test_no_prefix_or_origin_match() {
        assert!(!redirect_uri_matches(
            "https://rp.example/cb",
            "https://rp.example/cb/extra"
        ));
        assert!(!redirect_uri_matches(
            "https://rp.example/cb",
            "https://rp.example/other"
        ));
        assert!(!redirect_uri_matches(
            "https://rp.example/cb",
            "https://rp.example.evil.com/cb"
        ));
    }

    #[test]
    fn test_query_participates_verbatim() {
        assert!(redirect_uri_matches(
            "https://rp.example/cb?env=prod",
            "https://rp.example/cb?env=prod"
        ));
        assert!(!redirect_uri_matches(
            "https://rp.example/cb?env=prod",
            "https://rp.example/cb?env=dev"
        ));
    }

    #[test]
    fn test_unparseable_never_matches() {
        assert!(!redirect_uri_matches("https://rp.example/cb", "not a url"));
        assert!(!redirect_uri_matches("not a url", "not a url"));
    }
}
