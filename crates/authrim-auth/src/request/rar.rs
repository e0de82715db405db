//! Rich Authorization Requests (RFC 9396).
//!
//! `authorization_details` is parsed only when RAR is enabled for the
//! tenant. Each entry must be an object with a `type` member drawn from the
//! deployment's allowed set; the sanitized array (known members only)
//! replaces the raw input everywhere downstream.

use crate::error::AuthError;

/// Members retained in the sanitized form of an entry. Everything else is
/// dropped rather than forwarded to resource servers.
const KNOWN_MEMBERS: &[&str] = &[
    "type",
    "actions",
    "locations",
    "datatypes",
    "identifier",
    "privileges",
];

/// Validates and sanitizes an `authorization_details` value.
///
/// # Errors
///
/// Returns `invalid_authorization_details` for non-array input, non-object
/// entries, missing or disallowed `type` members.
pub fn validate_authorization_details(
    raw: &str,
    allowed_types: &[String],
) -> Result<serde_json::Value, AuthError> {
    let parsed: serde_json::Value = serde_json::from_str(raw).map_err(|_| {
        AuthError::invalid_authorization_details("authorization_details must be valid JSON")
    })?;
    let entries = parsed.as_array().ok_or_else(|| {
        AuthError::invalid_authorization_details("authorization_details must be a JSON array")
    })?;
    if entries.is_empty() {
        return Err(AuthError::invalid_authorization_details(
            "authorization_details must not be empty",
        ));
    }

    let mut sanitized = Vec::with_capacity(entries.len());
    for entry in entries {
        let object = entry.as_object().ok_or_else(|| {
            AuthError::invalid_authorization_details(
                "authorization_details entries must be objects",
            )
        })?;
        let type_value = object.get("type").and_then(|v| v.as_str()).ok_or_else(|| {
            AuthError::invalid_authorization_details(
                "authorization_details entries must carry a type",
            )
        })?;
        if !allowed_types.iter().any(|t| t == type_value) {
            return Err(AuthError::invalid_authorization_details(format!(
                "authorization_details type is not allowed: {type_value}"
            )));
        }

        let mut clean = serde_json::Map::new();
        for member in KNOWN_MEMBERS {
            if let Some(value) = object.get(*member) {
                clean.insert((*member).to_string(), value.clone());
            }
        }
        sanitized.push(serde_json::Value::Object(clean));
    }
    Ok(serde_json::Value::Array(sanitized))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed() -> Vec<String> {
        vec!["payment_initiation".to_string()]
    }

    #[test]
    fn test_valid_entry_sanitized() {
        let raw = r#"[{"type":"payment_initiation","actions":["initiate"],"x_internal":"drop-me"}]"#;
        let value = validate_authorization_details(raw, &allowed()).unwrap();
        let entry = &value.as_array().unwrap()[0];
        assert_eq!(entry["type"], "payment_initiation");
        assert_eq!(entry["actions"][0], "initiate");
        assert!(entry.get("x_internal").is_none(), "unknown members dropped");
    }

    #[test]
    fn test_disallowed_type_rejected() {
        let raw = r#"[{"type":"account_access"}]"#;
        assert!(validate_authorization_details(raw, &allowed()).is_err());
    }

    #[test]
    fn test_structural_rejections() {
        assert!(validate_authorization_details("not json", &allowed()).is_err());
        assert!(validate_authorization_details(r#"{"type":"x"}"#, &allowed()).is_err());
        assert!(validate_authorization_details("[]", &allowed()).is_err());
        assert!(validate_authorization_details(r#"["string"]"#, &allowed()).is_err());
        assert!(validate_authorization_details(r#"[{"actions":[]}]"#, &allowed()).is_err());
    }
}
