//! User types, split across the non-PII and PII stores.
//!
//! `UserCore` rows never carry PII; `UserPii` rows live in the separate PII
//! store and are only joined when claims must be rendered. Log statements
//! must never include `UserPii` fields.

use serde::{Deserialize, Serialize};

/// A user row from the non-PII store (`users_core`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCore {
    /// User id.
    pub id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Whether the email address has been verified.
    pub email_verified: bool,
    /// User type label (`human`, `agent`, …).
    pub user_type: String,
    /// Whether the account is active.
    pub is_active: bool,
    /// Last login (unix seconds).
    pub last_login_at: Option<i64>,
}

/// A user row from the PII store (`users_pii`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserPii {
    /// User id (same as the core row).
    pub id: String,
    /// Email address.
    pub email: Option<String>,
    /// Full name.
    pub name: Option<String>,
    /// Given name.
    pub given_name: Option<String>,
    /// Family name.
    pub family_name: Option<String>,
    /// Preferred username.
    pub preferred_username: Option<String>,
    /// Picture URL.
    pub picture: Option<String>,
    /// Phone number.
    pub phone_number: Option<String>,
    /// Formatted address.
    pub address: Option<String>,
}

/// Standard claims assembled for ID tokens and the UserInfo endpoint,
/// filtered by granted scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserInfo {
    /// Subject.
    pub sub: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<serde_json::Value>,
}

impl UserInfo {
    /// Assembles claims for a user, exposing only what the granted scope
    /// covers (`profile`, `email`, `phone`, `address`).
    #[must_use]
    pub fn from_scope(core: &UserCore, pii: &UserPii, scope: &str) -> Self {
        let scopes: Vec<&str> = scope.split_whitespace().collect();
        let mut info = Self {
            sub: core.id.clone(),
            ..Self::default()
        };
        if scopes.contains(&"email") {
            info.email = pii.email.clone();
            info.email_verified = Some(core.email_verified);
        }
        if scopes.contains(&"profile") {
            info.name = pii.name.clone();
            info.given_name = pii.given_name.clone();
            info.family_name = pii.family_name.clone();
            info.preferred_username = pii.preferred_username.clone();
            info.picture = pii.picture.clone();
        }
        if scopes.contains(&"phone") {
            info.phone_number = pii.phone_number.clone();
        }
        if scopes.contains(&"address")
            && let Some(formatted) = &pii.address
        {
            info.address = Some(serde_json::json!({ "formatted": formatted }));
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> UserCore {
        UserCore {
            id: "user-1".to_string(),
            tenant_id: "default".to_string(),
            email_verified: true,
            user_type: "human".to_string(),
            is_active: true,
            last_login_at: None,
        }
    }

    fn pii() -> UserPii {
        UserPii {
            id: "user-1".to_string(),
            email: Some("u@example.com".to_string()),
            name: Some("U. Ser".to_string()),
            given_name: Some("U".to_string()),
            family_name: Some("Ser".to_string()),
            preferred_username: Some("user1".to_string()),
            picture: None,
            phone_number: Some("+15550100".to_string()),
            address: Some("1 Main St".to_string()),
        }
    }

    #[test]
    fn test_scope_filters_claims() {
        let info = UserInfo::from_scope(&core(), &pii(), "openid email");
        assert_eq!(info.sub, "user-1");
        assert_eq!(info.email.as_deref(), Some("u@example.com"));
        assert_eq!(info.email_verified, Some(true));
        assert!(info.name.is_none());
        assert!(info.phone_number.is_none());
    }

    #[test]
    fn test_profile_scope() {
        let info = UserInfo::from_scope(&core(), &pii(), "openid profile");
        assert_eq!(info.name.as_deref(), Some("U. Ser"));
        assert!(info.email.is_none());
    }

    #[test]
    fn test_address_scope_wraps_formatted() {
        let info = UserInfo::from_scope(&core(), &pii(), "openid address");
        assert_eq!(info.address.unwrap()["formatted"], "1 Main St");
    }

    #[test]
    fn test_openid_only_exposes_sub_only() {
        let info = UserInfo::from_scope(&core(), &pii(), "openid");
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json.as_object().unwrap().len(), 1);
        assert_eq!(json["sub"], "user-1");
    }
}
