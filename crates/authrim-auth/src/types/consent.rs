//! Consent records.

use serde::{Deserialize, Serialize};

use authrim_core::time::now_unix;

/// A user's consent grant for a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentRecord {
    /// The granting user.
    pub user_id: String,
    /// The client granted to.
    pub client_id: String,
    /// Granted scope (space-separated).
    pub scope: String,
    /// When the grant was recorded (unix seconds).
    pub granted_at: i64,
    /// Expiry (unix seconds). `None` means no expiry.
    pub expires_at: Option<i64>,
}

impl ConsentRecord {
    /// Returns `true` if the grant is live and covers every requested scope.
    #[must_use]
    pub fn covers(&self, requested_scope: &str) -> bool {
        if let Some(expires_at) = self.expires_at
            && expires_at <= now_unix()
        {
            return false;
        }
        let granted: Vec<&str> = self.scope.split_whitespace().collect();
        requested_scope
            .split_whitespace()
            .all(|scope| granted.contains(&scope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consent(scope: &str, expires_at: Option<i64>) -> ConsentRecord {
        ConsentRecord {
            user_id: "u".to_string(),
            client_id: "c".to_string(),
            scope: scope.to_string(),
            granted_at: now_unix(),
            expires_at,
        }
    }

    #[test]
    fn test_covers_subset() {
        let record = consent("openid profile email", None);
        assert!(record.covers("openid"));
        assert!(record.covers("openid email"));
        assert!(!record.covers("openid phone"));
    }

    #[test]
    fn test_expired_covers_nothing() {
        let record = consent("openid", Some(now_unix() - 1));
        assert!(!record.covers("openid"));
    }
}
