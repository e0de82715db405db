//! User storage trait, spanning the non-PII and PII stores.
//!
//! Implementations keep `users_core` and `users_pii` in separate logical
//! databases. PII values returned here must never be logged.

use async_trait::async_trait;

use crate::AuthResult;
use crate::types::{UserCore, UserPii};

/// Input for JIT-provisioning a user (email-OTP first login, SAML
/// attribute mapping, DID registration).
#[derive(Debug, Clone)]
pub struct NewUser {
    /// Owning tenant.
    pub tenant_id: String,
    /// User type label.
    pub user_type: String,
    /// Email, stored in the PII partition.
    pub email: Option<String>,
    /// Display name, stored in the PII partition.
    pub name: Option<String>,
    /// Whether the email arrived pre-verified (e.g. asserted by an IdP).
    pub email_verified: bool,
}

/// Storage interface for users.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Finds a user's non-PII row.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn find_core(&self, user_id: &str) -> AuthResult<Option<UserCore>>;

    /// Finds a user's PII row.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn find_pii(&self, user_id: &str) -> AuthResult<Option<UserPii>>;

    /// Resolves an email address to a user id.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn find_id_by_email(&self, email: &str) -> AuthResult<Option<String>>;

    /// Creates a user across both stores, returning the new user id.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn create(&self, user: NewUser) -> AuthResult<String>;

    /// Stamps `last_login_at` for a user. Best-effort; failures are logged
    /// by the caller, not propagated into the flow.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn touch_last_login(&self, user_id: &str) -> AuthResult<()>;

    /// Verifies an email/password pair, returning the user id on success.
    /// Implementations must compare against the stored hash in constant
    /// time (Argon2 verification already is).
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails; a wrong password is
    /// `Ok(None)`.
    async fn verify_password(&self, email: &str, password: &str) -> AuthResult<Option<String>>;

    /// Verifies a password for a known user id (re-authentication).
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    async fn verify_password_for_user(&self, user_id: &str, password: &str) -> AuthResult<bool>;
}
