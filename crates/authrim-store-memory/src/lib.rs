//! # authrim-store-memory
//!
//! In-memory implementations of the `authrim-auth` relational storage
//! traits, for tests and single-node deployments. The PII/non-PII split is
//! preserved: `users_core` and `users_pii` live in separate maps, joined
//! only by user id.

use std::collections::HashMap;
use std::sync::Arc;

use argon2::password_hash::{PasswordHash, PasswordHasher, SaltString};
use argon2::{Argon2, PasswordVerifier};
use async_trait::async_trait;
use tokio::sync::RwLock;

use authrim_auth::error::AuthError;
use authrim_auth::storage::{
    ClientStore, ConsentStore, IdentityProvider, IdentityProviderStore, LinkedIdentity,
    LinkedIdentityStore, NewUser, PasskeyCredential, PasskeyStore, SamlReplayStore,
    SessionClientStore, UserStore,
};
use authrim_auth::types::{Client, ConsentRecord, UserCore, UserPii};
use authrim_auth::AuthResult;
use authrim_core::time::now_unix;

// =============================================================================
// Clients
// =============================================================================

/// In-memory client store.
#[derive(Default)]
pub struct MemoryClientStore {
    clients: RwLock<HashMap<String, Client>>,
}

impl MemoryClientStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client.
    pub async fn insert(&self, client: Client) {
        self.clients
            .write()
            .await
            .insert(client.client_id.clone(), client);
    }
}

#[async_trait]
impl ClientStore for MemoryClientStore {
    async fn find_by_client_id(&self, client_id: &str) -> AuthResult<Option<Client>> {
        Ok(self
            .clients
            .read()
            .await
            .get(client_id)
            .filter(|c| c.active)
            .cloned())
    }
}

// =============================================================================
// Users
// =============================================================================

struct StoredUser {
    core: UserCore,
    pii: UserPii,
    password_hash: Option<String>,
}

/// In-memory user store with the core/PII split.
#[derive(Default)]
pub struct MemoryUserStore {
    users: RwLock<HashMap<String, StoredUser>>,
}

impl MemoryUserStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a user with a password, returning the user id.
    ///
    /// # Panics
    ///
    /// Panics if Argon2 hashing fails (it does not for valid parameters).
    pub async fn insert_with_password(&self, email: &str, name: &str, password: &str) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let salt = SaltString::generate(&mut rand::rngs::OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .expect("argon2 hashing")
            .to_string();
        self.users.write().await.insert(
            id.clone(),
            StoredUser {
                core: UserCore {
                    id: id.clone(),
                    tenant_id: "default".to_string(),
                    email_verified: true,
                    user_type: "human".to_string(),
                    is_active: true,
                    last_login_at: None,
                },
                pii: UserPii {
                    id: id.clone(),
                    email: Some(email.to_string()),
                    name: Some(name.to_string()),
                    ..UserPii::default()
                },
                password_hash: Some(password_hash),
            },
        );
        id
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_core(&self, user_id: &str) -> AuthResult<Option<UserCore>> {
        Ok(self.users.read().await.get(user_id).map(|u| u.core.clone()))
    }

    async fn find_pii(&self, user_id: &str) -> AuthResult<Option<UserPii>> {
        Ok(self.users.read().await.get(user_id).map(|u| u.pii.clone()))
    }

    async fn find_id_by_email(&self, email: &str) -> AuthResult<Option<String>> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| u.pii.email.as_deref() == Some(email))
            .map(|u| u.core.id.clone()))
    }

    async fn create(&self, user: NewUser) -> AuthResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.users.write().await.insert(
            id.clone(),
            StoredUser {
                core: UserCore {
                    id: id.clone(),
                    tenant_id: user.tenant_id,
                    email_verified: user.email_verified,
                    user_type: user.user_type,
                    is_active: true,
                    last_login_at: None,
                },
                pii: UserPii {
                    id: id.clone(),
                    email: user.email,
                    name: user.name,
                    ..UserPii::default()
                },
                password_hash: None,
            },
        );
        Ok(id)
    }

    async fn touch_last_login(&self, user_id: &str) -> AuthResult<()> {
        if let Some(user) = self.users.write().await.get_mut(user_id) {
            user.core.last_login_at = Some(now_unix());
        }
        Ok(())
    }

    async fn verify_password(&self, email: &str, password: &str) -> AuthResult<Option<String>> {
        let users = self.users.read().await;
        let Some(user) = users
            .values()
            .find(|u| u.pii.email.as_deref() == Some(email))
        else {
            return Ok(None);
        };
        let Some(hash) = &user.password_hash else {
            return Ok(None);
        };
        let parsed = PasswordHash::new(hash)
            .map_err(|_| AuthError::internal("stored password hash is malformed"))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .ok()
            .map(|()| user.core.id.clone()))
    }

    async fn verify_password_for_user(&self, user_id: &str, password: &str) -> AuthResult<bool> {
        let users = self.users.read().await;
        let Some(user) = users.get(user_id) else {
            return Ok(false);
        };
        let Some(hash) = &user.password_hash else {
            return Ok(false);
        };
        let parsed = PasswordHash::new(hash)
            .map_err(|_| AuthError::internal("stored password hash is malformed"))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }
}

// =============================================================================
// Consents
// =============================================================================

/// In-memory consent store keyed by `(user, client)`.
#[derive(Default)]
pub struct MemoryConsentStore {
    consents: RwLock<HashMap<(String, String), ConsentRecord>>,
}

impl MemoryConsentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConsentStore for MemoryConsentStore {
    async fn find(&self, user_id: &str, client_id: &str) -> AuthResult<Option<ConsentRecord>> {
        Ok(self
            .consents
            .read()
            .await
            .get(&(user_id.to_string(), client_id.to_string()))
            .cloned())
    }

    async fn upsert(&self, record: ConsentRecord) -> AuthResult<()> {
        self.consents
            .write()
            .await
            .insert((record.user_id.clone(), record.client_id.clone()), record);
        Ok(())
    }

    async fn delete(&self, user_id: &str, client_id: &str) -> AuthResult<()> {
        self.consents
            .write()
            .await
            .remove(&(user_id.to_string(), client_id.to_string()));
        Ok(())
    }
}

// =============================================================================
// Session-client associations
// =============================================================================

/// In-memory `(session, client)` association store.
#[derive(Default)]
pub struct MemorySessionClientStore {
    associations: RwLock<Vec<(String, String)>>,
}

impl MemorySessionClientStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionClientStore for MemorySessionClientStore {
    async fn record(&self, session_id: &str, client_id: &str) -> AuthResult<()> {
        let mut associations = self.associations.write().await;
        let pair = (session_id.to_string(), client_id.to_string());
        if !associations.contains(&pair) {
            associations.push(pair);
        }
        Ok(())
    }

    async fn list_clients(&self, session_id: &str) -> AuthResult<Vec<String>> {
        Ok(self
            .associations
            .read()
            .await
            .iter()
            .filter(|(sid, _)| sid == session_id)
            .map(|(_, client_id)| client_id.clone())
            .collect())
    }

    async fn remove_session(&self, session_id: &str) -> AuthResult<()> {
        self.associations
            .write()
            .await
            .retain(|(sid, _)| sid != session_id);
        Ok(())
    }
}

// =============================================================================
// Passkeys
// =============================================================================

/// In-memory passkey store.
#[derive(Default)]
pub struct MemoryPasskeyStore {
    credentials: RwLock<HashMap<String, PasskeyCredential>>,
}

impl MemoryPasskeyStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PasskeyStore for MemoryPasskeyStore {
    async fn find(&self, credential_id: &str) -> AuthResult<Option<PasskeyCredential>> {
        Ok(self.credentials.read().await.get(credential_id).cloned())
    }

    async fn list_for_user(&self, user_id: &str) -> AuthResult<Vec<PasskeyCredential>> {
        Ok(self
            .credentials
            .read()
            .await
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn upsert(&self, credential: PasskeyCredential) -> AuthResult<()> {
        self.credentials
            .write()
            .await
            .insert(credential.credential_id.clone(), credential);
        Ok(())
    }

    async fn update_sign_count(&self, credential_id: &str, sign_count: u32) -> AuthResult<()> {
        let mut credentials = self.credentials.write().await;
        let credential = credentials
            .get_mut(credential_id)
            .ok_or_else(|| AuthError::internal("unknown credential"))?;
        credential.sign_count = sign_count;
        Ok(())
    }
}

// =============================================================================
// Linked identities
// =============================================================================

/// In-memory linked-identity store.
#[derive(Default)]
pub struct MemoryLinkedIdentityStore {
    links: RwLock<Vec<LinkedIdentity>>,
}

impl MemoryLinkedIdentityStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LinkedIdentityStore for MemoryLinkedIdentityStore {
    async fn find(&self, provider: &str, subject: &str) -> AuthResult<Option<LinkedIdentity>> {
        Ok(self
            .links
            .read()
            .await
            .iter()
            .find(|l| l.provider == provider && l.subject == subject)
            .cloned())
    }

    async fn list_for_user(
        &self,
        user_id: &str,
        provider: &str,
    ) -> AuthResult<Vec<LinkedIdentity>> {
        Ok(self
            .links
            .read()
            .await
            .iter()
            .filter(|l| l.user_id == user_id && l.provider == provider)
            .cloned()
            .collect())
    }

    async fn create(&self, link: LinkedIdentity) -> AuthResult<()> {
        let mut links = self.links.write().await;
        if links
            .iter()
            .any(|l| l.provider == link.provider && l.subject == link.subject)
        {
            return Err(AuthError::invalid_request("identity is already linked"));
        }
        links.push(link);
        Ok(())
    }

    async fn delete(&self, provider: &str, subject: &str) -> AuthResult<()> {
        self.links
            .write()
            .await
            .retain(|l| !(l.provider == provider && l.subject == subject));
        Ok(())
    }
}

// =============================================================================
// Identity providers
// =============================================================================

/// In-memory SAML identity-provider store.
#[derive(Default)]
pub struct MemoryIdentityProviderStore {
    providers: RwLock<HashMap<String, IdentityProvider>>,
}

impl MemoryIdentityProviderStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Provisions an IdP.
    pub async fn insert(&self, idp: IdentityProvider) {
        self.providers
            .write()
            .await
            .insert(idp.entity_id.clone(), idp);
    }
}

#[async_trait]
impl IdentityProviderStore for MemoryIdentityProviderStore {
    async fn find_by_entity_id(&self, entity_id: &str) -> AuthResult<Option<IdentityProvider>> {
        Ok(self.providers.read().await.get(entity_id).cloned())
    }
}

// =============================================================================
// SAML replay
// =============================================================================

/// In-memory SAML replay store.
#[derive(Default)]
pub struct MemorySamlReplayStore {
    assertions: RwLock<HashMap<String, i64>>,
    requests: RwLock<HashMap<String, i64>>,
}

impl MemorySamlReplayStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SamlReplayStore for MemorySamlReplayStore {
    async fn mark_assertion_used(&self, assertion_id: &str, ttl_secs: i64) -> AuthResult<bool> {
        let now = now_unix();
        let mut assertions = self.assertions.write().await;
        assertions.retain(|_, expires_at| *expires_at > now);
        if assertions.contains_key(assertion_id) {
            return Ok(false);
        }
        assertions.insert(assertion_id.to_string(), now + ttl_secs);
        Ok(true)
    }

    async fn store_request_id(&self, request_id: &str, ttl_secs: i64) -> AuthResult<()> {
        self.requests
            .write()
            .await
            .insert(request_id.to_string(), now_unix() + ttl_secs);
        Ok(())
    }

    async fn consume_request_id(&self, request_id: &str) -> AuthResult<bool> {
        let now = now_unix();
        let mut requests = self.requests.write().await;
        match requests.remove(request_id) {
            Some(expires_at) => Ok(expires_at > now),
            None => Ok(false),
        }
    }
}
