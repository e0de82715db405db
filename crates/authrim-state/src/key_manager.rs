//! Signing-key manager.
//!
//! A single global actor (`default-v3`) owns the active RSA signing key.
//! Rotation archives the previous key, which stays in the published JWKS
//! for a grace period so tokens signed before the rotation keep verifying.
//! Rotation is idempotent within the rotation interval: concurrent or
//! repeated rotate calls inside the interval return the current key.

use std::sync::Arc;

use tokio::sync::RwLock;

use authrim_core::time::now_unix;
use authrim_crypto::jwk::{Jwk, Jwks};
use authrim_crypto::keys::{SigningAlgorithm, SigningKeyPair};

use crate::StateResult;

/// The active key with its private material, as handed to the token issuer.
#[derive(Clone)]
pub struct ActiveKey {
    /// Key ID.
    pub kid: String,
    /// The key pair (holds the private key).
    pub key_pair: Arc<SigningKeyPair>,
    /// Public JWK for the JWKS endpoint.
    pub public_jwk: Jwk,
}

struct ArchivedKey {
    key_pair: Arc<SigningKeyPair>,
    retired_at: i64,
}

struct KeyRing {
    active: Option<Arc<SigningKeyPair>>,
    last_rotated: i64,
    archived: Vec<ArchivedKey>,
}

/// The key-manager actor.
pub struct KeyManager {
    algorithm: SigningAlgorithm,
    rotation_interval_secs: i64,
    retirement_grace_secs: i64,
    ring: RwLock<KeyRing>,
}

impl KeyManager {
    /// Creates a key manager. No key exists until first use.
    #[must_use]
    pub fn new(
        algorithm: SigningAlgorithm,
        rotation_interval_secs: i64,
        retirement_grace_secs: i64,
    ) -> Self {
        Self {
            algorithm,
            rotation_interval_secs,
            retirement_grace_secs,
            ring: RwLock::new(KeyRing {
                active: None,
                last_rotated: 0,
                archived: Vec::new(),
            }),
        }
    }

    /// Returns the active key, generating one at first use.
    ///
    /// # Errors
    ///
    /// Returns a crypto error if key generation fails.
    pub async fn get_active_key(&self) -> StateResult<ActiveKey> {
        {
            let ring = self.ring.read().await;
            if let Some(active) = &ring.active {
                return Ok(Self::view(active));
            }
        }

        let mut ring = self.ring.write().await;
        // Re-check under the write lock: another task may have generated.
        if let Some(active) = &ring.active {
            return Ok(Self::view(active));
        }
        let key = Arc::new(SigningKeyPair::generate(self.algorithm)?);
        tracing::info!(kid = %key.kid, "generated initial signing key");
        ring.active = Some(Arc::clone(&key));
        ring.last_rotated = now_unix();
        Ok(Self::view(&key))
    }

    /// Rotates the signing key, archiving the previous one.
    ///
    /// Idempotent within the rotation interval: a rotate call before the
    /// interval elapses returns the current key unchanged.
    ///
    /// # Errors
    ///
    /// Returns a crypto error if key generation fails.
    pub async fn rotate_keys(&self) -> StateResult<ActiveKey> {
        let mut ring = self.ring.write().await;
        let now = now_unix();

        if let Some(active) = &ring.active
            && now - ring.last_rotated < self.rotation_interval_secs
        {
            return Ok(Self::view(active));
        }

        let key = Arc::new(SigningKeyPair::generate(self.algorithm)?);
        tracing::info!(kid = %key.kid, "rotated signing key");
        if let Some(previous) = ring.active.take() {
            ring.archived.push(ArchivedKey {
                key_pair: previous,
                retired_at: now,
            });
        }
        let grace = self.retirement_grace_secs;
        ring.archived.retain(|a| now - a.retired_at < grace);
        ring.active = Some(Arc::clone(&key));
        ring.last_rotated = now;
        Ok(Self::view(&key))
    }

    /// All public keys: the active key plus archived keys still inside the
    /// retirement grace. Backs the JWKS endpoint.
    pub async fn get_all_public_keys(&self) -> Vec<Jwk> {
        let ring = self.ring.read().await;
        let now = now_unix();
        let mut keys = Vec::new();
        if let Some(active) = &ring.active {
            keys.push(active.public_jwk());
        }
        for archived in &ring.archived {
            if now - archived.retired_at < self.retirement_grace_secs {
                keys.push(archived.key_pair.public_jwk());
            }
        }
        keys
    }

    /// Verification key set: the same keys as [`Self::get_all_public_keys`]
    /// wrapped as a [`Jwks`], for verifying `id_token_hint` and self-issued
    /// tokens.
    pub async fn verification_jwks(&self) -> Jwks {
        Jwks {
            keys: self.get_all_public_keys().await,
        }
    }

    fn view(key: &Arc<SigningKeyPair>) -> ActiveKey {
        ActiveKey {
            kid: key.kid.clone(),
            key_pair: Arc::clone(key),
            public_jwk: key.public_jwk(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_use_generates() {
        let manager = KeyManager::new(SigningAlgorithm::RS256, 3600, 7200);
        let key = manager.get_active_key().await.unwrap();
        assert!(!key.kid.is_empty());

        // Same key on the second call.
        let again = manager.get_active_key().await.unwrap();
        assert_eq!(again.kid, key.kid);
    }

    #[tokio::test]
    async fn test_rotation_idempotent_within_interval() {
        let manager = KeyManager::new(SigningAlgorithm::RS256, 3600, 7200);
        let first = manager.get_active_key().await.unwrap();
        let rotated = manager.rotate_keys().await.unwrap();
        assert_eq!(rotated.kid, first.kid, "inside the interval: no-op");
    }

    #[tokio::test]
    async fn test_rotation_archives_previous() {
        // Zero interval: every rotate call is effective.
        let manager = KeyManager::new(SigningAlgorithm::RS256, 0, 7200);
        let first = manager.get_active_key().await.unwrap();
        let second = manager.rotate_keys().await.unwrap();
        assert_ne!(second.kid, first.kid);

        let kids: Vec<String> = manager
            .get_all_public_keys()
            .await
            .into_iter()
            .filter_map(|k| k.kid)
            .collect();
        assert!(kids.contains(&first.kid), "previous key stays in the JWKS");
        assert!(kids.contains(&second.kid));
    }

    #[tokio::test]
    async fn test_grace_expiry_drops_archived() {
        // Zero grace: archived keys disappear immediately.
        let manager = KeyManager::new(SigningAlgorithm::RS256, 0, 0);
        let first = manager.get_active_key().await.unwrap();
        let second = manager.rotate_keys().await.unwrap();

        let kids: Vec<String> = manager
            .get_all_public_keys()
            .await
            .into_iter()
            .filter_map(|k| k.kid)
            .collect();
        assert!(!kids.contains(&first.kid));
        assert!(kids.contains(&second.kid));
    }

    #[tokio::test]
    async fn test_tokens_signed_before_rotation_verify() {
        use jsonwebtoken::{Algorithm, Validation};
        use serde::{Deserialize, Serialize};

        #[derive(Serialize, Deserialize)]
        struct Claims {
            sub: String,
            exp: i64,
        }

        let manager = KeyManager::new(SigningAlgorithm::RS256, 0, 7200);
        let old = manager.get_active_key().await.unwrap();
        let token = old
            .key_pair
            .sign(&Claims {
                sub: "u".to_string(),
                exp: now_unix() + 300,
            })
            .unwrap();

        manager.rotate_keys().await.unwrap();

        let jwks = manager.verification_jwks().await;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_aud = false;
        let verified = authrim_crypto::verify_with_jwks::<Claims>(&token, &jwks, &validation);
        assert!(verified.is_ok());
    }
}
