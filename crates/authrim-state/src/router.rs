//! Shard routing.
//!
//! The router is the only code that knows the actor naming scheme. Every
//! other component asks it for an [`ActorAddress`] or a fresh sharded
//! identifier and treats the result as opaque.
//!
//! The shard count is runtime-reloadable. Identifiers embed their shard
//! index, so a reload only affects where *new* state is placed; in-flight
//! codes and sessions remain resolvable under the old placement.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use arc_swap::ArcSwap;
use sha2::{Digest, Sha256};

use authrim_core::id::{AuthCode, ParRequestUri, SessionId};

/// The address of one actor instance: a namespace (actor kind) plus the
/// instance name within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActorAddress {
    /// Actor kind, e.g. `auth-code`, `par`, `challenge`, `session`.
    pub namespace: &'static str,
    /// Instance name within the namespace, e.g. `shard-3`.
    pub name: String,
}

impl ActorAddress {
    fn sharded(namespace: &'static str, shard: u32) -> Self {
        Self {
            namespace,
            name: format!("shard-{shard}"),
        }
    }
}

/// Routing parameters captured at construction and reloadable afterwards.
#[derive(Debug, Clone)]
struct RouterConfig {
    shard_count: u32,
    region: String,
    generation: u32,
}

/// Maps logical keys to shard instances.
#[derive(Debug)]
pub struct ShardRouter {
    config: ArcSwap<RouterConfig>,
    /// Round-robin cursor for assigning new sessions across shards.
    session_cursor: AtomicU32,
}

impl ShardRouter {
    /// Creates a router.
    #[must_use]
    pub fn new(shard_count: u32, region: impl Into<String>, generation: u32) -> Self {
        Self {
            config: ArcSwap::from_pointee(RouterConfig {
                shard_count: shard_count.max(1),
                region: region.into(),
                generation,
            }),
            session_cursor: AtomicU32::new(0),
        }
    }

    /// Current shard count.
    #[must_use]
    pub fn shard_count(&self) -> u32 {
        self.config.load().shard_count
    }

    /// Replaces the shard count, returning `(previous, current)`.
    ///
    /// Only the placement of new identifiers changes; existing identifiers
    /// keep routing to their embedded shard.
    pub fn reload_shard_count(&self, shard_count: u32) -> (u32, u32) {
        let current = self.config.load();
        let previous = current.shard_count;
        self.config.store(Arc::new(RouterConfig {
            shard_count: shard_count.max(1),
            region: current.region.clone(),
            generation: current.generation,
        }));
        (previous, shard_count.max(1))
    }

    /// Shard index for a new authorization code.
    ///
    /// When the user has a live session, the code is collocated on the
    /// session's shard to keep the issue/consume pair local. Otherwise the
    /// code lands on `hash(user_id ‖ client_id) mod shard_count`.
    #[must_use]
    pub fn auth_code_shard(&self, user_id: &str, client_id: &str, session: Option<&SessionId>) -> u32 {
        if let Some(session) = session {
            return session.shard;
        }
        let mut key = String::with_capacity(user_id.len() + client_id.len());
        key.push_str(user_id);
        key.push_str(client_id);
        stable_shard(&key, self.shard_count())
    }

    /// Address of the auth-code actor for an existing code.
    #[must_use]
    pub fn auth_code_address(&self, code: &AuthCode) -> ActorAddress {
        ActorAddress::sharded("auth-code", code.shard)
    }

    /// Shard index for a challenge id.
    #[must_use]
    pub fn challenge_shard(&self, challenge_id: &str) -> u32 {
        stable_shard(challenge_id, self.shard_count())
    }

    /// Address of the challenge actor for an id.
    #[must_use]
    pub fn challenge_address(&self, challenge_id: &str) -> ActorAddress {
        ActorAddress::sharded("challenge", self.challenge_shard(challenge_id))
    }

    /// Allocates a new session id, spreading sessions across shards.
    #[must_use]
    pub fn new_session_id(&self) -> SessionId {
        let count = self.shard_count();
        let shard = self.session_cursor.fetch_add(1, Ordering::Relaxed) % count;
        SessionId::new(shard)
    }

    /// Address of the session actor for an existing session id.
    #[must_use]
    pub fn session_address(&self, session: &SessionId) -> ActorAddress {
        ActorAddress::sharded("session", session.shard)
    }

    /// Allocates a new PAR request URI. The shard index is encoded in the
    /// URI itself so resolution never needs a metadata lookup.
    #[must_use]
    pub fn new_par_uri(&self) -> ParRequestUri {
        let config = self.config.load();
        let shard = stable_shard(&uuid::Uuid::new_v4().to_string(), config.shard_count);
        ParRequestUri::new(config.generation, config.region.clone(), shard)
    }

    /// Address of the rate-limiter actor for a bucket.
    #[must_use]
    pub fn rate_limiter_address(&self, bucket: &str) -> ActorAddress {
        ActorAddress {
            namespace: "rate-limiter",
            name: bucket.to_string(),
        }
    }

    /// Address of the key-manager actor. There is exactly one.
    #[must_use]
    pub fn key_manager_address(&self) -> ActorAddress {
        ActorAddress {
            namespace: "key-manager",
            name: "default-v3".to_string(),
        }
    }
}

/// Stable shard assignment: first four bytes of SHA-256 of the key,
/// mod the shard count. Stable across processes and releases, unlike the
/// std hasher.
#[must_use]
pub fn stable_shard(key: &str, shard_count: u32) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    n % shard_count.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_shard_deterministic() {
        assert_eq!(stable_shard("user-1client-1", 8), stable_shard("user-1client-1", 8));
        assert!(stable_shard("anything", 8) < 8);
    }

    #[test]
    fn test_session_locality_override() {
        let router = ShardRouter::new(8, "us", 1);
        let session = SessionId::new(5);
        assert_eq!(router.auth_code_shard("u", "c", Some(&session)), 5);
    }

    #[test]
    fn test_hash_routing_without_session() {
        let router = ShardRouter::new(8, "us", 1);
        let a = router.auth_code_shard("user-1", "client-1", None);
        let b = router.auth_code_shard("user-1", "client-1", None);
        assert_eq!(a, b);
        assert!(a < 8);
    }

    #[test]
    fn test_reload_returns_previous_and_current() {
        let router = ShardRouter::new(8, "us", 1);
        assert_eq!(router.reload_shard_count(16), (8, 16));
        assert_eq!(router.shard_count(), 16);
    }

    #[test]
    fn test_existing_ids_route_by_embedded_shard_after_reload() {
        let router = ShardRouter::new(8, "us", 1);
        let code = AuthCode::generate(7);
        router.reload_shard_count(4);
        // Address resolution uses the embedded index, not the new count.
        assert_eq!(router.auth_code_address(&code).name, "shard-7");
    }

    #[test]
    fn test_par_uri_carries_region_and_generation() {
        let router = ShardRouter::new(8, "eu", 2);
        let uri = router.new_par_uri();
        assert_eq!(uri.region, "eu");
        assert_eq!(uri.generation, 2);
        assert!(uri.shard < 8);
    }

    #[test]
    fn test_key_manager_is_singleton_instance() {
        let router = ShardRouter::new(8, "us", 1);
        assert_eq!(router.key_manager_address().name, "default-v3");
    }

    #[test]
    fn test_new_sessions_spread_across_shards() {
        let router = ShardRouter::new(4, "us", 1);
        let shards: Vec<u32> = (0..4).map(|_| router.new_session_id().shard).collect();
        assert_eq!(shards, vec![0, 1, 2, 3]);
    }
}
