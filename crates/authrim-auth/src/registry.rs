//! Read-through client registry cache.
//!
//! Client metadata changes on admin timescales, so lookups are cached with
//! a bounded TTL. Misses are cached too (negative caching), keeping a
//! misbehaving client id from hammering the store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::AuthResult;
use crate::storage::ClientStore;
use crate::types::Client;

struct CacheEntry {
    client: Option<Arc<Client>>,
    fetched_at: Instant,
}

/// Read-through cache over [`ClientStore`].
pub struct ClientRegistry {
    store: Arc<dyn ClientStore>,
    cache: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl ClientRegistry {
    /// Creates a registry with the given staleness bound.
    #[must_use]
    pub fn new(store: Arc<dyn ClientStore>, ttl: Duration) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Looks up a client, consulting the store on a cold or stale entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store fails on a cache miss.
    pub async fn get(&self, client_id: &str) -> AuthResult<Option<Arc<Client>>> {
        if let Some(entry) = self.cache.get(client_id)
            && entry.fetched_at.elapsed() < self.ttl
        {
            return Ok(entry.client.clone());
        }

        let client = self
            .store
            .find_by_client_id(client_id)
            .await?
            .map(Arc::new);
        self.cache.insert(
            client_id.to_string(),
            CacheEntry {
                client: client.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(client)
    }

    /// Drops a cached entry, forcing the next lookup through to the store.
    pub fn invalidate(&self, client_id: &str) {
        self.cache.remove(client_id);
    }
}
