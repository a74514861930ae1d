//! Memoized remote key fetching
//!
//! Public keys change rarely, so fetch results are cached, including misses,
//! which are negative-cached to stop repeated lookups of dead key ids. A
//! verification failure against a cached key evicts just that entry and
//! retries once with a fresh fetch, which is how key rotation is picked up.

use crate::{
    error::Error,
    fetch::DocumentLoader,
    signatures::keys::{parse_remote_key, RemoteKey},
};
use moka::future::Cache;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Cache of fetched public keys, keyed by key id. `None` entries record
/// fetch misses.
pub struct KeyCache {
    cache: Cache<Url, Option<RemoteKey>>,
}

impl KeyCache {
    /// Create a cache holding entries for `ttl`.
    pub fn new(ttl: Duration) -> KeyCache {
        KeyCache {
            cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub(crate) async fn get(&self, key_id: &Url) -> Option<Option<RemoteKey>> {
        self.cache.get(key_id).await
    }

    pub(crate) async fn insert(&self, key_id: Url, key: Option<RemoteKey>) {
        self.cache.insert(key_id, key).await;
    }

    pub(crate) async fn evict(&self, key_id: &Url) {
        self.cache.invalidate(key_id).await;
    }
}

impl Default for KeyCache {
    fn default() -> Self {
        KeyCache::new(Duration::from_secs(3600))
    }
}

/// Resolves key ids to [RemoteKey]s through the cache and a document loader.
pub struct KeyResolver<'a> {
    cache: &'a KeyCache,
    loader: &'a dyn DocumentLoader,
}

impl<'a> KeyResolver<'a> {
    /// Create a resolver over `cache` and `loader`.
    pub fn new(cache: &'a KeyCache, loader: &'a dyn DocumentLoader) -> KeyResolver<'a> {
        KeyResolver { cache, loader }
    }

    /// Whether the cache currently holds a (positive) entry for `key_id`.
    pub(crate) async fn is_cached(&self, key_id: &Url) -> bool {
        matches!(self.cache.get(key_id).await, Some(Some(_)))
    }

    /// Evict `key_id` from the cache so the next resolve refetches.
    pub(crate) async fn evict(&self, key_id: &Url) {
        self.cache.evict(key_id).await;
    }

    /// Resolve `key_id`, consulting the cache first. A cached miss resolves
    /// to `None` without another fetch.
    pub async fn resolve(&self, key_id: &Url) -> Option<RemoteKey> {
        if let Some(cached) = self.cache.get(key_id).await {
            return cached;
        }
        let fetched = match self.loader.load(key_id).await {
            Ok(remote) => parse_remote_key(&remote.document, key_id),
            Err(Error::Fetch { url, reason }) => {
                debug!(%url, %reason, "Key document fetch failed");
                None
            }
            Err(error) => {
                debug!(%key_id, %error, "Key document fetch failed");
                None
            }
        };
        self.cache.insert(key_id.clone(), fetched.clone()).await;
        fetched
    }
}
