//! Pluggable key/value storage
//!
//! The engine persists inbox idempotence records and cached remote documents
//! through this interface. Keys are sequences of strings so that backends can
//! map them onto their own namespacing (Redis key paths, table columns, and
//! so on); values are JSON.

use crate::error::Error;
use async_trait::async_trait;
use serde_json::Value;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;

/// A key in a [KvStore]: a non-empty sequence of strings.
pub type KvKey = Vec<String>;

/// Namespaced key/value store with optional TTL. The backend must provide its
/// own concurrency safety; the engine serializes nothing on top.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Look up a value. Expired entries count as absent.
    async fn get(&self, key: &[String]) -> Result<Option<Value>, Error>;

    /// Store a value, optionally expiring after `ttl`.
    async fn set(&self, key: &[String], value: Value, ttl: Option<Duration>) -> Result<(), Error>;

    /// Remove a value. Removing an absent key is not an error.
    async fn delete(&self, key: &[String]) -> Result<(), Error>;
}

/// In-memory [KvStore] for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<KvKey, (Value, Option<Instant>)>>,
}

impl MemoryKvStore {
    /// Create an empty store.
    pub fn new() -> MemoryKvStore {
        MemoryKvStore::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &[String]) -> Result<Option<Value>, Error> {
        let expired = {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return Ok(None),
                Some((_, Some(deadline))) if *deadline <= Instant::now() => true,
                Some((value, _)) => return Ok(Some(value.clone())),
            }
        };
        if expired {
            self.entries.write().await.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &[String], value: Value, ttl: Option<Duration>) -> Result<(), Error> {
        let deadline = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .write()
            .await
            .insert(key.to_vec(), (value, deadline));
        Ok(())
    }

    async fn delete(&self, key: &[String]) -> Result<(), Error> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(parts: &[&str]) -> KvKey {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryKvStore::new();
        let k = key(&["_fedikit", "activityIdempotence", "https://a/1"]);
        assert_eq!(store.get(&k).await.unwrap(), None);
        store.set(&k, json!(true), None).await.unwrap();
        assert_eq!(store.get(&k).await.unwrap(), Some(json!(true)));
        store.delete(&k).await.unwrap();
        assert_eq!(store.get(&k).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryKvStore::new();
        let k = key(&["doc"]);
        store
            .set(&k, json!("cached"), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(store.get(&k).await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get(&k).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keys_are_sequences() {
        let store = MemoryKvStore::new();
        store.set(&key(&["a", "b"]), json!(1), None).await.unwrap();
        assert_eq!(store.get(&key(&["a"])).await.unwrap(), None);
        assert_eq!(store.get(&key(&["a", "b"])).await.unwrap(), Some(json!(1)));
    }
}
