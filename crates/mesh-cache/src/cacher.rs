//! The cacher: key derivation in front of a backing store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::CacheConfig;
use crate::hasher::HasherPool;
use crate::key::KeyDeriver;
use crate::memory::PacketStore;
use crate::store::CacheStore;
use mesh_events::Matcher;
use mesh_types::Value;

/// Derives cache keys and delegates storage to a [`CacheStore`].
///
/// Caching is an optimization: every store failure is logged and turned
/// into a miss (for reads) or a no-op (for writes). A store that fails to
/// start is bypassed until a later `start` succeeds.
#[derive(Clone)]
pub struct Cacher {
    keys: KeyDeriver,
    store: Arc<dyn CacheStore>,
    enabled: Arc<AtomicBool>,
}

impl std::fmt::Debug for Cacher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cacher")
            .field("max_key_length", &self.keys.max_key_length())
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

impl Cacher {
    /// Creates a cacher over an arbitrary store.
    pub fn new(keys: KeyDeriver, store: Arc<dyn CacheStore>) -> Self {
        Self {
            keys,
            store,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Creates a cacher backed by an in-process [`PacketStore`].
    pub fn in_memory(config: &CacheConfig, matcher: Arc<Matcher>, hashers: Arc<HasherPool>) -> Self {
        let keys = KeyDeriver::new(config.max_key_length, hashers);
        let store = Arc::new(PacketStore::new(config, matcher));
        Self::new(keys, store)
    }

    /// Key deriver in use.
    pub fn keys(&self) -> &KeyDeriver {
        &self.keys
    }

    /// Returns `false` after the backing store failed to start.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Derives the cache key for a call.
    pub fn cache_key(&self, action: &str, params: Option<&Value>, keys: Option<&[String]>) -> String {
        self.keys.derive_key(action, params, keys)
    }

    /// Looks up a cached value; failures are misses.
    pub async fn get(&self, key: &str) -> Option<Value> {
        if !self.is_enabled() {
            return None;
        }
        match self.store.get(key).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, "unable to read from cache, treating as miss: {}", e);
                None
            }
        }
    }

    /// Stores a value; failures are logged and ignored.
    pub async fn set(&self, key: &str, value: &Value) {
        if !self.is_enabled() {
            return;
        }
        if let Err(e) = self.store.set(key, Some(value)).await {
            tracing::warn!(key, "unable to write to cache: {}", e);
        }
    }

    /// Deletes one entry; failures are logged and ignored.
    pub async fn del(&self, key: &str) {
        if !self.is_enabled() {
            return;
        }
        if let Err(e) = self.store.del(key).await {
            tracing::warn!(key, "unable to delete from cache: {}", e);
        }
    }

    /// Deletes entries matching a glob; failures are logged and ignored.
    pub async fn clean(&self, pattern: &str) {
        if !self.is_enabled() {
            return;
        }
        if let Err(e) = self.store.clean(pattern).await {
            tracing::warn!(pattern, "unable to clean cache: {}", e);
        }
    }

    /// Starts the backing store; on failure caching is disabled.
    pub async fn start(&self) {
        match self.store.start().await {
            Ok(()) => self.enabled.store(true, Ordering::Release),
            Err(e) => {
                self.enabled.store(false, Ordering::Release);
                tracing::warn!("unable to start cache store, caching disabled: {}", e);
            }
        }
    }

    /// Stops the backing store.
    pub async fn stop(&self) {
        self.store.stop().await;
    }
}
