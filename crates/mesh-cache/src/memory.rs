//! In-process packet store.
//!
//! Entries are held as encoded key and value packets, so large results
//! live compressed in memory. The map is split into lock segments chosen by
//! key hash; each segment is an LRU so the byte budget (`capacity`) and the
//! entry cap (`hash_table_size`) evict the least recently used entries
//! first. Expired entries are dropped lazily on read and during `clean`.

use async_trait::async_trait;
use lru::LruCache;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::format::Format;
use crate::packet::PacketCodec;
use crate::store::{CacheStore, CleanScope};
use mesh_events::Matcher;
use mesh_types::Value;

const BYTES_PER_MEGABYTE: u64 = 1024 * 1024;

#[derive(Debug)]
struct Stored {
    packet: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Stored {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug)]
struct Segment {
    entries: LruCache<Vec<u8>, Stored>,
    bytes: usize,
}

impl Segment {
    fn remove(&mut self, key: &[u8]) -> bool {
        match self.entries.pop(key) {
            Some(stored) => {
                self.bytes -= key.len() + stored.packet.len();
                true
            }
            None => false,
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }
}

/// Segmented, LRU-evicting store of encoded packets.
#[derive(Debug)]
pub struct PacketStore {
    codec: PacketCodec,
    ttl: Option<Duration>,
    byte_budget: Option<usize>,
    segments: Vec<Mutex<Segment>>,
    matcher: Arc<Matcher>,
    running: AtomicBool,
}

impl PacketStore {
    /// Builds a store from configuration. The `matcher` serves glob `clean`.
    pub fn new(config: &CacheConfig, matcher: Arc<Matcher>) -> Self {
        let format = Format::resolve(config.format.as_deref());
        let segment_count = segment_count(config.segment_count);
        let per_segment_entries = (config.hash_table_size > 0)
            .then(|| config.hash_table_size.div_ceil(segment_count))
            .and_then(NonZeroUsize::new);
        // A budget too large to represent is treated as no budget at all.
        let byte_budget = (config.capacity > 0)
            .then(|| config.capacity.checked_mul(BYTES_PER_MEGABYTE))
            .flatten()
            .and_then(|bytes| usize::try_from(bytes).ok())
            .map(|bytes| bytes / segment_count);

        let segments = (0..segment_count)
            .map(|_| {
                let entries = match per_segment_entries {
                    Some(cap) => LruCache::new(cap),
                    None => LruCache::unbounded(),
                };
                Mutex::new(Segment { entries, bytes: 0 })
            })
            .collect();

        Self {
            codec: PacketCodec::new(format, config.compress_above),
            ttl: (config.ttl > 0).then(|| Duration::from_secs(config.ttl)),
            byte_budget,
            segments,
            matcher,
            running: AtomicBool::new(true),
        }
    }

    /// Overrides the entry lifetime (tests and programmatic setup).
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// The value serialization format in use.
    pub fn format(&self) -> Format {
        self.codec.format()
    }

    /// Number of lock segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Number of stored entries (expired ones included until swept).
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| lock(s).entries.len()).sum()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes held by key and value packets.
    pub fn bytes(&self) -> usize {
        self.segments.iter().map(|s| lock(s).bytes).sum()
    }

    /// Returns the uncompressed prefixes of all stored keys.
    pub fn key_prefixes(&self) -> Vec<String> {
        let mut prefixes = Vec::new();
        for segment in &self.segments {
            let keys: Vec<Vec<u8>> = lock(segment).entries.iter().map(|(k, _)| k.clone()).collect();
            for key in keys {
                match self.codec.decode_key_prefix(&key) {
                    Ok(prefix) => prefixes.push(prefix),
                    Err(e) => tracing::warn!("skipping undecodable cache key: {}", e),
                }
            }
        }
        prefixes
    }

    fn ensure_running(&self) -> Result<(), CacheError> {
        if self.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(CacheError::NotRunning)
        }
    }

    fn segment_for(&self, packed_key: &[u8]) -> &Mutex<Segment> {
        let mut hasher = DefaultHasher::new();
        packed_key.hash(&mut hasher);
        let index = (hasher.finish() as usize) & (self.segments.len() - 1);
        &self.segments[index]
    }

    fn insert(&self, packed_key: Vec<u8>, packet: Vec<u8>) {
        let stored = Stored {
            packet,
            // Past the end of the clock means the entry never expires.
            expires_at: self.ttl.and_then(|ttl| Instant::now().checked_add(ttl)),
        };
        let size = packed_key.len() + stored.packet.len();
        let mut segment = lock(self.segment_for(&packed_key));
        segment.remove(&packed_key);
        if self.byte_budget.is_some_and(|budget| size > budget) {
            tracing::debug!(size, "cache entry exceeds the segment budget, not stored");
            return;
        }
        segment.bytes += size;
        if let Some((evicted_key, evicted)) = segment.entries.push(packed_key, stored) {
            // `push` only returns an entry here when the entry cap evicted one.
            segment.bytes -= evicted_key.len() + evicted.packet.len();
        }
        if let Some(budget) = self.byte_budget {
            while segment.bytes > budget {
                match segment.entries.pop_lru() {
                    Some((key, evicted)) => segment.bytes -= key.len() + evicted.packet.len(),
                    None => break,
                }
            }
        }
    }

    fn clean_matching(&self, pattern: &str) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for segment in &self.segments {
            let keys: Vec<(Vec<u8>, bool)> = lock(segment)
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.expired(now)))
                .collect();

            let doomed: Vec<Vec<u8>> = keys
                .into_iter()
                .filter(|(key, expired)| {
                    if *expired {
                        return true;
                    }
                    match self.codec.decode_key(key) {
                        Ok(decoded) => self.matcher.matches(&decoded.full(), pattern),
                        Err(e) => {
                            tracing::warn!("dropping undecodable cache key during clean: {}", e);
                            true
                        }
                    }
                })
                .map(|(key, _)| key)
                .collect();

            let mut segment = lock(segment);
            for key in doomed {
                if segment.remove(&key) {
                    removed += 1;
                }
            }
        }
        removed
    }
}

#[async_trait]
impl CacheStore for PacketStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        self.ensure_running()?;
        let packed_key = self.codec.encode_key(key)?;
        let packet = {
            let mut segment = lock(self.segment_for(&packed_key));
            let expired = match segment.entries.get(&packed_key) {
                None => return Ok(None),
                Some(stored) => stored.expired(Instant::now()),
            };
            if expired {
                segment.remove(&packed_key);
                return Ok(None);
            }
            match segment.entries.peek(&packed_key) {
                Some(stored) => stored.packet.clone(),
                None => return Ok(None),
            }
        };
        Ok(Some(self.codec.decode_value(&packet)?))
    }

    async fn set(&self, key: &str, value: Option<&Value>) -> Result<(), CacheError> {
        let Some(value) = value else {
            return self.del(key).await;
        };
        self.ensure_running()?;
        let packed_key = self.codec.encode_key(key)?;
        let packet = self.codec.encode_value(value)?;
        self.insert(packed_key, packet);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.ensure_running()?;
        let packed_key = self.codec.encode_key(key)?;
        lock(self.segment_for(&packed_key)).remove(&packed_key);
        Ok(())
    }

    async fn clean(&self, pattern: &str) -> Result<(), CacheError> {
        self.ensure_running()?;
        match CleanScope::of(pattern) {
            CleanScope::All => {
                for segment in &self.segments {
                    lock(segment).clear();
                }
            }
            CleanScope::Exact(key) => self.del(key).await?,
            CleanScope::Matching(pattern) => {
                let removed = self.clean_matching(pattern);
                tracing::debug!(pattern, removed, "cleaned cache entries");
            }
        }
        Ok(())
    }

    async fn start(&self) -> Result<(), CacheError> {
        self.running.store(true, Ordering::Release);
        tracing::info!(
            format = self.codec.format().name(),
            segments = self.segments.len(),
            ttl_secs = self.ttl.map(|t| t.as_secs()).unwrap_or(0),
            budget_bytes = self.byte_budget.map(|b| b * self.segments.len()).unwrap_or(0),
            "packet cache store started"
        );
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        for segment in &self.segments {
            lock(segment).clear();
        }
    }
}

fn segment_count(configured: usize) -> usize {
    let count = if configured > 0 {
        configured
    } else {
        std::thread::available_parallelism()
            .map(|n| n.get() * 2)
            .unwrap_or(8)
    };
    count.next_power_of_two()
}

fn lock(segment: &Mutex<Segment>) -> MutexGuard<'_, Segment> {
    segment.lock().unwrap_or_else(|poisoned| {
        tracing::error!("cache segment lock poisoned, recovering");
        poisoned.into_inner()
    })
}
