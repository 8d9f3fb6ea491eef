//! The backing store contract.

use async_trait::async_trait;

use crate::error::CacheError;
use mesh_types::Value;

/// A key/value store holding cached action results.
///
/// Implementations report failures as [`CacheError`]; the [`crate::Cacher`]
/// logs them and treats the call as a miss, so a broken store never fails
/// an action call.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns the value stored under `key`, or `None` on a miss.
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    /// Stores `value` under `key`; `None` deletes the entry.
    async fn set(&self, key: &str, value: Option<&Value>) -> Result<(), CacheError>;

    /// Deletes the entry under `key`.
    async fn del(&self, key: &str) -> Result<(), CacheError>;

    /// Deletes entries matching a glob.
    ///
    /// An empty pattern, or one that is `*` followed by no further
    /// wildcards, clears the store. A pattern without wildcards deletes a
    /// single key. Anything else deletes every key matching the pattern
    /// under event-mask semantics.
    async fn clean(&self, pattern: &str) -> Result<(), CacheError>;

    /// Prepares the store for use.
    async fn start(&self) -> Result<(), CacheError> {
        Ok(())
    }

    /// Releases the store's contents.
    async fn stop(&self) {}
}

/// How a `clean` pattern should be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanScope<'a> {
    /// Remove everything.
    All,
    /// Remove the single key.
    Exact(&'a str),
    /// Remove keys matching the glob.
    Matching(&'a str),
}

impl<'a> CleanScope<'a> {
    /// Classifies a `clean` pattern.
    pub fn of(pattern: &'a str) -> Self {
        if pattern.is_empty() {
            return Self::All;
        }
        if pattern.starts_with('*') && !mesh_events::is_pattern(pattern.trim_start_matches('*')) {
            return Self::All;
        }
        if mesh_events::is_pattern(pattern) {
            Self::Matching(pattern)
        } else {
            Self::Exact(pattern)
        }
    }
}
