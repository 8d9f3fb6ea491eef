//! Correlation ID generators.
//!
//! Every call and context in the mesh is stamped with a correlation ID so
//! replies can be matched to requests and traces can be stitched together.
//! Two interchangeable generators implement [`UidGenerator`]:
//!
//! - [`IncrementalUidGenerator`]: `<prefix>:<n>` with a process-wide
//!   atomic counter. Fast; unique per (prefix, process lifetime).
//! - [`StandardUidGenerator`]: random v4 UUIDs. Slower, but independent of
//!   any shared counter.
//!
//! The generator in use is chosen by [`UidMode`] at broker startup.

use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Produces correlation IDs. Implementations are safe to call from any
/// number of threads at once.
pub trait UidGenerator: Send + Sync {
    /// Returns a new, never before returned, identifier.
    fn next_uid(&self) -> String;
}

/// Sequence-based generator: `<prefix>:<n>` with strictly increasing `n`.
#[derive(Debug)]
pub struct IncrementalUidGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl IncrementalUidGenerator {
    /// Creates a generator with an explicit prefix.
    ///
    /// An empty prefix falls back to the local hostname.
    pub fn new(prefix: &str) -> Self {
        let prefix = if prefix.is_empty() {
            hostname().unwrap_or_default()
        } else {
            prefix.to_string()
        };
        Self {
            prefix,
            counter: AtomicU64::new(0),
        }
    }

    /// Creates a generator prefixed with the local hostname.
    pub fn with_hostname() -> Self {
        Self::new("")
    }

    /// Returns the prefix in use.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Overrides the prefix. Empty strings are ignored.
    ///
    /// Must be called before the generator is shared; the counter is kept.
    pub fn set_prefix(&mut self, prefix: &str) {
        if !prefix.is_empty() {
            self.prefix = prefix.to_string();
        }
    }

    /// Uses `node_id` as the prefix when no prefix could be determined at
    /// construction (hostname unavailable).
    pub fn started(&mut self, node_id: &str) {
        if self.prefix.is_empty() {
            tracing::debug!(node_id, "hostname unavailable, using node ID as UID prefix");
            self.set_prefix(node_id);
        }
    }
}

impl Default for IncrementalUidGenerator {
    fn default() -> Self {
        Self::with_hostname()
    }
}

impl UidGenerator for IncrementalUidGenerator {
    fn next_uid(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}:{}", self.prefix, n)
    }
}

/// Random UUID generator.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardUidGenerator;

impl UidGenerator for StandardUidGenerator {
    fn next_uid(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Generator selection, as written in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UidMode {
    /// [`IncrementalUidGenerator`].
    #[default]
    Incremental,
    /// [`StandardUidGenerator`].
    Standard,
}

impl std::str::FromStr for UidMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "incremental" => Ok(Self::Incremental),
            "standard" | "uuid" => Ok(Self::Standard),
            other => Err(format!("unknown UID mode: {other}")),
        }
    }
}

/// Builds the configured generator.
///
/// `prefix` overrides the hostname default of the incremental generator;
/// `node_id` is used when neither is available.
pub fn build_generator(mode: UidMode, prefix: Option<&str>, node_id: &str) -> Arc<dyn UidGenerator> {
    match mode {
        UidMode::Incremental => {
            let mut generator = IncrementalUidGenerator::new(prefix.unwrap_or_default());
            generator.started(node_id);
            Arc::new(generator)
        }
        UidMode::Standard => Arc::new(StandardUidGenerator),
    }
}

/// Best-effort local hostname lookup.
pub fn hostname() -> Option<String> {
    for var in ["HOSTNAME", "COMPUTERNAME"] {
        if let Ok(name) = std::env::var(var) {
            let name = name.trim();
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn sequence_of(uid: &str) -> u64 {
        uid.rsplit(':').next().unwrap().parse().unwrap()
    }

    #[test]
    fn incremental_uses_prefix_and_counts_from_one() {
        let generator = IncrementalUidGenerator::new("node-1");
        assert_eq!(generator.next_uid(), "node-1:1");
        assert_eq!(generator.next_uid(), "node-1:2");
        assert_eq!(generator.next_uid(), "node-1:3");
    }

    #[test]
    fn set_prefix_ignores_empty() {
        let mut generator = IncrementalUidGenerator::new("host-a");
        generator.set_prefix("");
        assert_eq!(generator.prefix(), "host-a");
        generator.set_prefix("node-9");
        assert_eq!(generator.next_uid(), "node-9:1");
    }

    #[test]
    fn started_keeps_existing_prefix() {
        let mut generator = IncrementalUidGenerator::new("host-a");
        generator.started("node-1");
        assert_eq!(generator.prefix(), "host-a");
    }

    #[test]
    fn standard_generates_distinct_uuids() {
        let generator = StandardUidGenerator;
        let a = generator.next_uid();
        let b = generator.next_uid();
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn mode_parses_from_config_strings() {
        assert_eq!("incremental".parse::<UidMode>().unwrap(), UidMode::Incremental);
        assert_eq!("Standard".parse::<UidMode>().unwrap(), UidMode::Standard);
        assert!("snowflake".parse::<UidMode>().is_err());
    }

    #[test]
    fn build_generator_honors_explicit_prefix() {
        let generator = build_generator(UidMode::Incremental, Some("broker-x"), "node-1");
        assert_eq!(generator.next_uid(), "broker-x:1");
    }

    #[test]
    fn concurrent_callers_never_collide() {
        let generator = Arc::new(IncrementalUidGenerator::new("node-1"));
        let threads = 8;
        let per_thread = 2_000;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let generator = Arc::clone(&generator);
                std::thread::spawn(move || {
                    (0..per_thread)
                        .map(|_| generator.next_uid())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            let uids = handle.join().expect("generator thread should not panic");
            // Strictly increasing in the order each thread observed them.
            for pair in uids.windows(2) {
                assert!(sequence_of(&pair[0]) < sequence_of(&pair[1]));
            }
            for uid in uids {
                assert!(all.insert(uid), "duplicate UID generated");
            }
        }
        assert_eq!(all.len(), threads * per_thread);
    }

    #[tokio::test]
    async fn concurrent_tasks_never_collide() {
        let generator = build_generator(UidMode::Incremental, Some("node-2"), "node-2");
        let mut handles = Vec::new();
        for _ in 0..100 {
            let generator = Arc::clone(&generator);
            handles.push(tokio::task::spawn_blocking(move || generator.next_uid()));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            assert!(seen.insert(handle.await.expect("task should not panic")));
        }
        assert_eq!(seen.len(), 100);
    }
}
