//! Cache configuration.

use serde::Deserialize;

/// Settings shared by the key deriver and the packet store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CacheConfig {
    /// Whether cached actions consult the cache at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Maximum cache key length before hashing kicks in.
    ///
    /// `0` disables hashing; values between 1 and 43 are raised to 44.
    #[serde(default)]
    pub max_key_length: usize,

    /// Entry lifetime in seconds (`0` = never expires).
    #[serde(default)]
    pub ttl: u64,

    /// Byte budget of the whole store in megabytes (`0` = unbounded).
    #[serde(default)]
    pub capacity: u64,

    /// Compress key remainders and values larger than this many bytes
    /// (`0` = never compress).
    #[serde(default = "default_compress_above")]
    pub compress_above: usize,

    /// Serialization format name (`"msgpack"` or `"json"`).
    #[serde(default)]
    pub format: Option<String>,

    /// Number of lock segments (rounded up to a power of two; `0` = twice
    /// the number of cores).
    #[serde(default)]
    pub segment_count: usize,

    /// Maximum number of entries across all segments (`0` = unbounded).
    #[serde(default)]
    pub hash_table_size: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_compress_above() -> usize {
    1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_key_length: 0,
            ttl: 0,
            capacity: 0,
            compress_above: default_compress_above(),
            format: None,
            segment_count: 0,
            hash_table_size: 0,
        }
    }
}
