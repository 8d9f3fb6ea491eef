//! Error types for the cache layer.

use mesh_types::MeshError;

/// Errors raised while encoding or decoding cache packets.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The packet ended before a field could be read.
    #[error("packet truncated: needed {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        /// Read position.
        offset: usize,
        /// Bytes the field requires.
        needed: usize,
        /// Bytes left in the packet.
        available: usize,
    },

    /// A length prefix was negative.
    #[error("invalid length prefix: {0}")]
    NegativeLength(i32),

    /// A payload does not fit a 32-bit length prefix.
    #[error("payload too large for packet: {0} bytes")]
    TooLarge(usize),

    /// The compressed flag byte was neither 0 nor 1.
    #[error("invalid compressed flag: {0}")]
    InvalidFlag(u8),

    /// Bytes were left over after the last field.
    #[error("{0} trailing bytes after packet")]
    TrailingBytes(usize),

    /// zlib compression or decompression failed.
    #[error("compression error: {0}")]
    Compression(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding failed.
    #[error("msgpack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding failed.
    #[error("msgpack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// A key part was not valid UTF-8.
    #[error("key is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// The named serialization format is not supported.
    #[error("unsupported serialization format: {0}")]
    UnsupportedFormat(String),
}

/// Errors reported by a cache store.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// A packet could not be encoded or decoded.
    #[error("cache codec error: {0}")]
    Codec(#[from] CodecError),

    /// The backend failed.
    #[error("cache backend error: {0}")]
    Backend(String),

    /// The store was stopped.
    #[error("cache store is not running")]
    NotRunning,
}

impl From<CacheError> for MeshError {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::Codec(codec) => MeshError::serialization(codec.to_string()),
            other => MeshError::cache_backend(other.to_string()),
        }
    }
}
