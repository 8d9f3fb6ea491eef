//! Serialization formats for cached values.

use crate::error::CodecError;
use mesh_types::Value;

/// A registered value serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Textual JSON via `serde_json`.
    Json,
    /// Compact binary MessagePack via `rmp-serde`.
    #[default]
    MsgPack,
}

impl Format {
    /// Canonical configuration name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::MsgPack => "msgpack",
        }
    }

    /// Looks up a format by configuration name (case-insensitive).
    pub fn from_name(name: &str) -> Result<Self, CodecError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "msgpack" | "messagepack" | "binary" => Ok(Self::MsgPack),
            other => Err(CodecError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Resolves the configured format, falling back to the default binary
    /// format when the name is missing or unsupported.
    pub fn resolve(name: Option<&str>) -> Self {
        match name {
            None => Self::default(),
            Some(name) => Self::from_name(name).unwrap_or_else(|e| {
                tracing::warn!(format = name, "{}, falling back to {}", e, Self::default().name());
                Self::default()
            }),
        }
    }

    /// Serializes a structured value.
    pub fn serialize(self, value: &Value) -> Result<Vec<u8>, CodecError> {
        Ok(match self {
            Self::Json => serde_json::to_vec(value)?,
            Self::MsgPack => rmp_serde::to_vec_named(value)?,
        })
    }

    /// Deserializes bytes produced by [`Format::serialize`].
    pub fn deserialize(self, bytes: &[u8]) -> Result<Value, CodecError> {
        Ok(match self {
            Self::Json => serde_json::from_slice(bytes)?,
            Self::MsgPack => rmp_serde::from_slice(bytes)?,
        })
    }
}
