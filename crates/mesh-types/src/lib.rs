//! Shared types, error definitions, and constants for the mesh runtime.
//!
//! Every crate in the workspace depends on `mesh-types` for the
//! cross-process error value ([`MeshError`]) and the structured value type
//! that flows through calls, events, and the cache. Nothing in this crate
//! depends on another workspace crate.

mod error;

pub use error::{ErrorKind, MeshError};

/// Structured call parameters, results, and event payloads.
///
/// A tree of scalars, ordered sequences, and named-field records.
pub type Value = serde_json::Value;

/// Result alias for operations that fail with a [`MeshError`].
pub type MeshResult<T> = Result<T, MeshError>;

/// Separator between the action name and the canonical parameters of a
/// cache key. Also separates a UID prefix from its sequence number.
pub const KEY_SEPARATOR: char = ':';

/// Returns `true` if `node_id` names the local node.
///
/// An empty node ID is treated as local, matching containers created
/// before the node identity is known.
pub fn is_local_node(node_id: &str, local_node_id: &str) -> bool {
    node_id.is_empty() || node_id == local_node_id
}
