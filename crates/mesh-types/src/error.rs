//! The cross-process failure value carried by every call in the mesh.
//!
//! A [`MeshError`] is returned (never thrown) from local handlers, remote
//! containers, and the broker. It serializes with `serde` so a remote node
//! can put it in a reply packet and the caller sees the exact same kind,
//! code, message, and data the remote handler produced.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The failure categories recognized by the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// No provider is registered for the requested action or node.
    ServiceNotFound,
    /// A remote call did not receive its reply before the deadline.
    RequestTimeout,
    /// The target node disconnected or could not be reached.
    NodeUnreachable,
    /// The call parameters were malformed.
    Validation,
    /// A value could not be serialized or deserialized.
    Serialization,
    /// The remote handler itself failed.
    RemoteExecution,
    /// The local handler failed or panicked.
    LocalExecution,
    /// The cache backend reported an I/O or decoding failure.
    CacheBackend,
    /// The holder of a pending call cancelled it.
    Cancelled,
}

impl ErrorKind {
    /// Returns the wire label for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServiceNotFound => "SERVICE_NOT_FOUND",
            Self::RequestTimeout => "REQUEST_TIMEOUT",
            Self::NodeUnreachable => "NODE_UNREACHABLE",
            Self::Validation => "VALIDATION",
            Self::Serialization => "SERIALIZATION",
            Self::RemoteExecution => "REMOTE_EXECUTION",
            Self::LocalExecution => "LOCAL_EXECUTION",
            Self::CacheBackend => "CACHE_BACKEND",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// HTTP-like status code used when the producer supplies none.
    pub fn default_code(self) -> i32 {
        match self {
            Self::ServiceNotFound => 404,
            Self::RequestTimeout => 504,
            Self::NodeUnreachable => 503,
            Self::Validation => 422,
            Self::Serialization => 500,
            Self::RemoteExecution => 500,
            Self::LocalExecution => 500,
            Self::CacheBackend => 500,
            Self::Cancelled => 499,
        }
    }

    /// Whether a failure of this kind is transient by default.
    pub fn default_retriable(self) -> bool {
        matches!(
            self,
            Self::RequestTimeout | Self::NodeUnreachable | Self::CacheBackend
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed, retriable-annotated failure with a status code and payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} ({code}): {message}")]
pub struct MeshError {
    /// Failure category.
    pub kind: ErrorKind,
    /// Whether the caller may retry the operation.
    pub retriable: bool,
    /// HTTP-like status code.
    pub code: i32,
    /// Human-readable description.
    pub message: String,
    /// Arbitrary structured payload (`null` when absent).
    #[serde(default)]
    pub data: Value,
    /// The node on which the failure was produced, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl MeshError {
    /// Creates an error of the given kind with the kind's default code and
    /// retriability.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retriable: kind.default_retriable(),
            code: kind.default_code(),
            message: message.into(),
            data: Value::Null,
            node_id: None,
        }
    }

    /// No provider for `action` (optionally on a pinned `node_id`).
    pub fn service_not_found(action: &str, node_id: Option<&str>) -> Self {
        let message = match node_id {
            Some(node) => format!("Service '{action}' is not found on '{node}' node."),
            None => format!("Service '{action}' is not found."),
        };
        Self::new(ErrorKind::ServiceNotFound, message)
            .with_data(serde_json::json!({ "action": action, "nodeID": node_id }))
    }

    /// The remote call for `action` timed out on `node_id`.
    pub fn request_timeout(action: &str, node_id: &str) -> Self {
        Self::new(
            ErrorKind::RequestTimeout,
            format!("Request is timed out when call '{action}' action on '{node_id}' node."),
        )
        .with_data(serde_json::json!({ "action": action, "nodeID": node_id }))
    }

    /// `node_id` could not be reached.
    pub fn node_unreachable(node_id: &str, reason: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::NodeUnreachable,
            format!("Node '{node_id}' is unreachable: {reason}"),
        )
        .with_data(serde_json::json!({ "nodeID": node_id }))
    }

    /// Malformed parameters.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Encoding or decoding failed.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    /// The handler on `node_id` reported a failure.
    pub fn remote_execution(node_id: &str, code: i32, message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorKind::RemoteExecution, message);
        err.code = code;
        err.node_id = Some(node_id.to_string());
        err
    }

    /// A local handler failed or panicked.
    pub fn local_execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LocalExecution, message)
    }

    /// The cache backend failed.
    pub fn cache_backend(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CacheBackend, message)
    }

    /// The pending call was cancelled by its holder.
    pub fn cancelled(action: &str) -> Self {
        Self::new(ErrorKind::Cancelled, format!("Call of '{action}' was cancelled."))
    }

    /// Replaces the payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Overrides the status code.
    pub fn with_code(mut self, code: i32) -> Self {
        self.code = code;
        self
    }

    /// Overrides retriability (a caller policy may mark any kind retriable).
    pub fn with_retriable(mut self, retriable: bool) -> Self {
        self.retriable = retriable;
        self
    }

    /// Stamps the producing node, unless one is already recorded.
    pub fn on_node(mut self, node_id: &str) -> Self {
        if self.node_id.is_none() {
            self.node_id = Some(node_id.to_string());
        }
        self
    }

    /// Whether the caller may retry.
    pub fn is_retriable(&self) -> bool {
        self.retriable
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds_are_retriable() {
        assert!(MeshError::request_timeout("math.add", "node-2").is_retriable());
        assert!(MeshError::node_unreachable("node-2", "gone").is_retriable());
        assert!(MeshError::cache_backend("io").is_retriable());
    }

    #[test]
    fn definitional_kinds_are_not_retriable() {
        assert!(!MeshError::service_not_found("math.add", None).is_retriable());
        assert!(!MeshError::validation("missing field `a`").is_retriable());
        assert!(!MeshError::local_execution("boom").is_retriable());
    }

    #[test]
    fn caller_policy_can_mark_retriable() {
        let err = MeshError::service_not_found("math.add", None).with_retriable(true);
        assert!(err.is_retriable());
        assert_eq!(err.code, 404);
    }

    #[test]
    fn remote_execution_keeps_reported_code() {
        let err = MeshError::remote_execution("node-7", 418, "teapot")
            .with_data(serde_json::json!({ "brew": "earl grey" }));
        assert_eq!(err.kind, ErrorKind::RemoteExecution);
        assert_eq!(err.code, 418);
        assert_eq!(err.node_id.as_deref(), Some("node-7"));
        assert_eq!(err.data["brew"], "earl grey");
    }

    #[test]
    fn survives_json_transport_verbatim() {
        let err = MeshError::remote_execution("node-7", 422, "bad input")
            .with_data(serde_json::json!({ "field": "a" }))
            .with_retriable(true);
        let json = serde_json::to_string(&err).unwrap();
        let back: MeshError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn kind_serializes_as_wire_label() {
        let value = serde_json::to_value(ErrorKind::NodeUnreachable).unwrap();
        assert_eq!(value, ErrorKind::NodeUnreachable.as_str());
    }

    #[test]
    fn display_includes_kind_code_and_message() {
        let err = MeshError::service_not_found("math.add", Some("node-3"));
        let text = err.to_string();
        assert!(text.starts_with("SERVICE_NOT_FOUND (404)"));
        assert!(text.contains("node-3"));
    }

    #[test]
    fn on_node_does_not_overwrite() {
        let err = MeshError::remote_execution("node-7", 500, "x").on_node("node-1");
        assert_eq!(err.node_id.as_deref(), Some("node-7"));
        let err = MeshError::local_execution("x").on_node("node-1");
        assert_eq!(err.node_id.as_deref(), Some("node-1"));
    }
}
