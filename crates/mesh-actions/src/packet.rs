//! Logical envelopes exchanged between nodes.
//!
//! How envelopes are encoded on the wire is up to the transport; the core
//! only relies on the fields below.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::context::{CallOptions, Context};
use mesh_types::{MeshError, Value};

/// An envelope addressed to one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Packet {
    /// Invoke an action on the target node.
    Request(RequestEnvelope),
    /// The outcome of a request.
    Response(ResponseEnvelope),
    /// A published event forwarded to a subscribing node.
    Event(EventEnvelope),
}

impl Packet {
    /// Destination node.
    pub fn target(&self) -> &str {
        match self {
            Self::Request(p) => &p.target,
            Self::Response(p) => &p.target,
            Self::Event(p) => &p.target,
        }
    }

    /// Originating node.
    pub fn sender(&self) -> &str {
        match self {
            Self::Request(p) => &p.sender,
            Self::Response(p) => &p.sender,
            Self::Event(p) => &p.sender,
        }
    }
}

/// Action invocation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Node expected to execute the action.
    pub target: String,
    /// Calling node.
    pub sender: String,
    /// Correlation ID; the response carries the same value.
    pub id: String,
    /// Action name.
    pub action: String,
    /// Call parameters.
    #[serde(default)]
    pub params: Value,
    /// Caller's deadline in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Root correlation ID of the call chain.
    pub request_id: String,
    /// Correlation ID of the calling context.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Nesting depth.
    pub level: u32,
}

impl RequestEnvelope {
    /// Builds a request for `ctx` addressed to `target`.
    pub fn from_context(ctx: &Context, target: &str) -> Self {
        Self {
            target: target.to_string(),
            sender: ctx.caller.clone(),
            id: ctx.id.clone(),
            action: ctx.action.clone(),
            params: ctx.params.clone(),
            timeout_ms: ctx.options.timeout.map(|t| t.as_millis() as u64),
            request_id: ctx.request_id.clone(),
            parent_id: ctx.parent_id.clone(),
            level: ctx.level,
        }
    }

    /// Rebuilds the caller's context on the executing node. The correlation
    /// IDs are kept so the reply (and any nested calls) stay in the chain.
    pub fn to_context(&self) -> Context {
        Context {
            id: self.id.clone(),
            request_id: self.request_id.clone(),
            parent_id: self.parent_id.clone(),
            level: self.level,
            action: self.action.clone(),
            params: self.params.clone(),
            caller: self.sender.clone(),
            options: CallOptions {
                node_id: None,
                timeout: self.timeout_ms.map(Duration::from_millis),
                exclude_local: false,
            },
        }
    }
}

/// Action invocation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// The node that issued the request.
    pub target: String,
    /// The node that executed it.
    pub sender: String,
    /// Correlation ID of the request.
    pub id: String,
    /// Whether the handler succeeded.
    pub success: bool,
    /// Result value on success.
    #[serde(default)]
    pub data: Value,
    /// Failure on error, forwarded verbatim to the caller.
    #[serde(default)]
    pub error: Option<MeshError>,
}

impl ResponseEnvelope {
    /// Builds the response to `request` from a handler outcome.
    pub fn reply_to(request: &RequestEnvelope, local_node_id: &str, outcome: Result<Value, MeshError>) -> Self {
        let (success, data, error) = match outcome {
            Ok(data) => (true, data, None),
            Err(e) => (false, Value::Null, Some(e.on_node(local_node_id))),
        };
        Self {
            target: request.sender.clone(),
            sender: local_node_id.to_string(),
            id: request.id.clone(),
            success,
            data,
            error,
        }
    }

    /// Converts the envelope back into a call outcome.
    pub fn into_result(self) -> Result<Value, MeshError> {
        if self.success {
            return Ok(self.data);
        }
        Err(self.error.unwrap_or_else(|| {
            MeshError::remote_execution(&self.sender, 500, "remote call failed without an error payload")
        }))
    }
}

/// Event forwarded to a subscribing node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Subscribing node.
    pub target: String,
    /// Publishing node.
    pub sender: String,
    /// Event name.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
    /// Groups that should receive it (empty = all, for broadcasts).
    #[serde(default)]
    pub groups: Vec<String>,
    /// Whether every matching subscriber should receive it.
    #[serde(default)]
    pub broadcast: bool,
}
