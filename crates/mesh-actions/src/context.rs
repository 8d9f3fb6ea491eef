//! Call contexts and per-call options.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use mesh_types::Value;
use mesh_uid::UidGenerator;

/// Options attached to a single call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallOptions {
    /// Pin the call to this node instead of load balancing.
    #[serde(default)]
    pub node_id: Option<String>,
    /// Reply deadline for remote calls (`None` = wait indefinitely).
    #[serde(default, with = "duration_ms")]
    pub timeout: Option<Duration>,
    /// Skip the local provider even if one is registered.
    #[serde(default)]
    pub exclude_local: bool,
}

impl CallOptions {
    /// Pins the call to `node_id`.
    pub fn on_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Sets the reply deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Excludes the local provider from selection.
    pub fn remote_only(mut self) -> Self {
        self.exclude_local = true;
        self
    }
}

/// One in-flight invocation of an action.
#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    /// Correlation ID of this call.
    pub id: String,
    /// Correlation ID of the root call of the chain.
    pub request_id: String,
    /// Correlation ID of the calling context, if nested.
    pub parent_id: Option<String>,
    /// Nesting depth (root calls are level 1).
    pub level: u32,
    /// Action name.
    pub action: String,
    /// Call parameters.
    pub params: Value,
    /// Node that issued the call.
    pub caller: String,
    /// Options in effect.
    pub options: CallOptions,
}

impl Context {
    /// Creates a context, stamping a fresh correlation ID. A `parent`
    /// makes this a nested call in the parent's chain.
    pub fn new(
        uid: &dyn UidGenerator,
        caller: &str,
        action: &str,
        params: Value,
        options: CallOptions,
        parent: Option<&Context>,
    ) -> Self {
        let id = uid.next_uid();
        let (request_id, parent_id, level) = match parent {
            Some(p) => (p.request_id.clone(), Some(p.id.clone()), p.level + 1),
            None => (id.clone(), None, 1),
        };
        Self {
            id,
            request_id,
            parent_id,
            level,
            action: action.to_string(),
            params,
            caller: caller.to_string(),
            options,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
