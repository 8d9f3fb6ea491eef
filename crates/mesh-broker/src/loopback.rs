//! In-process network connecting several brokers.
//!
//! Used by the binary's single-node setup and by tests that exercise
//! remote calls without sockets. Every publish is delivered on a spawned
//! task, so the sender never runs the receiver's handler inline.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};

use crate::broker::ServiceBroker;
use mesh_actions::{Packet, Transport};
use mesh_types::MeshError;

/// Routes packets between the brokers that joined it.
#[derive(Debug, Default)]
pub struct LoopbackNetwork {
    nodes: RwLock<HashMap<String, Weak<ServiceBroker>>>,
    muted: RwLock<HashSet<String>>,
}

impl LoopbackNetwork {
    /// Creates an empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport that publishes into this network.
    pub fn transport(self: &Arc<Self>) -> Arc<dyn Transport> {
        Arc::new(LoopbackTransport {
            network: Arc::clone(self),
        })
    }

    /// Makes `broker` reachable under its node ID.
    pub fn join(&self, broker: &Arc<ServiceBroker>) {
        let mut nodes = self.nodes.write().unwrap_or_else(|poisoned| {
            tracing::error!("loopback network lock poisoned, recovering");
            poisoned.into_inner()
        });
        nodes.insert(broker.node_id().to_string(), Arc::downgrade(broker));
    }

    /// Disconnects `node_id`; later publishes to it fail.
    pub fn leave(&self, node_id: &str) -> bool {
        let mut nodes = self.nodes.write().unwrap_or_else(|poisoned| {
            tracing::error!("loopback network lock poisoned, recovering");
            poisoned.into_inner()
        });
        nodes.remove(node_id).is_some()
    }

    /// Silently drops every packet addressed to `node_id` (a partition that
    /// the sender cannot observe).
    pub fn mute(&self, node_id: &str) {
        let mut muted = self.muted.write().unwrap_or_else(|poisoned| {
            tracing::error!("loopback network lock poisoned, recovering");
            poisoned.into_inner()
        });
        muted.insert(node_id.to_string());
    }

    /// Undoes [`LoopbackNetwork::mute`].
    pub fn unmute(&self, node_id: &str) {
        let mut muted = self.muted.write().unwrap_or_else(|poisoned| {
            tracing::error!("loopback network lock poisoned, recovering");
            poisoned.into_inner()
        });
        muted.remove(node_id);
    }

    fn is_muted(&self, node_id: &str) -> bool {
        self.muted
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(node_id)
    }

    fn lookup(&self, node_id: &str) -> Option<Arc<ServiceBroker>> {
        self.nodes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(node_id)
            .and_then(Weak::upgrade)
    }
}

struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn publish(&self, packet: Packet) -> Result<(), MeshError> {
        let target = packet.target().to_string();
        if self.network.is_muted(&target) {
            tracing::debug!(target = %target, "dropping packet to muted node");
            return Ok(());
        }
        let broker = self
            .network
            .lookup(&target)
            .ok_or_else(|| MeshError::node_unreachable(&target, "not connected"))?;
        tokio::spawn(async move {
            broker.handle_packet(packet).await;
        });
        Ok(())
    }
}
