//! The transport seam and reply correlation for outbound requests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};
use tokio::sync::oneshot;

use crate::packet::{Packet, ResponseEnvelope};
use mesh_types::MeshError;

/// Delivers envelopes to other nodes.
///
/// The actual network (and its framing) lives behind this trait; the core
/// only needs fire-and-forget publication addressed by `packet.target()`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publishes `packet` to its target node.
    async fn publish(&self, packet: Packet) -> Result<(), MeshError>;
}

struct Waiter {
    token: u64,
    node_id: String,
    tx: oneshot::Sender<Result<ResponseEnvelope, MeshError>>,
}

/// Outstanding requests waiting for a response, keyed by correlation ID.
#[derive(Default)]
pub struct PendingReplies {
    waiters: Mutex<HashMap<String, Waiter>>,
    next_token: AtomicU64,
}

impl std::fmt::Debug for PendingReplies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReplies").field("len", &self.len()).finish()
    }
}

impl PendingReplies {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Waiter>> {
        self.waiters.lock().unwrap_or_else(|poisoned| {
            tracing::error!("pending replies lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Registers a waiter for request `id` sent to `node_id`.
    ///
    /// Dropping the returned future unregisters it, so a caller that gives
    /// up (timeout or cancellation) leaves nothing behind.
    pub fn register(self: &Arc<Self>, id: &str, node_id: &str) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let waiter = Waiter {
            token,
            node_id: node_id.to_string(),
            tx,
        };
        if self.lock().insert(id.to_string(), waiter).is_some() {
            tracing::warn!(id, "duplicate request id, previous waiter dropped");
        }
        PendingReply {
            id: id.to_string(),
            token,
            node_id: node_id.to_string(),
            rx,
            table: Arc::clone(self),
        }
    }

    /// Hands a response to its waiter. Returns `false` for late or unknown
    /// replies, which are discarded.
    pub fn complete(&self, response: ResponseEnvelope) -> bool {
        let waiter = self.lock().remove(&response.id);
        match waiter {
            Some(w) => {
                if w.node_id != response.sender {
                    tracing::warn!(
                        id = %response.id,
                        expected = %w.node_id,
                        sender = %response.sender,
                        "response arrived from an unexpected node"
                    );
                }
                // The receiver may already be gone if the caller was cancelled.
                let _ = w.tx.send(Ok(response));
                true
            }
            None => {
                tracing::debug!(id = %response.id, sender = %response.sender, "discarding late or unknown response");
                false
            }
        }
    }

    /// Fails every request waiting on `node_id` with `node_unreachable`.
    pub fn reject_node(&self, node_id: &str, reason: &str) -> usize {
        let rejected: Vec<(String, Waiter)> = {
            let mut waiters = self.lock();
            let ids: Vec<String> = waiters
                .iter()
                .filter(|(_, w)| w.node_id == node_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| waiters.remove(&id).map(|w| (id, w)))
                .collect()
        };
        let count = rejected.len();
        for (id, w) in rejected {
            tracing::debug!(id = %id, node_id, "rejecting pending request");
            let _ = w.tx.send(Err(MeshError::node_unreachable(node_id, reason)));
        }
        count
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes the waiter for `id` only if it is still the one `token`
    /// registered; a newer registration under the same ID stays.
    fn forget(&self, id: &str, token: u64) {
        let mut waiters = self.lock();
        if waiters.get(id).is_some_and(|w| w.token == token) {
            waiters.remove(id);
        }
    }
}

/// Resolves with the response to one registered request.
pub struct PendingReply {
    id: String,
    token: u64,
    node_id: String,
    rx: oneshot::Receiver<Result<ResponseEnvelope, MeshError>>,
    table: Arc<PendingReplies>,
}

impl PendingReply {
    /// Correlation ID being awaited.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for PendingReply {
    type Output = Result<ResponseEnvelope, MeshError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let polled = Pin::new(&mut self.rx).poll(cx);
        match polled {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(MeshError::node_unreachable(
                &self.node_id,
                "reply channel closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.table.forget(&self.id, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_types::{ErrorKind, Value};

    fn response(id: &str, sender: &str) -> ResponseEnvelope {
        ResponseEnvelope {
            target: "node-1".to_string(),
            sender: sender.to_string(),
            id: id.to_string(),
            success: true,
            data: Value::from(7),
            error: None,
        }
    }

    #[tokio::test]
    async fn response_resolves_waiter() {
        let table = Arc::new(PendingReplies::new());
        let reply = table.register("r1", "node-2");
        assert_eq!(table.len(), 1);
        assert!(table.complete(response("r1", "node-2")));
        let got = reply.await.unwrap();
        assert_eq!(got.data, Value::from(7));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn late_reply_is_discarded() {
        let table = Arc::new(PendingReplies::new());
        let reply = table.register("r1", "node-2");
        drop(reply);
        assert!(table.is_empty());
        assert!(!table.complete(response("r1", "node-2")));
    }

    #[tokio::test]
    async fn rejecting_a_node_fails_only_its_waiters() {
        let table = Arc::new(PendingReplies::new());
        let a = table.register("r1", "node-2");
        let b = table.register("r2", "node-3");
        assert_eq!(table.reject_node("node-2", "disconnected"), 1);
        let err = a.await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NodeUnreachable);
        assert!(err.retriable);
        assert_eq!(table.len(), 1);
        assert!(table.complete(response("r2", "node-3")));
        assert!(b.await.is_ok());
    }

    #[tokio::test]
    async fn dropping_a_replaced_waiter_keeps_the_new_one() {
        let table = Arc::new(PendingReplies::new());
        let first = table.register("r1", "node-2");
        let second = table.register("r1", "node-2");

        let err = first.await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NodeUnreachable);
        assert_eq!(table.len(), 1);

        assert!(table.complete(response("r1", "node-2")));
        assert_eq!(second.await.unwrap().data, Value::from(7));
    }
}
