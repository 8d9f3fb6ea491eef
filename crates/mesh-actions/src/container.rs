//! Action containers: one concrete provider of a named action.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use crate::context::{CallOptions, Context};
use crate::packet::{Packet, RequestEnvelope};
use crate::transport::{PendingReplies, Transport};
use mesh_types::{ErrorKind, MeshError, MeshResult, Value};
use mesh_uid::UidGenerator;

/// The function behind a local action.
///
/// Implemented for any `Fn(Context) -> impl Future<Output = MeshResult<Value>>`;
/// use [`sync_handler`] to wrap plain synchronous functions.
pub trait ActionHandler: Send + Sync {
    /// Runs the handler for one call.
    fn handle(&self, ctx: Context) -> BoxFuture<'static, MeshResult<Value>>;
}

impl<F, Fut> ActionHandler for F
where
    F: Fn(Context) -> Fut + Send + Sync,
    Fut: Future<Output = MeshResult<Value>> + Send + 'static,
{
    fn handle(&self, ctx: Context) -> BoxFuture<'static, MeshResult<Value>> {
        Box::pin(self(ctx))
    }
}

/// Wraps a synchronous function as an [`ActionHandler`].
pub fn sync_handler<F>(f: F) -> impl ActionHandler
where
    F: Fn(&Context) -> MeshResult<Value> + Send + Sync + 'static,
{
    move |ctx: Context| std::future::ready(f(&ctx))
}

/// Per-action caching options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionOptions {
    /// Whether results are cached.
    pub cached: bool,
    /// Top-level parameter fields that make up the cache key
    /// (`None` = the whole parameter value).
    pub cache_keys: Option<Vec<String>>,
}

impl ActionOptions {
    /// Results are cached, keyed by the whole parameter value.
    pub fn cached() -> Self {
        Self {
            cached: true,
            cache_keys: None,
        }
    }

    /// Results are cached, keyed by the named fields only.
    pub fn cached_by<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cached: true,
            cache_keys: Some(keys.into_iter().map(Into::into).collect()),
        }
    }
}

/// Caller-side identity shared by every container on a node.
#[derive(Clone)]
pub struct CallSite {
    /// Local node ID.
    pub node_id: String,
    /// Correlation ID source.
    pub uid: Arc<dyn UidGenerator>,
}

impl std::fmt::Debug for CallSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSite").field("node_id", &self.node_id).finish_non_exhaustive()
    }
}

/// An action executed in this process.
pub struct LocalAction {
    name: String,
    options: ActionOptions,
    site: CallSite,
    handler: Arc<dyn ActionHandler>,
}

impl LocalAction {
    /// Creates a local provider of `name`.
    pub fn new(name: &str, options: ActionOptions, site: CallSite, handler: Arc<dyn ActionHandler>) -> Self {
        Self {
            name: name.to_string(),
            options,
            site,
            handler,
        }
    }

    /// Runs the handler, converting a panic into a `LocalExecution` error.
    pub async fn invoke(&self, ctx: Context) -> MeshResult<Value> {
        let handler = &self.handler;
        let started = std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(ctx)));
        let outcome = match started {
            Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
            Err(payload) => Err(payload),
        };
        match outcome {
            Ok(result) => result,
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                tracing::error!(action = %self.name, "action handler panicked: {}", reason);
                Err(MeshError::local_execution(format!("action '{}' panicked: {}", self.name, reason))
                    .on_node(&self.site.node_id))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// An action executed on another node through the transport.
pub struct RemoteAction {
    name: String,
    node_id: String,
    options: ActionOptions,
    site: CallSite,
    transport: Arc<dyn Transport>,
    pending: Arc<PendingReplies>,
    default_timeout: Option<Duration>,
}

impl RemoteAction {
    /// Creates a proxy for `name` provided by `node_id`.
    pub fn new(
        name: &str,
        node_id: &str,
        options: ActionOptions,
        site: CallSite,
        transport: Arc<dyn Transport>,
        pending: Arc<PendingReplies>,
    ) -> Self {
        Self {
            name: name.to_string(),
            node_id: node_id.to_string(),
            options,
            site,
            transport,
            pending,
            default_timeout: None,
        }
    }

    /// Deadline used when a call carries none.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Sends the request and waits for the matching reply.
    ///
    /// No retries happen here; the error's `retriable` flag tells the
    /// caller whether trying again makes sense.
    pub async fn invoke(&self, ctx: Context) -> MeshResult<Value> {
        let deadline = ctx.options.timeout.or(self.default_timeout);
        let reply = self.pending.register(&ctx.id, &self.node_id);
        let request = RequestEnvelope::from_context(&ctx, &self.node_id);
        tracing::debug!(action = %self.name, node_id = %self.node_id, id = %ctx.id, "sending request");

        if let Err(e) = self.transport.publish(Packet::Request(request)).await {
            return Err(match e.kind {
                ErrorKind::NodeUnreachable => e,
                _ => MeshError::node_unreachable(&self.node_id, e.message),
            });
        }

        let response = match deadline {
            Some(limit) => match tokio::time::timeout(limit, reply).await {
                Ok(outcome) => outcome?,
                Err(_) => {
                    tracing::warn!(action = %self.name, node_id = %self.node_id, id = %ctx.id, "request timed out");
                    return Err(MeshError::request_timeout(&self.name, &self.node_id));
                }
            },
            None => reply.await?,
        };
        response.into_result()
    }
}

/// One provider of a named action, local or remote.
pub enum ActionContainer {
    /// Runs in this process.
    Local(LocalAction),
    /// Proxies to another node.
    Remote(RemoteAction),
}

impl std::fmt::Debug for ActionContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionContainer")
            .field("name", &self.name())
            .field("node_id", &self.node_id())
            .field("local", &self.local())
            .field("cached", &self.cached())
            .finish()
    }
}

impl ActionContainer {
    /// Action name.
    pub fn name(&self) -> &str {
        match self {
            Self::Local(a) => &a.name,
            Self::Remote(a) => &a.name,
        }
    }

    /// Owning node.
    pub fn node_id(&self) -> &str {
        match self {
            Self::Local(a) => &a.site.node_id,
            Self::Remote(a) => &a.node_id,
        }
    }

    /// Whether this provider runs on the local node.
    pub fn local(&self) -> bool {
        match self {
            Self::Local(_) => true,
            Self::Remote(a) => mesh_types::is_local_node(&a.node_id, &a.site.node_id),
        }
    }

    /// Whether results are cached.
    pub fn cached(&self) -> bool {
        self.options().cached
    }

    /// Fields used for the cache key, if restricted.
    pub fn cache_keys(&self) -> Option<&[String]> {
        self.options().cache_keys.as_deref()
    }

    fn options(&self) -> &ActionOptions {
        match self {
            Self::Local(a) => &a.options,
            Self::Remote(a) => &a.options,
        }
    }

    fn site(&self) -> &CallSite {
        match self {
            Self::Local(a) => &a.site,
            Self::Remote(a) => &a.site,
        }
    }

    /// Executes (local) or forwards (remote) the call in `ctx`.
    pub async fn invoke(&self, ctx: Context) -> MeshResult<Value> {
        match self {
            Self::Local(a) => a.invoke(ctx).await,
            Self::Remote(a) => a.invoke(ctx).await,
        }
    }

    /// Builds a fresh context for this action and invokes it.
    pub async fn call(&self, params: Value, options: CallOptions, parent: Option<&Context>) -> MeshResult<Value> {
        let site = self.site();
        let ctx = Context::new(site.uid.as_ref(), &site.node_id, self.name(), params, options, parent);
        self.invoke(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ResponseEnvelope;
    use async_trait::async_trait;
    use mesh_uid::IncrementalUidGenerator;
    use serde_json::json;
    use std::sync::Mutex;

    fn site(node_id: &str) -> CallSite {
        CallSite {
            node_id: node_id.to_string(),
            uid: Arc::new(IncrementalUidGenerator::new(node_id)),
        }
    }

    fn add_handler() -> Arc<dyn ActionHandler> {
        Arc::new(sync_handler(|ctx: &Context| {
            let a = ctx.params["a"].as_i64().ok_or_else(|| MeshError::validation("a must be a number"))?;
            let b = ctx.params["b"].as_i64().ok_or_else(|| MeshError::validation("b must be a number"))?;
            Ok(json!(a + b))
        }))
    }

    /// Answers every request with a fixed outcome, or stays silent.
    struct EchoTransport {
        pending: Arc<PendingReplies>,
        reply: Option<MeshResult<Value>>,
        sent: Mutex<Vec<RequestEnvelope>>,
    }

    #[async_trait]
    impl Transport for EchoTransport {
        async fn publish(&self, packet: Packet) -> Result<(), MeshError> {
            let Packet::Request(req) = packet else {
                return Ok(());
            };
            self.sent.lock().unwrap().push(req.clone());
            if let Some(outcome) = &self.reply {
                let response = ResponseEnvelope::reply_to(&req, &req.target, outcome.clone());
                self.pending.complete(response);
            }
            Ok(())
        }
    }

    struct DownTransport;

    #[async_trait]
    impl Transport for DownTransport {
        async fn publish(&self, packet: Packet) -> Result<(), MeshError> {
            Err(MeshError::new(ErrorKind::LocalExecution, format!("socket closed for {}", packet.target())))
        }
    }

    fn remote(reply: Option<MeshResult<Value>>) -> (ActionContainer, Arc<EchoTransport>, Arc<PendingReplies>) {
        let pending = Arc::new(PendingReplies::new());
        let transport = Arc::new(EchoTransport {
            pending: pending.clone(),
            reply,
            sent: Mutex::new(Vec::new()),
        });
        let action = RemoteAction::new(
            "math.add",
            "node-2",
            ActionOptions::default(),
            site("node-1"),
            transport.clone(),
            pending.clone(),
        );
        (ActionContainer::Remote(action), transport, pending)
    }

    #[tokio::test]
    async fn local_call_runs_handler() {
        let action = ActionContainer::Local(LocalAction::new(
            "math.add",
            ActionOptions::cached_by(["a", "b"]),
            site("node-1"),
            add_handler(),
        ));
        assert!(action.local());
        assert!(action.cached());
        assert_eq!(action.cache_keys(), Some(&["a".to_string(), "b".to_string()][..]));
        let sum = action.call(json!({ "a": 1, "b": 2 }), CallOptions::default(), None).await.unwrap();
        assert_eq!(sum, json!(3));

        let err = action.call(json!({ "a": 1 }), CallOptions::default(), None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn async_handler_is_supported() {
        let handler: Arc<dyn ActionHandler> = Arc::new(|ctx: Context| async move {
            tokio::task::yield_now().await;
            Ok::<_, MeshError>(json!(format!("hello {}", ctx.params["name"].as_str().unwrap_or("world"))))
        });
        let action = ActionContainer::Local(LocalAction::new("greeter.hello", ActionOptions::default(), site("n"), handler));
        let out = action.call(json!({ "name": "ada" }), CallOptions::default(), None).await.unwrap();
        assert_eq!(out, json!("hello ada"));
    }

    #[tokio::test]
    async fn handler_panic_becomes_local_execution_error() {
        let handler: Arc<dyn ActionHandler> = Arc::new(sync_handler(|_ctx: &Context| -> MeshResult<Value> {
            panic!("division by zero")
        }));
        let action = ActionContainer::Local(LocalAction::new("math.div", ActionOptions::default(), site("node-1"), handler));
        let err = action.call(Value::Null, CallOptions::default(), None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::LocalExecution);
        assert!(err.message.contains("division by zero"));
        assert_eq!(err.node_id.as_deref(), Some("node-1"));

        let handler: Arc<dyn ActionHandler> = Arc::new(|_ctx: Context| async move {
            tokio::task::yield_now().await;
            if true {
                panic!("late failure");
            }
            Ok::<_, MeshError>(Value::Null)
        });
        let action = ActionContainer::Local(LocalAction::new("math.late", ActionOptions::default(), site("node-1"), handler));
        let err = action.call(Value::Null, CallOptions::default(), None).await.unwrap_err();
        assert!(err.message.contains("late failure"));
    }

    #[tokio::test]
    async fn remote_call_round_trip() {
        let (action, transport, pending) = remote(Some(Ok(json!(3))));
        assert!(!action.local());
        assert_eq!(action.node_id(), "node-2");
        let out = action.call(json!({ "a": 1, "b": 2 }), CallOptions::default(), None).await.unwrap();
        assert_eq!(out, json!(3));
        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target, "node-2");
        assert_eq!(sent[0].sender, "node-1");
        assert_eq!(sent[0].action, "math.add");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn remote_error_is_forwarded_verbatim() {
        let remote_err = MeshError::validation("bad input").with_code(400).with_data(json!({ "field": "a" }));
        let (action, _, _) = remote(Some(Err(remote_err.clone())));
        let err = action.call(json!({}), CallOptions::default(), None).await.unwrap_err();
        assert_eq!(err.kind, remote_err.kind);
        assert_eq!(err.code, 400);
        assert_eq!(err.message, "bad input");
        assert_eq!(err.data, json!({ "field": "a" }));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_node_times_out() {
        let (action, _, pending) = remote(None);
        let options = CallOptions::default().with_timeout(Duration::from_millis(200));
        let err = action.call(json!({}), options, None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RequestTimeout);
        assert!(err.retriable);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn publish_failure_is_node_unreachable() {
        let action = ActionContainer::Remote(RemoteAction::new(
            "math.add",
            "node-2",
            ActionOptions::default(),
            site("node-1"),
            Arc::new(DownTransport),
            Arc::new(PendingReplies::new()),
        ));
        let err = action.call(json!({}), CallOptions::default(), None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NodeUnreachable);
        assert!(err.retriable);
    }
}
