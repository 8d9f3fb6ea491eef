//! The service broker: one node's entry point into the mesh.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::BrokerConfig;
use mesh_actions::{
    ActionContainer, ActionHandler, ActionOptions, ActionRegistry, CallOptions, CallSite, Context,
    EventEnvelope, LocalAction, Packet, PendingReplies, RemoteAction, RequestEnvelope,
    ResponseEnvelope, Transport,
};
use mesh_cache::{Cacher, HasherPool};
use mesh_events::{Event, EventBus, Matcher, SubscriptionId};
use mesh_types::{MeshError, MeshResult, Value};
use mesh_uid::UidGenerator;

/// Buffer size of the channel handed out by [`ServiceBroker::subscribe`].
pub const SUBSCRIPTION_BUFFER: usize = 64;

/// Wires the registry, cacher, event bus, and transport of one node.
///
/// Remote traffic enters through [`ServiceBroker::handle_packet`]; the
/// transport is expected to call it for every envelope addressed to this
/// node.
pub struct ServiceBroker {
    site: CallSite,
    registry: ActionRegistry,
    cacher: Option<Cacher>,
    events: EventBus,
    transport: Arc<dyn Transport>,
    pending: Arc<PendingReplies>,
    default_timeout: Option<Duration>,
}

impl std::fmt::Debug for ServiceBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceBroker")
            .field("node_id", &self.site.node_id)
            .field("actions", &self.registry.action_names())
            .field("cacher", &self.cacher)
            .finish_non_exhaustive()
    }
}

impl ServiceBroker {
    /// Builds a broker from configuration. Shared components (matcher,
    /// hasher pool, UID generator) are created here and passed down.
    pub fn new(config: &BrokerConfig, transport: Arc<dyn Transport>) -> Self {
        let node_id = config.node.resolved_id();
        let matcher = Arc::new(Matcher::new(config.matcher.cache_capacity));
        let uid = mesh_uid::build_generator(config.uid.mode, config.uid.prefix.as_deref(), &node_id);
        let cacher = config.cache.enabled.then(|| {
            Cacher::in_memory(&config.cache, Arc::clone(&matcher), Arc::new(HasherPool::default()))
        });

        Self {
            registry: ActionRegistry::new(config.strategy.clone()),
            cacher,
            events: EventBus::new(&node_id, matcher),
            site: CallSite { node_id, uid },
            transport,
            pending: Arc::new(PendingReplies::new()),
            default_timeout: config.request.timeout(),
        }
    }

    /// Replaces the cacher (`None` disables caching).
    pub fn with_cacher(mut self, cacher: Option<Cacher>) -> Self {
        self.cacher = cacher;
        self
    }

    /// Local node ID.
    pub fn node_id(&self) -> &str {
        &self.site.node_id
    }

    /// Correlation ID generator.
    pub fn uid(&self) -> &Arc<dyn UidGenerator> {
        &self.site.uid
    }

    /// Registered actions.
    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// The cacher, if caching is enabled.
    pub fn cacher(&self) -> Option<&Cacher> {
        self.cacher.as_ref()
    }

    /// Event subscriptions.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Number of remote calls waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Starts the cache store.
    pub async fn start(&self) {
        if let Some(cacher) = &self.cacher {
            cacher.start().await;
        }
        tracing::info!(node_id = %self.site.node_id, "service broker started");
    }

    /// Stops the cache store.
    pub async fn stop(&self) {
        if let Some(cacher) = &self.cacher {
            cacher.stop().await;
        }
        tracing::info!(node_id = %self.site.node_id, "service broker stopped");
    }

    /// Registers an action implemented in this process.
    pub fn create_action<H>(&self, name: &str, options: ActionOptions, handler: H) -> Arc<ActionContainer>
    where
        H: ActionHandler + 'static,
    {
        let action = LocalAction::new(name, options, self.site.clone(), Arc::new(handler));
        self.registry.add(ActionContainer::Local(action))
    }

    /// Registers an action advertised by `node_id`.
    pub fn register_remote(&self, node_id: &str, name: &str, options: ActionOptions) -> Arc<ActionContainer> {
        let action = RemoteAction::new(
            name,
            node_id,
            options,
            self.site.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.pending),
        )
        .with_default_timeout(self.default_timeout);
        self.registry.add(ActionContainer::Remote(action))
    }

    /// Records an event subscription advertised by `node_id`.
    pub fn register_remote_subscription(&self, node_id: &str, mask: &str, group: &str) -> SubscriptionId {
        self.events.subscribe_remote(node_id, mask, group)
    }

    /// Forgets everything `node_id` provided and fails its pending calls.
    pub fn node_disconnected(&self, node_id: &str) {
        let actions = self.registry.remove_node(node_id);
        let subscriptions = self.events.remove_node(node_id);
        let rejected = self.pending.reject_node(node_id, "node disconnected");
        tracing::info!(node_id, actions, subscriptions, rejected, "node disconnected");
    }

    /// Calls `action`, served from the cache when the selected provider is
    /// cached and a result is stored under the call's key.
    pub async fn call(&self, action: &str, params: Value, options: CallOptions) -> MeshResult<Value> {
        self.dispatch(action, params, options, None).await
    }

    /// Calls `action` as a nested call of `parent`.
    pub async fn call_from(
        &self,
        parent: &Context,
        action: &str,
        params: Value,
        options: CallOptions,
    ) -> MeshResult<Value> {
        self.dispatch(action, params, options, Some(parent)).await
    }

    async fn dispatch(
        &self,
        action: &str,
        params: Value,
        options: CallOptions,
        parent: Option<&Context>,
    ) -> MeshResult<Value> {
        let container = self.registry.select(action, &options)?;

        let cached = match &self.cacher {
            Some(cacher) if container.cached() => {
                let key_params = (!params.is_null()).then_some(&params);
                let key = cacher.cache_key(action, key_params, container.cache_keys());
                if let Some(hit) = cacher.get(&key).await {
                    tracing::debug!(action, key = %key, "served from cache");
                    return Ok(hit);
                }
                Some((cacher, key))
            }
            _ => None,
        };

        let result = container.call(params, options, parent).await?;
        if let Some((cacher, key)) = cached {
            cacher.set(&key, &result).await;
        }
        Ok(result)
    }

    /// Processes an envelope delivered by the transport.
    pub async fn handle_packet(&self, packet: Packet) {
        match packet {
            Packet::Request(request) => self.handle_request(request).await,
            Packet::Response(response) => {
                self.pending.complete(response);
            }
            Packet::Event(envelope) => self.handle_event(envelope),
        }
    }

    async fn handle_request(&self, request: RequestEnvelope) {
        let local = self
            .registry
            .strategy(&request.action)
            .and_then(|strategy| strategy.get_local());
        let outcome = match local {
            Some(container) => container.invoke(request.to_context()).await,
            None => Err(MeshError::service_not_found(&request.action, Some(&self.site.node_id))),
        };
        let response = ResponseEnvelope::reply_to(&request, &self.site.node_id, outcome);
        if let Err(e) = self.transport.publish(Packet::Response(response)).await {
            tracing::warn!(id = %request.id, target = %request.sender, "unable to send response: {}", e);
        }
    }

    fn handle_event(&self, envelope: EventEnvelope) {
        let groups = (!envelope.broadcast && !envelope.groups.is_empty()).then_some(envelope.groups.as_slice());
        let event = Event {
            name: envelope.event.clone(),
            data: envelope.data.clone(),
            sender: envelope.sender.clone(),
        };
        let delivered = self.events.deliver_local(&event, groups);
        tracing::trace!(event = %event.name, delivered, "delivered forwarded event");
    }

    /// Subscribes a local listener to events matching `mask`.
    pub fn subscribe(&self, mask: &str, group: &str) -> (SubscriptionId, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        (self.events.subscribe_local(mask, group, tx), rx)
    }

    /// Publishes an event to one subscriber per matching group. Returns the
    /// number of remote nodes it was forwarded to.
    pub async fn emit(&self, name: &str, data: Value) -> usize {
        let event = self.event(name, data);
        let deliveries = self.events.emit(&event);
        self.forward(&event, deliveries, false).await
    }

    /// Publishes an event to every matching subscriber. Returns the number
    /// of remote nodes it was forwarded to.
    pub async fn broadcast(&self, name: &str, data: Value) -> usize {
        let event = self.event(name, data);
        let deliveries = self.events.broadcast(&event);
        self.forward(&event, deliveries, true).await
    }

    fn event(&self, name: &str, data: Value) -> Event {
        Event {
            name: name.to_string(),
            data,
            sender: self.site.node_id.clone(),
        }
    }

    async fn forward(&self, event: &Event, deliveries: Vec<mesh_events::RemoteDelivery>, broadcast: bool) -> usize {
        let mut forwarded = 0;
        for delivery in deliveries {
            let envelope = EventEnvelope {
                target: delivery.node_id,
                sender: event.sender.clone(),
                event: event.name.clone(),
                data: event.data.clone(),
                groups: delivery.groups,
                broadcast,
            };
            let target = envelope.target.clone();
            match self.transport.publish(Packet::Event(envelope)).await {
                Ok(()) => forwarded += 1,
                Err(e) => tracing::warn!(event = %event.name, target = %target, "unable to forward event: {}", e),
            }
        }
        forwarded
    }
}
