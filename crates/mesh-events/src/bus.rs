//! Topic-based event routing on top of the [`Matcher`].
//!
//! Subscriptions pair a mask with a group (usually the subscribing
//! service's name). Local subscriptions own a channel sender; remote
//! subscriptions only record the node that advertised them, and the bus
//! tells the caller which nodes a published event must be forwarded to.
//!
//! - [`EventBus::emit`] is *balanced*: each matching group receives the
//!   event once, on one of its subscribers (round-robin).
//! - [`EventBus::broadcast`] delivers to every matching subscriber.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

use crate::matcher::Matcher;
use mesh_types::Value;

/// A published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Dot-segmented event name (e.g. `user.created`).
    pub name: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
    /// ID of the node that published the event.
    pub sender: String,
}

/// Opaque handle returned by the subscribe calls.
pub type SubscriptionId = u64;

/// A node that must receive a forwarded copy of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDelivery {
    /// Target node.
    pub node_id: String,
    /// Groups the target should deliver to; empty means all its matching
    /// subscribers (broadcast).
    pub groups: Vec<String>,
}

#[derive(Debug)]
struct Subscription {
    id: SubscriptionId,
    mask: String,
    group: String,
    node_id: String,
    sink: Option<mpsc::Sender<Event>>,
}

/// Registry of event subscriptions for one broker.
#[derive(Debug)]
pub struct EventBus {
    local_node_id: String,
    matcher: Arc<Matcher>,
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
    cursor: AtomicUsize,
}

enum Target {
    Local(SubscriptionId, mpsc::Sender<Event>),
    Remote(String, String),
}

impl EventBus {
    /// Creates an empty bus for `local_node_id`.
    pub fn new(local_node_id: &str, matcher: Arc<Matcher>) -> Self {
        Self {
            local_node_id: local_node_id.to_string(),
            matcher,
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            cursor: AtomicUsize::new(0),
        }
    }

    /// Subscribes a local listener. Events are pushed into `sink`.
    pub fn subscribe_local(
        &self,
        mask: &str,
        group: &str,
        sink: mpsc::Sender<Event>,
    ) -> SubscriptionId {
        let node_id = self.local_node_id.clone();
        self.insert(mask, group, node_id, Some(sink))
    }

    /// Records a subscription advertised by a remote node.
    pub fn subscribe_remote(&self, node_id: &str, mask: &str, group: &str) -> SubscriptionId {
        self.insert(mask, group, node_id.to_string(), None)
    }

    /// Removes one subscription. Returns `false` if it did not exist.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.write();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Drops every subscription of a disconnected node.
    pub fn remove_node(&self, node_id: &str) -> usize {
        let mut subs = self.write();
        let before = subs.len();
        subs.retain(|s| s.node_id != node_id);
        before - subs.len()
    }

    /// Number of registered subscriptions.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns `true` if nothing is subscribed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Balanced delivery: one subscriber per matching group.
    ///
    /// Local picks are delivered immediately; the returned list names the
    /// remote nodes (and groups) that must receive a forwarded copy.
    pub fn emit(&self, event: &Event) -> Vec<RemoteDelivery> {
        let targets = {
            let subs = self.read();
            let mut groups: Vec<(&str, Vec<&Subscription>)> = Vec::new();
            for sub in subs.iter().filter(|s| self.matcher.matches(&event.name, &s.mask)) {
                match groups.iter_mut().find(|(g, _)| *g == sub.group) {
                    Some((_, members)) => members.push(sub),
                    None => groups.push((sub.group.as_str(), vec![sub])),
                }
            }
            groups
                .into_iter()
                .map(|(_, members)| {
                    let pick = self.cursor.fetch_add(1, Ordering::Relaxed) % members.len();
                    target_of(members[pick])
                })
                .collect::<Vec<_>>()
        };
        self.dispatch(event, targets)
    }

    /// Delivers to every matching subscriber.
    pub fn broadcast(&self, event: &Event) -> Vec<RemoteDelivery> {
        let targets = {
            let subs = self.read();
            subs.iter()
                .filter(|s| self.matcher.matches(&event.name, &s.mask))
                .map(target_of)
                .collect::<Vec<_>>()
        };
        let mut deliveries = self.dispatch(event, targets);
        for delivery in &mut deliveries {
            delivery.groups.clear();
        }
        deliveries
    }

    /// Delivers an event forwarded by another node to local subscribers.
    ///
    /// With `groups` set, one subscriber per listed group receives it;
    /// otherwise every matching local subscriber does. Returns the number
    /// of deliveries.
    pub fn deliver_local(&self, event: &Event, groups: Option<&[String]>) -> usize {
        let sinks = {
            let subs = self.read();
            let local = subs.iter().filter(|s| {
                s.sink.is_some() && self.matcher.matches(&event.name, &s.mask)
            });
            match groups {
                None => local.filter_map(|s| Some((s.id, s.sink.clone()?))).collect::<Vec<_>>(),
                Some(groups) => {
                    let local: Vec<&Subscription> = local.collect();
                    groups
                        .iter()
                        .filter_map(|group| {
                            let members: Vec<&&Subscription> =
                                local.iter().filter(|s| &s.group == group).collect();
                            if members.is_empty() {
                                return None;
                            }
                            let pick =
                                self.cursor.fetch_add(1, Ordering::Relaxed) % members.len();
                            Some((members[pick].id, members[pick].sink.clone()?))
                        })
                        .collect()
                }
            }
        };
        sinks
            .into_iter()
            .filter(|(id, sink)| send(*id, sink, event))
            .count()
    }

    fn dispatch(&self, event: &Event, targets: Vec<Target>) -> Vec<RemoteDelivery> {
        let mut remote: Vec<RemoteDelivery> = Vec::new();
        for target in targets {
            match target {
                Target::Local(id, sink) => {
                    send(id, &sink, event);
                }
                Target::Remote(node_id, group) => {
                    match remote.iter_mut().find(|d| d.node_id == node_id) {
                        Some(delivery) => {
                            if !delivery.groups.contains(&group) {
                                delivery.groups.push(group);
                            }
                        }
                        None => remote.push(RemoteDelivery {
                            node_id,
                            groups: vec![group],
                        }),
                    }
                }
            }
        }
        remote
    }

    fn insert(
        &self,
        mask: &str,
        group: &str,
        node_id: String,
        sink: Option<mpsc::Sender<Event>>,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(id, mask, group, node_id = %node_id, "event subscription added");
        self.write().push(Subscription {
            id,
            mask: mask.to_string(),
            group: group.to_string(),
            node_id,
            sink,
        });
        id
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Subscription>> {
        self.subscriptions.read().unwrap_or_else(|poisoned| {
            tracing::error!("event bus lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Subscription>> {
        self.subscriptions.write().unwrap_or_else(|poisoned| {
            tracing::error!("event bus lock poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

fn target_of(sub: &Subscription) -> Target {
    match &sub.sink {
        Some(sink) => Target::Local(sub.id, sink.clone()),
        None => Target::Remote(sub.node_id.clone(), sub.group.clone()),
    }
}

fn send(id: SubscriptionId, sink: &mpsc::Sender<Event>, event: &Event) -> bool {
    match sink.try_send(event.clone()) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(
                subscription = id,
                event = %event.name,
                "dropping event for local subscriber: {}",
                e
            );
            false
        }
    }
}
