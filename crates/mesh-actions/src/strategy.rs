//! Provider selection for one action name.

use rand::Rng;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::container::ActionContainer;
use crate::context::CallOptions;
use mesh_types::{MeshError, MeshResult};

/// Picks one container out of a non-empty candidate list.
pub trait SelectionPolicy: Send + Sync {
    /// Returns an index into `candidates`, which is never empty.
    fn select(&self, candidates: &[Arc<ActionContainer>]) -> usize;
}

/// Cycles through the candidates in insertion order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl SelectionPolicy for RoundRobin {
    fn select(&self, candidates: &[Arc<ActionContainer>]) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % candidates.len()
    }
}

/// Picks a uniformly random candidate.
#[derive(Debug, Default)]
pub struct Random;

impl SelectionPolicy for Random {
    fn select(&self, candidates: &[Arc<ActionContainer>]) -> usize {
        rand::thread_rng().gen_range(0..candidates.len())
    }
}

/// Selection policy names accepted in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// [`RoundRobin`].
    #[default]
    RoundRobin,
    /// [`Random`].
    Random,
}

impl PolicyKind {
    /// Builds a fresh policy instance.
    pub fn build(self) -> Box<dyn SelectionPolicy> {
        match self {
            Self::RoundRobin => Box::new(RoundRobin::default()),
            Self::Random => Box::new(Random),
        }
    }
}

/// Load-balancing settings.
#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    /// Policy used when no node is pinned.
    #[serde(default)]
    pub policy: PolicyKind,
    /// Route to the local provider whenever one exists.
    #[serde(default = "default_prefer_local")]
    pub prefer_local: bool,
}

fn default_prefer_local() -> bool {
    true
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            policy: PolicyKind::default(),
            prefer_local: default_prefer_local(),
        }
    }
}

type Bucket = Arc<Vec<Arc<ActionContainer>>>;

/// All providers of one action name, at most one per node.
///
/// The provider list is copy-on-write: mutations build a new list and swap
/// it in, so a selection always works on a complete snapshot and never
/// sees a container after its removal has returned.
pub struct Strategy {
    name: String,
    prefer_local: bool,
    policy: Box<dyn SelectionPolicy>,
    bucket: RwLock<Bucket>,
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strategy")
            .field("name", &self.name)
            .field("providers", &self.len())
            .finish()
    }
}

impl Strategy {
    /// Creates an empty strategy for `name`.
    pub fn new(name: &str, config: &StrategyConfig) -> Self {
        Self::with_policy(name, config.prefer_local, config.policy.build())
    }

    /// Creates an empty strategy with an explicit policy.
    pub fn with_policy(name: &str, prefer_local: bool, policy: Box<dyn SelectionPolicy>) -> Self {
        Self {
            name: name.to_string(),
            prefer_local,
            policy,
            bucket: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Action name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn snapshot(&self) -> Bucket {
        let guard = self.bucket.read().unwrap_or_else(|poisoned| {
            tracing::error!(action = %self.name, "strategy lock poisoned, recovering");
            poisoned.into_inner()
        });
        Arc::clone(&guard)
    }

    fn update<R>(&self, f: impl FnOnce(&mut Vec<Arc<ActionContainer>>) -> R) -> R {
        let mut guard = self.bucket.write().unwrap_or_else(|poisoned| {
            tracing::error!(action = %self.name, "strategy lock poisoned, recovering");
            poisoned.into_inner()
        });
        let mut next: Vec<Arc<ActionContainer>> = guard.as_ref().clone();
        let out = f(&mut next);
        *guard = Arc::new(next);
        out
    }

    /// Adds a provider, replacing any existing one from the same node.
    pub fn add(&self, container: Arc<ActionContainer>) {
        self.update(|list| {
            match list.iter().position(|c| c.node_id() == container.node_id()) {
                Some(i) => list[i] = container,
                None => list.push(container),
            }
        });
    }

    /// Removes the provider owned by `node_id`.
    pub fn remove(&self, node_id: &str) -> Option<Arc<ActionContainer>> {
        self.update(|list| {
            let i = list.iter().position(|c| c.node_id() == node_id)?;
            Some(list.remove(i))
        })
    }

    /// Whether no provider is registered.
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Number of providers.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// The provider owned by `node_id`.
    pub fn get(&self, node_id: &str) -> Option<Arc<ActionContainer>> {
        self.snapshot().iter().find(|c| c.node_id() == node_id).cloned()
    }

    /// The local provider, if this node has one.
    pub fn get_local(&self) -> Option<Arc<ActionContainer>> {
        self.snapshot().iter().find(|c| c.local()).cloned()
    }

    /// Every provider in insertion order.
    pub fn containers(&self) -> Vec<Arc<ActionContainer>> {
        self.snapshot().as_ref().clone()
    }

    /// Chooses the provider for a call.
    ///
    /// A pinned node is honoured exactly. Otherwise the local provider wins
    /// when locality is preferred and not excluded, and the policy picks
    /// among the remaining candidates.
    pub fn select(&self, options: &CallOptions) -> MeshResult<Arc<ActionContainer>> {
        let bucket = self.snapshot();

        if let Some(node_id) = options.node_id.as_deref() {
            return bucket
                .iter()
                .find(|c| c.node_id() == node_id)
                .cloned()
                .ok_or_else(|| MeshError::service_not_found(&self.name, Some(node_id)));
        }

        if self.prefer_local && !options.exclude_local {
            if let Some(local) = bucket.iter().find(|c| c.local()) {
                return Ok(Arc::clone(local));
            }
        }

        let candidates: Vec<Arc<ActionContainer>> = if options.exclude_local {
            bucket.iter().filter(|c| !c.local()).cloned().collect()
        } else {
            bucket.as_ref().clone()
        };
        if candidates.is_empty() {
            return Err(MeshError::service_not_found(&self.name, None));
        }
        let i = self.policy.select(&candidates);
        Ok(Arc::clone(&candidates[i.min(candidates.len() - 1)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{sync_handler, ActionOptions, CallSite, LocalAction, RemoteAction};
    use crate::packet::Packet;
    use crate::transport::{PendingReplies, Transport};
    use async_trait::async_trait;
    use mesh_types::{ErrorKind, Value};
    use mesh_uid::IncrementalUidGenerator;

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn publish(&self, _packet: Packet) -> Result<(), MeshError> {
            Ok(())
        }
    }

    fn site() -> CallSite {
        CallSite {
            node_id: "local".to_string(),
            uid: Arc::new(IncrementalUidGenerator::new("local")),
        }
    }

    fn remote(node_id: &str) -> Arc<ActionContainer> {
        Arc::new(ActionContainer::Remote(RemoteAction::new(
            "svc.act",
            node_id,
            ActionOptions::default(),
            site(),
            Arc::new(NullTransport),
            Arc::new(PendingReplies::new()),
        )))
    }

    fn local() -> Arc<ActionContainer> {
        Arc::new(ActionContainer::Local(LocalAction::new(
            "svc.act",
            ActionOptions::default(),
            site(),
            Arc::new(sync_handler(|_| Ok(Value::Null))),
        )))
    }

    #[test]
    fn add_get_remove() {
        let strategy = Strategy::new("svc.act", &StrategyConfig::default());
        assert!(strategy.is_empty());
        let a = remote("node1");
        strategy.add(Arc::clone(&a));
        strategy.add(remote("node2"));
        assert!(!strategy.is_empty());
        assert!(Arc::ptr_eq(&strategy.get("node1").unwrap(), &a));
        assert!(strategy.get("node3").is_none());

        assert!(strategy.remove("node1").is_some());
        assert!(strategy.get("node1").is_none());
        for _ in 0..10 {
            let picked = strategy.select(&CallOptions::default()).unwrap();
            assert!(!Arc::ptr_eq(&picked, &a));
            assert_eq!(picked.node_id(), "node2");
        }
        assert!(strategy.remove("node1").is_none());
    }

    #[test]
    fn one_provider_per_node() {
        let strategy = Strategy::new("svc.act", &StrategyConfig::default());
        strategy.add(remote("node1"));
        let replacement = remote("node1");
        strategy.add(Arc::clone(&replacement));
        assert_eq!(strategy.len(), 1);
        assert!(Arc::ptr_eq(&strategy.get("node1").unwrap(), &replacement));
    }

    #[test]
    fn round_robin_covers_every_remote_in_order() {
        let strategy = Strategy::new("svc.act", &StrategyConfig::default());
        for n in ["n1", "n2", "n3"] {
            strategy.add(remote(n));
        }
        let picked: Vec<String> = (0..6)
            .map(|_| strategy.select(&CallOptions::default()).unwrap().node_id().to_string())
            .collect();
        assert_eq!(picked, ["n1", "n2", "n3", "n1", "n2", "n3"]);
    }

    #[test]
    fn local_provider_is_preferred_unless_excluded() {
        let strategy = Strategy::new("svc.act", &StrategyConfig::default());
        strategy.add(remote("n1"));
        strategy.add(local());
        assert!(strategy.get_local().is_some());
        assert!(strategy.select(&CallOptions::default()).unwrap().local());

        let remote_only = CallOptions::default().remote_only();
        for _ in 0..4 {
            assert_eq!(strategy.select(&remote_only).unwrap().node_id(), "n1");
        }

        strategy.remove("n1");
        let err = strategy.select(&remote_only).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServiceNotFound);
    }

    #[test]
    fn locality_can_be_disabled() {
        let config = StrategyConfig {
            policy: PolicyKind::RoundRobin,
            prefer_local: false,
        };
        let strategy = Strategy::new("svc.act", &config);
        strategy.add(local());
        strategy.add(remote("n1"));
        let locals = (0..4)
            .filter(|_| strategy.select(&CallOptions::default()).unwrap().local())
            .count();
        assert_eq!(locals, 2);
    }

    #[test]
    fn pinned_node_is_exact() {
        let strategy = Strategy::new("svc.act", &StrategyConfig::default());
        strategy.add(local());
        strategy.add(remote("n1"));
        let pinned = strategy.select(&CallOptions::default().on_node("n1")).unwrap();
        assert_eq!(pinned.node_id(), "n1");
        let err = strategy.select(&CallOptions::default().on_node("n9")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServiceNotFound);
        assert!(!err.retriable);
    }

    #[test]
    fn empty_strategy_is_service_not_found() {
        let strategy = Strategy::new("svc.act", &StrategyConfig::default());
        let err = strategy.select(&CallOptions::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServiceNotFound);
        assert!(!err.retriable);
    }

    #[test]
    fn random_policy_stays_in_bounds() {
        let config = StrategyConfig {
            policy: PolicyKind::Random,
            prefer_local: true,
        };
        let strategy = Strategy::new("svc.act", &config);
        for n in ["n1", "n2"] {
            strategy.add(remote(n));
        }
        for _ in 0..50 {
            let node = strategy.select(&CallOptions::default()).unwrap();
            assert!(node.node_id() == "n1" || node.node_id() == "n2");
        }
    }

    #[test]
    fn policy_kind_from_config() {
        let config: StrategyConfig = serde_json::from_str(r#"{ "policy": "random" }"#).unwrap();
        assert_eq!(config.policy, PolicyKind::Random);
        assert!(config.prefer_local);
    }
}
