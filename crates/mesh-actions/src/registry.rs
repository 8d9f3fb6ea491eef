//! Per-action-name strategies for the whole node.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::container::ActionContainer;
use crate::context::CallOptions;
use crate::strategy::{Strategy, StrategyConfig};
use mesh_types::{MeshError, MeshResult};

/// Maps action names to their [`Strategy`].
///
/// Strategies are created on first registration and dropped once their
/// last provider goes away. Both happen under the registry write lock, so
/// an add can never land in a strategy that is being discarded.
#[derive(Debug)]
pub struct ActionRegistry {
    config: StrategyConfig,
    strategies: RwLock<HashMap<String, Arc<Strategy>>>,
}

impl ActionRegistry {
    /// Creates an empty registry.
    pub fn new(config: StrategyConfig) -> Self {
        Self {
            config,
            strategies: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Strategy>>> {
        self.strategies.read().unwrap_or_else(|poisoned| {
            tracing::error!("action registry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Strategy>>> {
        self.strategies.write().unwrap_or_else(|poisoned| {
            tracing::error!("action registry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Registers a provider and returns the shared handle to it.
    pub fn add(&self, container: ActionContainer) -> Arc<ActionContainer> {
        let container = Arc::new(container);
        let mut strategies = self.write();
        strategies
            .entry(container.name().to_string())
            .or_insert_with(|| Arc::new(Strategy::new(container.name(), &self.config)))
            .add(Arc::clone(&container));
        tracing::debug!(action = %container.name(), node_id = %container.node_id(), "action registered");
        container
    }

    /// Unregisters `action` on `node_id`.
    pub fn remove(&self, action: &str, node_id: &str) -> bool {
        let mut strategies = self.write();
        let Some(strategy) = strategies.get(action) else {
            return false;
        };
        let removed = strategy.remove(node_id).is_some();
        if strategy.is_empty() {
            strategies.remove(action);
        }
        removed
    }

    /// Unregisters every action provided by `node_id`; returns how many
    /// providers were removed.
    pub fn remove_node(&self, node_id: &str) -> usize {
        let mut strategies = self.write();
        let mut removed = 0;
        strategies.retain(|_, strategy| {
            if strategy.remove(node_id).is_some() {
                removed += 1;
            }
            !strategy.is_empty()
        });
        if removed > 0 {
            tracing::info!(node_id, removed, "removed actions of node");
        }
        removed
    }

    /// The strategy for `action`, if any provider exists.
    pub fn strategy(&self, action: &str) -> Option<Arc<Strategy>> {
        self.read().get(action).cloned()
    }

    /// Selects the provider for a call of `action`.
    pub fn select(&self, action: &str, options: &CallOptions) -> MeshResult<Arc<ActionContainer>> {
        let strategy = self
            .strategy(action)
            .ok_or_else(|| MeshError::service_not_found(action, options.node_id.as_deref()))?;
        strategy.select(options)
    }

    /// Registered action names, sorted.
    pub fn action_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether no action is registered.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new(StrategyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{sync_handler, ActionOptions, CallSite, LocalAction};
    use mesh_types::{ErrorKind, Value};
    use mesh_uid::IncrementalUidGenerator;

    fn local(name: &str) -> ActionContainer {
        let site = CallSite {
            node_id: "local".to_string(),
            uid: Arc::new(IncrementalUidGenerator::new("local")),
        };
        ActionContainer::Local(LocalAction::new(
            name,
            ActionOptions::default(),
            site,
            Arc::new(sync_handler(|_| Ok(Value::Null))),
        ))
    }

    #[test]
    fn unknown_action_is_service_not_found() {
        let registry = ActionRegistry::default();
        let err = registry.select("nope.nothing", &CallOptions::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServiceNotFound);
    }

    #[test]
    fn empty_strategies_are_dropped() {
        let registry = ActionRegistry::default();
        registry.add(local("a.one"));
        registry.add(local("a.two"));
        assert_eq!(registry.action_names(), ["a.one", "a.two"]);

        assert!(registry.remove("a.one", "local"));
        assert!(!registry.remove("a.one", "local"));
        assert_eq!(registry.action_names(), ["a.two"]);

        assert_eq!(registry.remove_node("local"), 1);
        assert!(registry.is_empty());
    }
}
