//! Mesh broker library.
//!
//! Wires the dispatch core (action registry, strategies, containers), the
//! distributed cacher, the event bus, and a transport into a
//! [`ServiceBroker`] for one node. Configuration is read from TOML with
//! `MESH_*` environment overrides.

pub mod config;

mod broker;
mod loopback;

pub use broker::{ServiceBroker, SUBSCRIPTION_BUFFER};
pub use config::{load_config, BrokerConfig, ConfigError};
pub use loopback::LoopbackNetwork;
