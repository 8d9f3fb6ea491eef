//! Action dispatch: containers, load balancing, and request correlation.
//!
//! A named action may be provided by several nodes at once. Each provider
//! is an [`ActionContainer`] (either [`LocalAction`], which runs a handler
//! in this process, or [`RemoteAction`], which forwards the call through a
//! [`Transport`] and waits for the reply). The [`Strategy`] for an action
//! name holds its providers and picks one per call; the
//! [`ActionRegistry`] holds the strategies of every action on the node.

mod container;
mod context;
mod packet;
mod registry;
mod strategy;
mod transport;

pub use container::{
    sync_handler, ActionContainer, ActionHandler, ActionOptions, CallSite, LocalAction, RemoteAction,
};
pub use context::{CallOptions, Context};
pub use packet::{EventEnvelope, Packet, RequestEnvelope, ResponseEnvelope};
pub use registry::ActionRegistry;
pub use strategy::{PolicyKind, Random, RoundRobin, SelectionPolicy, Strategy, StrategyConfig};
pub use transport::{PendingReplies, PendingReply, Transport};
