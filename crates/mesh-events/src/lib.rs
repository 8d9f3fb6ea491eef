//! Event routing for the mesh runtime.
//!
//! Published events are routed to subscribers whose topic masks match the
//! event name. The [`Matcher`] implements the mask grammar (`*`, `**`,
//! `?`) with a bounded cache of compiled patterns; the [`EventBus`] keeps
//! the subscription registry and decides which local listeners receive an
//! event and which remote nodes it must be forwarded to.

mod bus;
mod matcher;

pub use bus::{Event, EventBus, RemoteDelivery, SubscriptionId};
pub use matcher::{is_pattern, Matcher};
