//! Event system: topic-based publish/subscribe between components.

pub mod bus;
pub mod types;

pub use bus::{
    handler_fn, BusStats, EventBus, EventBusConfig, EventBusError, EventBusResult, EventHandler,
    SharedEventBus, SubscriptionId,
};
pub use types::*;
