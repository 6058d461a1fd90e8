//! Built-in agents.

pub mod loopback;

use std::sync::Arc;

use orchestration::agents::AgentRegistry;

pub use loopback::LoopbackAgent;

/// Registry with one loopback agent per configured name.
pub fn loopback_registry(names: &[String]) -> AgentRegistry {
    names.iter().fold(AgentRegistry::new(), |registry, name| {
        registry.with(Arc::new(LoopbackAgent::new(name.as_str())))
    })
}
