//! Built-in checks for the backbone's own components and dependencies.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{HealthCheck, Probe};
use crate::agents::Agent;
use crate::context::ContextStore;
use crate::events::SharedEventBus;
use crate::llm::LanguageModel;
use crate::resilience::SharedBreakers;

/// Queue fill ratio above which the bus reports `Degraded`.
const QUEUE_DEGRADED_RATIO: f64 = 0.9;

pub struct EventBusHealthCheck {
    bus: SharedEventBus,
}

impl EventBusHealthCheck {
    pub fn new(bus: SharedEventBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl HealthCheck for EventBusHealthCheck {
    fn name(&self) -> &str {
        "event_bus"
    }

    async fn probe(&self) -> anyhow::Result<Probe> {
        let stats = self.bus.stats();
        if !stats.running {
            return Ok(Probe::unhealthy("Event bus not running"));
        }

        let nearly_full =
            stats.queue_size as f64 > stats.max_queue_size as f64 * QUEUE_DEGRADED_RATIO;
        let probe = if nearly_full {
            Probe::degraded(format!(
                "Event queue nearly full: {}/{}",
                stats.queue_size, stats.max_queue_size
            ))
        } else {
            Probe::healthy("Event bus running")
        };
        Ok(probe
            .meta("queue_size", stats.queue_size)
            .meta("max_queue_size", stats.max_queue_size)
            .meta("topics", stats.subscribers.len()))
    }
}

pub struct LanguageModelHealthCheck {
    model: Arc<dyn LanguageModel>,
}

impl LanguageModelHealthCheck {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl HealthCheck for LanguageModelHealthCheck {
    fn name(&self) -> &str {
        "language_model"
    }

    fn timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(10))
    }

    async fn probe(&self) -> anyhow::Result<Probe> {
        let probe = match self.model.generate("Reply with OK.", "").await {
            Ok(reply) if reply.trim().is_empty() => {
                Probe::degraded("Model returned empty response")
            }
            Ok(_) => Probe::healthy("Model responding"),
            Err(e) => Probe::unhealthy(format!("Model error: {e}")).meta("error", e.to_string()),
        };
        Ok(probe.meta("model", self.model.model_name()))
    }
}

pub struct ContextStoreHealthCheck {
    store: Arc<dyn ContextStore>,
}

impl ContextStoreHealthCheck {
    pub fn new(store: Arc<dyn ContextStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthCheck for ContextStoreHealthCheck {
    fn name(&self) -> &str {
        "context_store"
    }

    async fn probe(&self) -> anyhow::Result<Probe> {
        match self.store.get_recent_context(1, "__health__").await {
            Ok(_) => Ok(Probe::healthy("Context store accessible")),
            Err(e) => Ok(
                Probe::unhealthy(format!("Context store error: {e}")).meta("error", e.to_string()),
            ),
        }
    }
}

pub struct AgentHealthCheck {
    name: String,
    agent: Arc<dyn Agent>,
}

impl AgentHealthCheck {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self {
            name: format!("agent_{}", agent.name()),
            agent,
        }
    }
}

#[async_trait]
impl HealthCheck for AgentHealthCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> anyhow::Result<Probe> {
        let probe = if self.agent.is_ready().await {
            Probe::healthy("Agent ready")
        } else {
            Probe::degraded("Agent not ready")
        };
        Ok(probe.meta("agent", self.agent.name()))
    }
}

pub struct CircuitBreakerHealthCheck {
    breakers: SharedBreakers,
}

impl CircuitBreakerHealthCheck {
    pub fn new(breakers: SharedBreakers) -> Self {
        Self { breakers }
    }
}

#[async_trait]
impl HealthCheck for CircuitBreakerHealthCheck {
    fn name(&self) -> &str {
        "circuit_breakers"
    }

    async fn probe(&self) -> anyhow::Result<Probe> {
        let open = self.breakers.open_circuits();
        let probe = if open.is_empty() {
            Probe::healthy("All circuits closed")
        } else {
            Probe::degraded(format!("Open circuits: {}", open.join(", ")))
        };
        Ok(probe.meta("open", json!(open)).meta("total", self.breakers.names().len()))
    }
}
