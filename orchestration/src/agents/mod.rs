//! Service agent boundary and startup registry.
//!
//! Agents are opaque: they take an action plus parameters and report
//! success, data or an error. How they reach the outside world is not the
//! backbone's concern.

pub mod dispatch;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::events::Payload;

pub use dispatch::AgentDispatcher;

/// Result reported by an agent for one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Option<Payload>,
    #[serde(default)]
    pub error: Option<String>,
    pub agent_name: String,
    pub timestamp: DateTime<Utc>,
}

impl AgentResponse {
    pub fn ok(agent_name: impl Into<String>, data: Payload) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            agent_name: agent_name.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn failure(agent_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            agent_name: agent_name.into(),
            timestamp: Utc::now(),
        }
    }

    /// Read a response back out of a chain result payload.
    ///
    /// Tolerates the error-handling middleware's failure shape, which has
    /// no `agent_name` or `data`.
    pub fn from_payload(agent_name: &str, payload: &Payload) -> Self {
        let success = payload.get("success").and_then(Value::as_bool).unwrap_or(false);
        let data = payload.get("data").and_then(Value::as_object).cloned();
        let error = payload
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| (!success).then(|| "agent reported failure".to_string()));
        let agent_name = payload
            .get("agent_name")
            .and_then(Value::as_str)
            .unwrap_or(agent_name)
            .to_string();
        Self {
            success,
            data,
            error,
            agent_name,
            timestamp: Utc::now(),
        }
    }

    pub fn to_payload(&self) -> Payload {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Payload::new(),
        }
    }
}

/// A service-specific handler addressed by target name.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    async fn handle_intent(&self, action: &str, params: Payload) -> AgentResponse;

    /// Whether the agent can currently take work.
    async fn is_ready(&self) -> bool {
        true
    }
}

/// Shared reference to an AgentRegistry
pub type SharedAgents = Arc<AgentRegistry>;

/// Target name → agent, populated once at startup.
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under its own name. A later registration with the
    /// same name replaces the earlier one.
    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        let name = agent.name().to_string();
        info!(agent = %name, "Agent registered");
        self.agents.insert(name, agent);
    }

    pub fn with(mut self, agent: Arc<dyn Agent>) -> Self {
        self.register(agent);
        self
    }

    pub fn shared(self) -> SharedAgents {
        Arc::new(self)
    }

    pub fn get(&self, target: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(target).cloned()
    }

    pub fn contains(&self, target: &str) -> bool {
        self.agents.contains_key(target)
    }

    pub fn names(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Agent>)> {
        self.agents.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.names())
            .finish()
    }
}
