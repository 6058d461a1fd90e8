//! Bridge from routed intent events to agents.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info, warn};

use super::{Agent, AgentResponse, SharedAgents};
use crate::events::{
    agent_pattern, parse_agent_topic, Event, EventHandler, Payload, SharedEventBus, SubscriptionId,
    FIELD_CONTEXT_ID, FIELD_REQUEST_ID, ORCHESTRATOR_RESPONSE,
};
use crate::middleware::{Endpoint, MiddlewareError, MiddlewareResult, MiddlewareStack};
use crate::resilience::{CircuitBreaker, CircuitError, SharedBreakers};

/// Breaker name guarding calls to the agent for `target`.
pub fn agent_breaker_name(target: &str) -> String {
    format!("agent.{target}")
}

/// Terminal endpoint: one agent call through its breaker.
struct AgentEndpoint {
    agent: Arc<dyn Agent>,
    breaker: Arc<CircuitBreaker>,
    action: String,
}

#[async_trait]
impl Endpoint for AgentEndpoint {
    async fn call(&self, _topic: &str, params: Payload) -> MiddlewareResult {
        let agent = Arc::clone(&self.agent);
        let action = self.action.as_str();
        let outcome = self
            .breaker
            .call(|| async move {
                let response = agent.handle_intent(action, params).await;
                if response.success {
                    Ok(response)
                } else {
                    Err(response)
                }
            })
            .await;

        match outcome {
            Ok(response) | Err(CircuitError::Failed(response)) => Ok(response.to_payload()),
            Err(rejected) => {
                let rejected = rejected.map_failure(|r| r.error.unwrap_or_default());
                warn!(breaker = %self.breaker.name(), error = %rejected, "Agent call rejected");
                Err(MiddlewareError::Handler(rejected.to_string()))
            }
        }
    }
}

/// Subscribes every registered agent to its `agent.<name>.*` topics and
/// publishes each outcome on `orchestrator.response`.
pub struct AgentDispatcher {
    bus: SharedEventBus,
    agents: SharedAgents,
    breakers: SharedBreakers,
    stack: MiddlewareStack,
}

impl AgentDispatcher {
    pub fn new(
        bus: SharedEventBus,
        agents: SharedAgents,
        breakers: SharedBreakers,
        stack: MiddlewareStack,
    ) -> Self {
        Self {
            bus,
            agents,
            breakers,
            stack,
        }
    }

    /// Subscribe to every registered agent's topics.
    pub fn attach(self: &Arc<Self>) -> Vec<SubscriptionId> {
        self.agents
            .names()
            .iter()
            .map(|name| {
                let handler: Arc<dyn EventHandler> = Arc::clone(self) as Arc<dyn EventHandler>;
                self.bus.subscribe(&agent_pattern(name), handler)
            })
            .collect()
    }

    /// Handle one routed intent and publish the outcome.
    ///
    /// Returns `None` for topics that are not `agent.<target>.<action>`.
    pub async fn dispatch(&self, event: &Event) -> Option<AgentResponse> {
        let Some((target, action)) = parse_agent_topic(&event.topic) else {
            warn!(topic = %event.topic, "Ignoring non-agent topic");
            return None;
        };

        let mut params = event.payload.clone();
        let request_id = params.remove(FIELD_REQUEST_ID).unwrap_or(Value::Null);
        let context_id = params.remove(FIELD_CONTEXT_ID).unwrap_or(Value::Null);

        let response = match self.agents.get(target) {
            None => {
                AgentResponse::failure(target, format!("No agent registered for target: {target}"))
            }
            Some(agent) => {
                let endpoint = AgentEndpoint {
                    agent,
                    breaker: self.breakers.get_or_create(&agent_breaker_name(target)),
                    action: action.to_string(),
                };
                match self.stack.execute(&event.topic, params, &endpoint).await {
                    Ok(result) => AgentResponse::from_payload(target, &result),
                    Err(e) => AgentResponse::failure(target, e.to_string()),
                }
            }
        };

        info!(
            agent = %response.agent_name,
            action,
            success = response.success,
            "Agent call finished"
        );

        let mut outcome = Payload::new();
        outcome.insert(FIELD_REQUEST_ID.into(), request_id);
        outcome.insert(FIELD_CONTEXT_ID.into(), context_id);
        outcome.insert("agent_name".into(), Value::String(response.agent_name.clone()));
        outcome.insert("target".into(), Value::String(target.to_string()));
        outcome.insert("action".into(), Value::String(action.to_string()));
        outcome.insert("success".into(), Value::Bool(response.success));
        outcome.insert(
            "data".into(),
            response.data.clone().map(Value::Object).unwrap_or(Value::Null),
        );
        outcome.insert(
            "error".into(),
            response.error.clone().map(Value::String).unwrap_or(Value::Null),
        );

        if let Err(e) = self.bus.emit(ORCHESTRATOR_RESPONSE, outcome) {
            error!(error = %e, "Failed to publish agent response");
        }
        Some(response)
    }
}

#[async_trait]
impl EventHandler for AgentDispatcher {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        self.dispatch(event).await;
        Ok(())
    }
}
