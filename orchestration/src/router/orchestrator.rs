//! Intent router: free-form input in, routed events out.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::intent::{parse_intent, Classification, Intent};
use super::prompts::{classification_prompt, CLASSIFIER_SYSTEM};
use crate::agents::SharedAgents;
use crate::context::{ContextEntry, ContextStore};
use crate::events::{
    Event, EventBusError, EventHandler, Payload, SharedEventBus, SubscriptionId, FIELD_CONTEXT_ID,
    FIELD_REQUEST_ID, ORCHESTRATOR_CLARIFICATION, ORCHESTRATOR_ERROR, ORCHESTRATOR_RESPONSE,
    UI_ERROR, UI_NOTIFICATION, UI_UPDATE, VOICE_SPEAK,
};
use crate::llm::LanguageModel;
use crate::payload;
use crate::resilience::{CircuitError, SharedBreakers};

/// Breaker guarding the language model.
pub const LLM_BREAKER: &str = "llm";
/// Breaker guarding the context store.
pub const CONTEXT_STORE_BREAKER: &str = "context_store";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Intents below this confidence are never routed.
    pub confidence_threshold: f64,
    /// Entries fetched from the context store per request.
    pub context_limit: usize,
    /// Entries included in the classification prompt.
    pub prompt_context_entries: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            context_limit: 10,
            prompt_context_entries: 5,
        }
    }
}

/// Error type for routing
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("No agent registered for target: {target}")]
    UnknownTarget { target: String },

    #[error("Language model failed: {0}")]
    DependencyFailed(String),

    #[error("{0}")]
    CircuitOpen(String),

    #[error(transparent)]
    Bus(#[from] EventBusError),
}

impl RouteError {
    /// Value of `kind` in `orchestrator.error` payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownTarget { .. } => "unknown_target",
            Self::DependencyFailed(_) => "dependency_failed",
            Self::CircuitOpen(_) => "circuit_open",
            Self::Bus(EventBusError::QueueFull { .. }) => "queue_full",
            Self::Bus(EventBusError::Stopped { .. }) => "bus_stopped",
        }
    }
}

pub type RouteResult<T> = Result<T, RouteError>;

/// Classifies input with the language model and routes confident intents
/// to `agent.<target>.<action>`.
pub struct IntentRouter {
    bus: SharedEventBus,
    llm: Arc<dyn LanguageModel>,
    store: Arc<dyn ContextStore>,
    agents: SharedAgents,
    breakers: SharedBreakers,
    config: RouterConfig,
}

impl IntentRouter {
    pub fn new(
        bus: SharedEventBus,
        llm: Arc<dyn LanguageModel>,
        store: Arc<dyn ContextStore>,
        agents: SharedAgents,
        breakers: SharedBreakers,
        config: RouterConfig,
    ) -> Self {
        Self {
            bus,
            llm,
            store,
            agents,
            breakers,
            config,
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Subscribe to agent outcomes so they reach the user.
    pub fn attach(self: &Arc<Self>) -> SubscriptionId {
        self.bus
            .subscribe(ORCHESTRATOR_RESPONSE, Arc::clone(self) as Arc<dyn EventHandler>)
    }

    /// Classify and route one command. Outcomes surface as events only.
    pub async fn process_intent(&self, raw_input: &str, context_id: &str) {
        info!(context_id, input = raw_input, "Processing input");

        let classification = match self.classify(raw_input, context_id).await {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, kind = e.kind(), "Intent classification failed");
                self.publish(
                    ORCHESTRATOR_ERROR,
                    payload! { "error" => e.to_string(), "kind" => e.kind(), "input" => raw_input },
                );
                self.notify_failure(&e);
                return;
            }
        };

        let intent = match classification {
            Classification::LowConfidence(intent) => {
                self.request_clarification(&intent);
                return;
            }
            Classification::Confident(intent) => intent,
        };

        let request_id = Uuid::new_v4().to_string();
        if let Err(e) = self.route_intent(&intent, &request_id) {
            warn!(error = %e, kind = e.kind(), "Intent not routed");
            self.notify_failure(&e);
            return;
        }
        self.persist(intent);
    }

    /// Read context, ask the model, and gate on confidence.
    ///
    /// Model failures are errors; unparseable output is not, it becomes a
    /// low-confidence `unknown` intent.
    pub async fn classify(&self, raw_input: &str, context_id: &str) -> RouteResult<Classification> {
        let context = self.recent_context(context_id).await;
        let prompt = classification_prompt(
            raw_input,
            &context,
            self.config.prompt_context_entries,
            &self.agents.names(),
        );

        let breaker = self.breakers.get_or_create(LLM_BREAKER);
        let response = breaker
            .call(|| self.llm.generate(&prompt, CLASSIFIER_SYSTEM))
            .await
            .map_err(|e| match e {
                CircuitError::Failed(e) => RouteError::DependencyFailed(e.to_string()),
                rejected => RouteError::CircuitOpen(rejected.to_string()),
            })?;

        let intent = parse_intent(&response, raw_input, context_id);
        info!(
            action = %intent.action,
            service = %intent.target,
            confidence = intent.confidence,
            "Intent classified"
        );
        Ok(Classification::gate(intent, self.config.confidence_threshold))
    }

    /// Publish `intent` to its agent topic, tagged with `request_id`.
    ///
    /// An unregistered target is reported on `orchestrator.error` and is
    /// not retried.
    pub fn route_intent(&self, intent: &Intent, request_id: &str) -> RouteResult<()> {
        if !self.agents.contains(&intent.target) {
            let err = RouteError::UnknownTarget {
                target: intent.target.clone(),
            };
            error!(service = %intent.target, "No agent registered for target");
            self.publish(
                ORCHESTRATOR_ERROR,
                payload! {
                    "error" => err.to_string(),
                    "kind" => err.kind(),
                    "input" => intent.raw_input,
                    "intent" => intent,
                    FIELD_REQUEST_ID => request_id,
                },
            );
            return Err(err);
        }

        let mut event = intent.parameters.clone();
        event.insert(FIELD_REQUEST_ID.into(), json!(request_id));
        event.insert(FIELD_CONTEXT_ID.into(), json!(intent.context_id));

        let topic = intent.topic();
        self.bus.emit(&topic, event).map_err(|e| {
            error!(topic = %topic, error = %e, "Failed to route intent");
            RouteError::from(e)
        })?;
        info!(topic = %topic, request_id, "Intent routed");
        Ok(())
    }

    /// Turn an `orchestrator.response` payload into user-facing events.
    pub fn handle_agent_response(&self, response: &Payload) {
        let success = response.get("success").and_then(Value::as_bool).unwrap_or(false);
        let agent = response.get("agent_name").and_then(Value::as_str).unwrap_or("agent");
        if success {
            info!(agent, "Agent response successful");
            let action = response.get("action").and_then(Value::as_str).unwrap_or("request");
            self.publish(UI_UPDATE, response.clone());
            self.publish(
                VOICE_SPEAK,
                payload! { "text" => format!("{agent} finished {action}"), "priority" => "normal" },
            );
        } else {
            let error = response.get("error").and_then(Value::as_str).unwrap_or("unknown error");
            error!(agent, error, "Agent response failed");
            self.publish(UI_ERROR, response.clone());
            self.publish(
                VOICE_SPEAK,
                payload! { "text" => format!("{agent} failed: {error}"), "priority" => "high" },
            );
        }
    }

    /// Spoken and notified summary of a command that ended in `err`.
    ///
    /// The structured `orchestrator.error` event is published separately,
    /// where the failure is detected.
    fn notify_failure(&self, err: &RouteError) {
        let message = match err {
            RouteError::UnknownTarget { target } => format!("I can't handle {target} yet."),
            RouteError::DependencyFailed(_) => {
                "The language model failed, so I couldn't process that command.".to_string()
            }
            RouteError::CircuitOpen(_) => {
                "The language model is unavailable right now. Please try again shortly.".to_string()
            }
            RouteError::Bus(_) => "I'm too busy to handle that right now.".to_string(),
        };
        self.publish(
            UI_NOTIFICATION,
            payload! {
                "title" => "Command Failed",
                "body" => message,
                "kind" => err.kind(),
                "priority" => "high",
            },
        );
        self.publish(VOICE_SPEAK, payload! { "text" => message, "priority" => "high" });
    }

    fn request_clarification(&self, intent: &Intent) {
        let message = format!(
            "I'm not sure I understood. Could you rephrase: '{}'?",
            intent.raw_input
        );
        info!(confidence = intent.confidence, "Requesting clarification");
        self.publish(
            ORCHESTRATOR_CLARIFICATION,
            payload! {
                "input" => intent.raw_input,
                "context_id" => intent.context_id,
                "confidence" => intent.confidence,
                "intent" => intent,
            },
        );
        self.publish(
            UI_NOTIFICATION,
            payload! { "title" => "Clarification Needed", "body" => message, "priority" => "high" },
        );
        self.publish(VOICE_SPEAK, payload! { "text" => message, "priority" => "high" });
    }

    async fn recent_context(&self, context_id: &str) -> Vec<ContextEntry> {
        let breaker = self.breakers.get_or_create(CONTEXT_STORE_BREAKER);
        let limit = self.config.context_limit;
        match breaker
            .call(|| self.store.get_recent_context(limit, context_id))
            .await
        {
            Ok(context) => context,
            Err(e) => {
                let e = e.map_failure(|e| e.to_string());
                warn!(context_id, error = %e, "Context unavailable, classifying without history");
                Vec::new()
            }
        }
    }

    /// Store the interaction in the background; failures are only logged.
    fn persist(&self, intent: Intent) {
        let store = Arc::clone(&self.store);
        let breaker = self.breakers.get_or_create(CONTEXT_STORE_BREAKER);
        tokio::spawn(async move {
            let stored = breaker
                .call(|| store.store_interaction(&intent, None))
                .await;
            if let Err(e) = stored {
                let e = e.map_failure(|e| e.to_string());
                warn!(context_id = %intent.context_id, error = %e, "Failed to persist interaction");
            }
        });
    }

    fn publish(&self, topic: &str, payload: Payload) {
        if let Err(e) = self.bus.emit(topic, payload) {
            error!(topic, error = %e, "Failed to publish event");
        }
    }
}

#[async_trait]
impl EventHandler for IntentRouter {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        if event.topic == ORCHESTRATOR_RESPONSE {
            self.handle_agent_response(&event.payload);
        }
        Ok(())
    }
}
