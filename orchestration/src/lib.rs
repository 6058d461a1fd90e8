//! Orchestration backbone for the autocom desktop assistant.
//!
//! Components talk over an in-process [`events::EventBus`] using dot-separated
//! topics. A user command flows like this:
//!
//! 1. [`router::IntentRouter`] classifies the input with a language model and,
//!    if confident, emits `agent.<target>.<action>`.
//! 2. [`agents::AgentDispatcher`] picks the event up, runs it through the
//!    [`middleware::MiddlewareStack`] and the target's circuit breaker, and
//!    emits `orchestrator.response`.
//! 3. The router turns the response into `ui.*` and `voice.speak` events.
//!
//! Compound commands go through [`coordinator::MultiAgentCoordinator`], which
//! splits them into sub-tasks and runs them one after another.
//!
//! [`health::HealthCheckManager`] probes all of the above.

pub mod agents;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod events;
pub mod health;
pub mod llm;
pub mod middleware;
pub mod resilience;
pub mod router;

pub use agents::{Agent, AgentDispatcher, AgentRegistry, AgentResponse, SharedAgents};
pub use config::{ConfigError, OrchestrationConfig};
pub use context::{ContextStore, InMemoryContextStore, JsonlContextStore};
pub use coordinator::{MultiAgentCoordinator, MultiStepCommand, TaskStatus};
pub use events::{Event, EventBus, EventHandler, Payload, SharedEventBus};
pub use health::{HealthCheckManager, HealthStatus};
pub use llm::{LanguageModel, LlmError, OpenAiCompatibleClient};
pub use middleware::MiddlewareStack;
pub use resilience::{CircuitBreaker, CircuitBreakerManager, CircuitState, SharedBreakers};
pub use router::{Intent, IntentRouter};
