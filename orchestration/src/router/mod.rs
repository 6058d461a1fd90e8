//! Intent classification and routing.

pub mod intent;
pub mod orchestrator;
pub mod prompts;

pub use intent::{parse_intent, Classification, Intent, FALLBACK_CONFIDENCE, UNKNOWN};
pub use orchestrator::{
    IntentRouter, RouteError, RouteResult, RouterConfig, CONTEXT_STORE_BREAKER, LLM_BREAKER,
};
