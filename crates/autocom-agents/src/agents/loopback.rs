//! Agent that answers every action by echoing it back.
//!
//! Stands in for real service integrations so the whole routing path can be
//! exercised from the command line.

use async_trait::async_trait;
use chrono::Utc;
use orchestration::agents::{Agent, AgentResponse};
use orchestration::events::Payload;
use orchestration::payload;
use tracing::debug;

pub struct LoopbackAgent {
    name: String,
}

impl LoopbackAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Agent for LoopbackAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle_intent(&self, action: &str, params: Payload) -> AgentResponse {
        debug!(agent = %self.name, action, "Loopback agent handling intent");
        AgentResponse::ok(
            &self.name,
            payload! {
                "action" => action,
                "params" => params,
                "handled_at" => Utc::now().to_rfc3339(),
            },
        )
    }
}
