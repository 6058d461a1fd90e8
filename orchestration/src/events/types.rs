//! Event envelope and well-known topics.
//!
//! Topic strings are the only coupling between publishers and
//! subscribers; the payload is an untyped JSON object.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event payload: a JSON object keyed by field name.
pub type Payload = Map<String, Value>;

/// Prefix for routed intents: `agent.<target>.<action>`.
pub const AGENT_TOPIC_PREFIX: &str = "agent";
/// Routing failures (unknown target, dependency failure).
pub const ORCHESTRATOR_ERROR: &str = "orchestrator.error";
/// Clarification requests for low-confidence intents.
pub const ORCHESTRATOR_CLARIFICATION: &str = "orchestrator.clarification";
/// Agent outcomes published by the dispatcher.
pub const ORCHESTRATOR_RESPONSE: &str = "orchestrator.response";
/// User-facing notifications.
pub const UI_NOTIFICATION: &str = "ui.notification";
/// User-facing result updates.
pub const UI_UPDATE: &str = "ui.update";
/// User-facing errors.
pub const UI_ERROR: &str = "ui.error";
/// Audio feedback requests.
pub const VOICE_SPEAK: &str = "voice.speak";

/// Correlation fields carried next to the parameters of a routed intent.
pub const FIELD_REQUEST_ID: &str = "request_id";
pub const FIELD_CONTEXT_ID: &str = "context_id";

/// Build the topic an intent is routed to.
pub fn agent_topic(target: &str, action: &str) -> String {
    format!("{AGENT_TOPIC_PREFIX}.{target}.{action}")
}

/// Wildcard pattern matching every action for one agent.
pub fn agent_pattern(target: &str) -> String {
    format!("{AGENT_TOPIC_PREFIX}.{target}.*")
}

/// Split an `agent.<target>.<action>` topic into `(target, action)`.
pub fn parse_agent_topic(topic: &str) -> Option<(&str, &str)> {
    let rest = topic.strip_prefix(AGENT_TOPIC_PREFIX)?.strip_prefix('.')?;
    let (target, action) = rest.split_once('.')?;
    if target.is_empty() || action.is_empty() {
        return None;
    }
    Some((target, action))
}

/// A single published event. Moved by value into the bus queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub payload: Payload,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: Payload) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }

    /// String field from the payload, if present.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Build a [`Payload`] from `key => value` pairs.
///
/// ```ignore
/// let p = payload! { "title" => "Done", "priority" => "normal" };
/// ```
#[macro_export]
macro_rules! payload {
    () => { $crate::events::Payload::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut map = $crate::events::Payload::new();
        $( map.insert(($key).to_string(), ::serde_json::json!($value)); )+
        map
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_topic_roundtrip() {
        let topic = agent_topic("mail", "fetch");
        assert_eq!(topic, "agent.mail.fetch");
        assert_eq!(parse_agent_topic(&topic), Some(("mail", "fetch")));
    }

    #[test]
    fn test_parse_agent_topic_rejects_foreign_topics() {
        assert_eq!(parse_agent_topic("ui.notification"), None);
        assert_eq!(parse_agent_topic("agent.mail"), None);
        assert_eq!(parse_agent_topic("agent..fetch"), None);
        assert_eq!(parse_agent_topic("agentx.mail.fetch"), None);
    }

    #[test]
    fn test_payload_macro() {
        let p = crate::payload! { "title" => "Done", "count" => 3 };
        assert_eq!(p.get("title").and_then(Value::as_str), Some("Done"));
        assert_eq!(p.get("count").and_then(Value::as_u64), Some(3));
        let event = Event::new("ui.notification", p);
        assert_eq!(event.str_field("title"), Some("Done"));
    }
}
