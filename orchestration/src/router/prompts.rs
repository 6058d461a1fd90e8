//! Prompt templates for intent classification.

use std::fmt::Write as _;

use crate::context::ContextEntry;

/// System message sent with every classification request.
pub const CLASSIFIER_SYSTEM: &str = "You are an automation assistant. You turn a user's command \
into a single JSON object describing what to do. Respond with JSON only.";

/// Build the user prompt for classifying `raw_input`.
///
/// `context` is oldest first; only the last `max_entries` are included.
pub fn classification_prompt(
    raw_input: &str,
    context: &[ContextEntry],
    max_entries: usize,
    targets: &[String],
) -> String {
    let skip = context.len().saturating_sub(max_entries);
    let mut history = String::new();
    for entry in &context[skip..] {
        let _ = writeln!(history, "User: {}", entry.user_input);
    }
    if history.is_empty() {
        history.push_str("(none)\n");
    }

    let services = if targets.is_empty() {
        "any".to_string()
    } else {
        targets.join(", ")
    };

    format!(
        r#"Analyze the user's command and extract:
1. Action (fetch, send, create, update, summarize, etc.)
2. Target service (one of: {services})
3. Parameters (recipients, content, filters, etc.)
4. Confidence between 0.0 and 1.0

Recent context:
{history}
Current command: {raw_input}

Respond with JSON only:
{{
    "action": "action_name",
    "target": "service_name",
    "parameters": {{}},
    "confidence": 0.0
}}"#
    )
}
