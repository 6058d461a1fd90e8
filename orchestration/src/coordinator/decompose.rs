//! Splitting compound commands into ordered sub-tasks.

use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::types::SubTask;
use crate::events::Payload;
use crate::router::intent::delimited;
use crate::router::UNKNOWN;

pub const DECOMPOSER_SYSTEM: &str =
    "You split multi-step commands into ordered sub-tasks. Respond with a JSON array only.";

pub fn decomposition_prompt(command: &str, targets: &[String]) -> String {
    let services = if targets.is_empty() {
        "any".to_string()
    } else {
        targets.join(", ")
    };
    format!(
        r#"Decompose this multi-step command into sequential sub-tasks.
Available targets: {services}

Command: {command}

Return JSON array of sub-tasks with this format:
[
  {{"action": "fetch", "target": "mail", "parameters": {{}}}},
  {{"action": "send", "target": "chat", "parameters": {{"channel": "...", "message": "..."}}}}
]

Sub-tasks:"#
    )
}

#[derive(Deserialize)]
struct RawSubTask {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    parameters: Option<Payload>,
}

/// Single sub-task wrapping the raw command.
pub fn fallback(command: &str) -> Vec<SubTask> {
    let mut params = Payload::new();
    params.insert("original_command".into(), json!(command));
    vec![SubTask::new(0, UNKNOWN, UNKNOWN, params)]
}

/// Parse model output into sub-tasks, falling back to [`fallback`] when
/// there is no usable JSON array.
pub fn parse_subtasks(response: &str, command: &str) -> Vec<SubTask> {
    let parsed = delimited(response, '[', ']')
        .ok_or_else(|| "no JSON array in model output".to_string())
        .and_then(|json| serde_json::from_str::<Vec<RawSubTask>>(json).map_err(|e| e.to_string()));

    let raw = match parsed {
        Ok(raw) if !raw.is_empty() => raw,
        Ok(_) => {
            warn!(command, "Decomposition returned no sub-tasks, using fallback");
            return fallback(command);
        }
        Err(reason) => {
            warn!(command, reason = %reason, "Decomposition unparseable, using fallback");
            return fallback(command);
        }
    };

    let tasks: Vec<SubTask> = raw
        .into_iter()
        .enumerate()
        .map(|(i, t)| {
            let field = |v: Option<String>| {
                v.map(|s| s.trim().to_lowercase())
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| UNKNOWN.to_string())
            };
            SubTask::new(i, field(t.action), field(t.target), t.parameters.unwrap_or_default())
        })
        .collect();
    info!(count = tasks.len(), "Command decomposed");
    tasks
}
