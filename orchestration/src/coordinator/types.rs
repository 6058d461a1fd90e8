//! Multi-step command model and its status machine.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::Payload;

/// Status shared by commands and their sub-tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

fn is_legal_transition(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    matches!(
        (from, to),
        (Pending, Executing) | (Executing, Completed) | (Executing, Failed)
    )
}

/// Rejected status change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Illegal status transition: {from} -> {to}")]
pub struct IllegalTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

fn check(from: TaskStatus, to: TaskStatus) -> Result<(), IllegalTransition> {
    if is_legal_transition(from, to) {
        Ok(())
    } else {
        Err(IllegalTransition { from, to })
    }
}

/// One recorded command status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One step of a multi-step command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTask {
    pub id: String,
    pub action: String,
    pub target: String,
    #[serde(default)]
    pub parameters: Payload,
    #[serde(default)]
    pub depends_on: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SubTask {
    pub fn new(
        index: usize,
        action: impl Into<String>,
        target: impl Into<String>,
        parameters: Payload,
    ) -> Self {
        Self {
            id: subtask_id(index),
            action: action.into(),
            target: target.into(),
            parameters,
            depends_on: index.checked_sub(1).map(subtask_id),
            status: TaskStatus::Pending,
            result: None,
            error: None,
        }
    }

    pub fn set_status(&mut self, to: TaskStatus) -> Result<(), IllegalTransition> {
        check(self.status, to)?;
        self.status = to;
        Ok(())
    }
}

/// Id of the sub-task at `index`.
pub fn subtask_id(index: usize) -> String {
    format!("subtask_{index}")
}

/// A compound command and the ordered sub-tasks it was split into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiStepCommand {
    pub id: String,
    pub original_command: String,
    pub context_id: String,
    pub sub_tasks: Vec<SubTask>,
    /// Index of the sub-task being worked on; equals `sub_tasks.len()`
    /// once every sub-task has completed.
    pub current_step: usize,
    /// Results of completed sub-tasks keyed by sub-task id.
    pub shared_state: BTreeMap<String, Value>,
    pub status: TaskStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(default)]
    pub transitions: Vec<TransitionRecord>,
}

impl MultiStepCommand {
    pub fn new(
        id: impl Into<String>,
        original_command: impl Into<String>,
        context_id: impl Into<String>,
        sub_tasks: Vec<SubTask>,
    ) -> Self {
        Self {
            id: id.into(),
            original_command: original_command.into(),
            context_id: context_id.into(),
            sub_tasks,
            current_step: 0,
            shared_state: BTreeMap::new(),
            status: TaskStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            transitions: Vec::new(),
        }
    }

    /// Move the command to `to`, recording the change.
    pub fn advance(
        &mut self,
        to: TaskStatus,
        reason: Option<&str>,
    ) -> Result<(), IllegalTransition> {
        check(self.status, to)?;
        let now = Utc::now();
        self.transitions.push(TransitionRecord {
            from: self.status,
            to,
            at: now,
            reason: reason.map(String::from),
        });
        tracing::debug!(command_id = %self.id, from = %self.status, to = %to, "Command transition");
        self.status = to;
        match to {
            TaskStatus::Executing => self.started_at = Some(now),
            TaskStatus::Completed | TaskStatus::Failed => self.completed_at = Some(now),
            TaskStatus::Pending => {}
        }
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock time between start and completion.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.completed_at? - self.started_at?)
    }
}
