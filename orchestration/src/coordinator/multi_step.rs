//! Sequential execution of multi-step commands.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::decompose::{decomposition_prompt, fallback, parse_subtasks, DECOMPOSER_SYSTEM};
use super::types::{IllegalTransition, MultiStepCommand, SubTask, TaskStatus};
use crate::agents::SharedAgents;
use crate::events::{
    Event, EventHandler, Payload, SharedEventBus, SubscriptionId, FIELD_REQUEST_ID,
    ORCHESTRATOR_RESPONSE, UI_ERROR, UI_NOTIFICATION, VOICE_SPEAK,
};
use crate::llm::LanguageModel;
use crate::payload;
use crate::resilience::SharedBreakers;
use crate::router::{Intent, IntentRouter, RouteError, LLM_BREAKER};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How long one sub-task may wait for its agent's response.
    pub step_timeout_secs: u64,
    /// Finished commands kept in history.
    pub history_limit: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: 30,
            history_limit: 100,
        }
    }
}

/// Why a sub-task failed.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("No response from {target} within {timeout_secs}s")]
    StepTimedOut { target: String, timeout_secs: u64 },

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("{0}")]
    Agent(String),

    #[error("Response channel closed for request {0}")]
    ChannelClosed(String),

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Aggregate counters since startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorStats {
    pub active_commands: usize,
    pub total_executed: u64,
    pub completed: u64,
    pub failed: u64,
    pub success_rate: f64,
}

/// Decomposes compound commands and runs their sub-tasks one at a time,
/// feeding each result into the next.
pub struct MultiAgentCoordinator {
    bus: SharedEventBus,
    router: Arc<IntentRouter>,
    llm: Arc<dyn LanguageModel>,
    agents: SharedAgents,
    breakers: SharedBreakers,
    config: CoordinatorConfig,
    active: RwLock<HashMap<String, MultiStepCommand>>,
    history: RwLock<VecDeque<MultiStepCommand>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Payload>>>,
    executed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl MultiAgentCoordinator {
    pub fn new(
        bus: SharedEventBus,
        router: Arc<IntentRouter>,
        llm: Arc<dyn LanguageModel>,
        agents: SharedAgents,
        breakers: SharedBreakers,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            bus,
            router,
            llm,
            agents,
            breakers,
            config,
            active: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            pending: Mutex::new(HashMap::new()),
            executed: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Subscribe to agent outcomes so waiting sub-tasks can resume.
    pub fn attach(self: &Arc<Self>) -> SubscriptionId {
        self.bus
            .subscribe(ORCHESTRATOR_RESPONSE, Arc::clone(self) as Arc<dyn EventHandler>)
    }

    /// Decompose and run `command` to a terminal status.
    ///
    /// Sub-tasks run strictly in order. The first failure ends the command;
    /// later sub-tasks are never attempted and completed ones are kept.
    pub async fn execute_multi_step(&self, command: &str, context_id: &str) -> MultiStepCommand {
        let sub_tasks = self.decompose(command).await;
        let mut cmd =
            MultiStepCommand::new(Uuid::new_v4().to_string(), command, context_id, sub_tasks);
        self.executed.fetch_add(1, Ordering::Relaxed);
        info!(command_id = %cmd.id, steps = cmd.sub_tasks.len(), "Starting multi-step command");

        if let Err(e) = cmd.advance(TaskStatus::Executing, None) {
            error!(command_id = %cmd.id, error = %e, "Command could not start");
        }
        self.track(&cmd);

        for step in 0..cmd.sub_tasks.len() {
            cmd.current_step = step;
            if let Err(e) = self.run_step(&mut cmd, step).await {
                return self.finish_failed(cmd, step, e);
            }
        }

        cmd.current_step = cmd.sub_tasks.len();
        self.finish_completed(cmd)
    }

    /// Commands currently executing.
    pub fn get_active_commands(&self) -> Vec<MultiStepCommand> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Up to `limit` finished commands, most recent last.
    pub fn get_command_history(&self, limit: usize) -> Vec<MultiStepCommand> {
        let history = self.history.read().unwrap_or_else(PoisonError::into_inner);
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self) -> CoordinatorStats {
        let total_executed = self.executed.load(Ordering::Relaxed);
        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let finished = completed + failed;
        CoordinatorStats {
            active_commands: self.active.read().unwrap_or_else(PoisonError::into_inner).len(),
            total_executed,
            completed,
            failed,
            success_rate: if finished == 0 {
                0.0
            } else {
                completed as f64 / finished as f64
            },
        }
    }

    async fn decompose(&self, command: &str) -> Vec<SubTask> {
        let prompt = decomposition_prompt(command, &self.agents.names());
        let breaker = self.breakers.get_or_create(LLM_BREAKER);
        match breaker.call(|| self.llm.generate(&prompt, DECOMPOSER_SYSTEM)).await {
            Ok(response) => parse_subtasks(&response, command),
            Err(e) => {
                let e = e.map_failure(|e| e.to_string());
                warn!(error = %e, "Decomposition unavailable, using fallback");
                fallback(command)
            }
        }
    }

    async fn run_step(&self, cmd: &mut MultiStepCommand, step: usize) -> CoordinatorResult<()> {
        let previous = cmd.sub_tasks[step]
            .depends_on
            .as_ref()
            .and_then(|dep| cmd.shared_state.get(dep))
            .cloned();

        let task = &mut cmd.sub_tasks[step];
        if let Some(previous) = previous {
            task.parameters.insert("previous_result".into(), previous);
        }
        task.set_status(TaskStatus::Executing)?;
        let task = task.clone();
        self.track(cmd);

        info!(
            command_id = %cmd.id,
            step = step + 1,
            action = %task.action,
            service = %task.target,
            "Executing sub-task"
        );
        let outcome = self.execute_sub_task(&task, &cmd.context_id).await;

        let slot = &mut cmd.sub_tasks[step];
        match outcome {
            Ok(result) => {
                slot.result = Some(result.clone());
                slot.set_status(TaskStatus::Completed)?;
                cmd.shared_state.insert(task.id.clone(), result);
                self.track(cmd);
                Ok(())
            }
            Err(e) => {
                slot.error = Some(e.to_string());
                slot.set_status(TaskStatus::Failed)?;
                Err(e)
            }
        }
    }

    /// Route one sub-task and wait, bounded, for its agent's response.
    async fn execute_sub_task(&self, task: &SubTask, context_id: &str) -> CoordinatorResult<Value> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_map().insert(request_id.clone(), tx);

        let intent = Intent {
            action: task.action.clone(),
            target: task.target.clone(),
            parameters: task.parameters.clone(),
            confidence: 1.0,
            raw_input: format!("{} on {}", task.action, task.target),
            context_id: context_id.to_string(),
        };

        if let Err(e) = self.router.route_intent(&intent, &request_id) {
            self.pending_map().remove(&request_id);
            return Err(e.into());
        }

        let timeout = Duration::from_secs(self.config.step_timeout_secs);
        let response = tokio::time::timeout(timeout, rx).await;
        self.pending_map().remove(&request_id);

        let response = match response {
            Err(_) => {
                return Err(CoordinatorError::StepTimedOut {
                    target: task.target.clone(),
                    timeout_secs: self.config.step_timeout_secs,
                })
            }
            Ok(Err(_)) => return Err(CoordinatorError::ChannelClosed(request_id)),
            Ok(Ok(response)) => response,
        };

        if response.get("success").and_then(Value::as_bool).unwrap_or(false) {
            Ok(response.get("data").cloned().unwrap_or(Value::Null))
        } else {
            let reason = response
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("agent reported failure");
            Err(CoordinatorError::Agent(reason.to_string()))
        }
    }

    fn finish_failed(
        &self,
        mut cmd: MultiStepCommand,
        step: usize,
        err: CoordinatorError,
    ) -> MultiStepCommand {
        let reason = err.to_string();
        cmd.error = Some(reason.clone());
        if let Err(e) = cmd.advance(TaskStatus::Failed, Some(&reason)) {
            error!(command_id = %cmd.id, error = %e, "Invalid command transition");
        }
        self.failed.fetch_add(1, Ordering::Relaxed);
        error!(command_id = %cmd.id, step = step + 1, error = %reason, "Multi-step command failed");

        self.publish(
            UI_NOTIFICATION,
            payload! {
                "title" => "Command Failed",
                "body" => format!("Multi-step command failed at step {}: {}", step + 1, reason),
                "priority" => "high",
            },
        );
        self.publish(
            VOICE_SPEAK,
            payload! { "text" => format!("Command failed: {reason}"), "priority" => "high" },
        );
        self.publish(
            UI_ERROR,
            payload! { "command_id" => cmd.id, "step" => step + 1, "error" => reason },
        );

        self.retire(&cmd);
        cmd
    }

    fn finish_completed(&self, mut cmd: MultiStepCommand) -> MultiStepCommand {
        if let Err(e) = cmd.advance(TaskStatus::Completed, None) {
            error!(command_id = %cmd.id, error = %e, "Invalid command transition");
        }
        self.completed.fetch_add(1, Ordering::Relaxed);
        let secs = cmd
            .duration()
            .map(|d| d.num_milliseconds() as f64 / 1000.0)
            .unwrap_or_default();
        info!(
            command_id = %cmd.id,
            tasks = cmd.sub_tasks.len(),
            secs,
            "Multi-step command completed"
        );

        self.publish(
            UI_NOTIFICATION,
            payload! {
                "title" => "Command Completed",
                "body" => format!("Successfully completed {} tasks", cmd.sub_tasks.len()),
                "priority" => "normal",
            },
        );
        self.publish(
            VOICE_SPEAK,
            payload! { "text" => "Command completed successfully", "priority" => "normal" },
        );

        self.retire(&cmd);
        cmd
    }

    fn track(&self, cmd: &MultiStepCommand) {
        self.active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cmd.id.clone(), cmd.clone());
    }

    /// Move a finished command from the active set into capped history.
    fn retire(&self, cmd: &MultiStepCommand) {
        self.active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&cmd.id);
        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        history.push_back(cmd.clone());
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
    }

    fn pending_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Payload>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, topic: &str, payload: Payload) {
        if let Err(e) = self.bus.emit(topic, payload) {
            error!(topic, error = %e, "Failed to publish event");
        }
    }
}

#[async_trait]
impl EventHandler for MultiAgentCoordinator {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let Some(request_id) = event.str_field(FIELD_REQUEST_ID) else {
            return Ok(());
        };
        let waiter = self.pending_map().remove(request_id);
        if let Some(tx) = waiter {
            // Receiver gone means the step already timed out.
            let _ = tx.send(event.payload.clone());
        }
        Ok(())
    }
}
