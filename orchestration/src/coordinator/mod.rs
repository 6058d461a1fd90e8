//! Multi-step command coordination.
//!
//! A compound command is decomposed by the language model into ordered
//! sub-tasks. Each sub-task is routed like any other intent and the
//! coordinator waits, with a timeout, for the matching
//! `orchestrator.response` before moving on.
//!
//! `execute_multi_step` must not be awaited from inside an event handler:
//! it waits on responses delivered by the same dispatch loop.

pub mod decompose;
pub mod multi_step;
pub mod types;

pub use decompose::{decomposition_prompt, parse_subtasks};
pub use multi_step::{
    CoordinatorConfig, CoordinatorError, CoordinatorResult, CoordinatorStats, MultiAgentCoordinator,
};
pub use types::{IllegalTransition, MultiStepCommand, SubTask, TaskStatus, TransitionRecord};
