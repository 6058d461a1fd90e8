//! Persistent interaction history keyed by session.
//!
//! Stores only see completed interactions (intent plus optional response);
//! reads return the most recent entries for one context id, oldest first.

pub mod jsonl;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::router::Intent;

pub use jsonl::JsonlContextStore;
pub use memory::InMemoryContextStore;

/// Error type for context store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One recorded interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub user_input: String,
    pub intent: Intent,
    #[serde(default)]
    pub response: Option<Value>,
    pub timestamp: DateTime<Utc>,
    pub context_id: String,
}

impl ContextEntry {
    pub fn new(intent: &Intent, response: Option<Value>) -> Self {
        Self {
            user_input: intent.raw_input.clone(),
            intent: intent.clone(),
            response,
            timestamp: Utc::now(),
            context_id: intent.context_id.clone(),
        }
    }
}

/// Append/read access to interaction history.
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn store_interaction(&self, intent: &Intent, response: Option<Value>) -> StoreResult<()>;

    /// Up to `limit` entries for `context_id`, most recent last.
    async fn get_recent_context(
        &self,
        limit: usize,
        context_id: &str,
    ) -> StoreResult<Vec<ContextEntry>>;
}
