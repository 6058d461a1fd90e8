use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use super::{ContextEntry, ContextStore, StoreResult};
use crate::router::Intent;

/// Entries kept per context id before the oldest are discarded.
pub const DEFAULT_CAPACITY: usize = 100;

/// Volatile store with a bounded ring per context id.
#[derive(Debug)]
pub struct InMemoryContextStore {
    capacity: usize,
    sessions: Mutex<HashMap<String, VecDeque<ContextEntry>>>,
}

impl InMemoryContextStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Total entries across all sessions.
    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(VecDeque::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryContextStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn store_interaction(&self, intent: &Intent, response: Option<Value>) -> StoreResult<()> {
        let entry = ContextEntry::new(intent, response);
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let ring = sessions.entry(entry.context_id.clone()).or_default();
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(entry);
        Ok(())
    }

    async fn get_recent_context(
        &self,
        limit: usize,
        context_id: &str,
    ) -> StoreResult<Vec<ContextEntry>> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(ring) = sessions.get(context_id) else {
            return Ok(Vec::new());
        };
        let skip = ring.len().saturating_sub(limit);
        Ok(ring.iter().skip(skip).cloned().collect())
    }
}
