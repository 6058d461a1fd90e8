//! Append-only JSON Lines context store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{ContextEntry, ContextStore, StoreResult};
use crate::router::Intent;

/// Durable store writing one JSON object per line.
///
/// Lines that fail to parse are skipped on read.
#[derive(Debug)]
pub struct JsonlContextStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlContextStore {
    /// Open (or lazily create) the store at `path`. Parent directories are
    /// created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ContextStore for JsonlContextStore {
    async fn store_interaction(&self, intent: &Intent, response: Option<Value>) -> StoreResult<()> {
        let entry = ContextEntry::new(intent, response);
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        debug!(path = %self.path.display(), context_id = %entry.context_id, "Interaction stored");
        Ok(())
    }

    async fn get_recent_context(
        &self,
        limit: usize,
        context_id: &str,
    ) -> StoreResult<Vec<ContextEntry>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries: Vec<ContextEntry> = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ContextEntry>(line) {
                Ok(entry) if entry.context_id == context_id => entries.push(entry),
                Ok(_) => {}
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = lineno + 1,
                    error = %e,
                    "Skipping malformed context line"
                ),
            }
        }

        let skip = entries.len().saturating_sub(limit);
        Ok(entries.split_off(skip))
    }
}
