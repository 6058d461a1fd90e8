//! Response cache keyed by topic and a stable payload hash.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use super::chain::{Middleware, MiddlewareResult, Next};
use crate::events::Payload;

/// Actions treated as reads when no list is configured.
pub const DEFAULT_CACHEABLE_ACTIONS: &[&str] =
    &["fetch", "get", "list", "read", "search", "query", "status"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_seconds: u64,
    /// Last topic segments whose results may be replayed. Anything else,
    /// such as `agent.chat.send`, always reaches the handler.
    pub cacheable_actions: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 300,
            cacheable_actions: DEFAULT_CACHEABLE_ACTIONS.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Stable hash of a payload.
///
/// Object keys are hashed in sorted order at every depth, so the result
/// does not depend on insertion order or on how `Map` is backed.
pub fn payload_hash(payload: &Payload) -> String {
    let mut hasher = blake3::Hasher::new();
    hash_object(&mut hasher, payload);
    hasher.finalize().to_hex().to_string()
}

fn hash_object(hasher: &mut blake3::Hasher, map: &Payload) {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
    hasher.update(b"{");
    for (i, (key, value)) in entries.into_iter().enumerate() {
        if i > 0 {
            hasher.update(b",");
        }
        hasher.update(Value::String(key.clone()).to_string().as_bytes());
        hasher.update(b":");
        hash_value(hasher, value);
    }
    hasher.update(b"}");
}

fn hash_value(hasher: &mut blake3::Hasher, value: &Value) {
    match value {
        Value::Object(map) => hash_object(hasher, map),
        Value::Array(items) => {
            hasher.update(b"[");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    hasher.update(b",");
                }
                hash_value(hasher, item);
            }
            hasher.update(b"]");
        }
        scalar => {
            hasher.update(scalar.to_string().as_bytes());
        }
    }
}

struct CachedResult {
    result: Payload,
    stored_at: Instant,
}

/// Returns a stored result while it is younger than the TTL.
///
/// Only successful results of cacheable actions are stored: an `Err`, a
/// payload with `success: false`, or a side-effecting action always goes
/// back to the handler next time.
pub struct CachingMiddleware {
    ttl: Duration,
    cacheable_actions: Vec<String>,
    entries: Mutex<HashMap<(String, String), CachedResult>>,
}

impl CachingMiddleware {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            ttl: Duration::from_secs(config.ttl_seconds),
            cacheable_actions: config.cacheable_actions,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Whether results for `topic` may be replayed.
    pub fn is_cacheable(&self, topic: &str) -> bool {
        let action = topic.rsplit('.').next().unwrap_or(topic);
        self.cacheable_actions.iter().any(|a| a == action)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn lookup(&self, key: &(String, String)) -> Option<Payload> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|cached| cached.stored_at.elapsed() < self.ttl)
            .map(|cached| cached.result.clone())
    }

    fn store(&self, key: (String, String), result: Payload) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, cached| now.saturating_duration_since(cached.stored_at) < self.ttl);
        entries.insert(
            key,
            CachedResult {
                result,
                stored_at: now,
            },
        );
    }
}

fn is_success(result: &Payload) -> bool {
    result.get("success").and_then(Value::as_bool) != Some(false)
}

#[async_trait]
impl Middleware for CachingMiddleware {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn process(&self, topic: &str, payload: Payload, next: Next<'_>) -> MiddlewareResult {
        if !self.is_cacheable(topic) {
            return next.run(topic, payload).await;
        }
        let key = (topic.to_string(), payload_hash(&payload));
        if let Some(hit) = self.lookup(&key) {
            debug!(topic, "Cache hit");
            return Ok(hit);
        }

        let result = next.run(topic, payload).await?;
        if is_success(&result) {
            self.store(key, result.clone());
        }
        Ok(result)
    }
}
