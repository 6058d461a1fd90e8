//! Logging, metrics and error normalisation.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, error, info};

use super::chain::{Middleware, MiddlewareError, MiddlewareResult, Next};
use crate::events::Payload;

/// Logs every event entering the chain and how it left.
#[derive(Debug, Default)]
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn process(&self, topic: &str, payload: Payload, next: Next<'_>) -> MiddlewareResult {
        debug!(topic, fields = payload.len(), "Processing event");
        let started = Instant::now();
        let result = next.run(topic, payload).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => info!(topic, elapsed_ms, "Event processed"),
            Err(e) => error!(topic, elapsed_ms, error = %e, "Event processing failed"),
        }
        result
    }
}

/// Per-topic counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopicMetrics {
    pub count: u64,
    pub total_time: Duration,
    pub errors: u64,
    pub last_called: Option<DateTime<Utc>>,
    pub avg_time: Duration,
}

/// Records call count, latency and error count per topic.
#[derive(Debug, Default)]
pub struct MetricsMiddleware {
    topics: Mutex<HashMap<String, TopicMetrics>>,
}

impl MetricsMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, TopicMetrics> {
        self.topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn record(&self, topic: &str, elapsed: Duration, failed: bool) {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let m = topics.entry(topic.to_string()).or_default();
        m.count += 1;
        m.total_time += elapsed;
        if failed {
            m.errors += 1;
        }
        m.last_called = Some(Utc::now());
        m.avg_time = m.total_time / m.count.max(1) as u32;
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn process(&self, topic: &str, payload: Payload, next: Next<'_>) -> MiddlewareResult {
        let started = Instant::now();
        let result = next.run(topic, payload).await;
        let failed = match &result {
            Ok(p) => p.get("success").and_then(Value::as_bool) == Some(false),
            Err(_) => true,
        };
        self.record(topic, started.elapsed(), failed);
        result
    }
}

/// Outermost layer: turns any error or panic from inner layers into a
/// structured failure payload.
#[derive(Debug, Default)]
pub struct ErrorHandlingMiddleware;

/// Failure payload produced for `err` on `topic`.
pub fn failure_payload(topic: &str, err: &MiddlewareError) -> Payload {
    let mut p = Payload::new();
    p.insert("success".into(), Value::Bool(false));
    p.insert("error".into(), json!(err.to_string()));
    p.insert("error_type".into(), json!(err.kind()));
    p.insert("event".into(), json!(topic));
    p
}

#[async_trait]
impl Middleware for ErrorHandlingMiddleware {
    fn name(&self) -> &'static str {
        "error_handling"
    }

    async fn process(&self, topic: &str, payload: Payload, next: Next<'_>) -> MiddlewareResult {
        let outcome = AssertUnwindSafe(next.run(topic, payload)).catch_unwind().await;
        let err = match outcome {
            Ok(Ok(result)) => return Ok(result),
            Ok(Err(e)) => e,
            Err(_) => MiddlewareError::Panicked {
                topic: topic.to_string(),
            },
        };
        error!(topic, error = %err, error_type = err.kind(), "Error in middleware chain");
        Ok(failure_payload(topic, &err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::chain::{endpoint_fn, MiddlewareStack};
    use crate::payload;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_errors_become_failure_payloads() {
        let stack = MiddlewareStack::new().with(Arc::new(ErrorHandlingMiddleware));
        let endpoint = endpoint_fn(|_topic, _payload| async move {
            Err(MiddlewareError::Handler("mailbox unreachable".into()))
        });

        let out = stack.execute("agent.mail.fetch", Payload::new(), &endpoint).await.unwrap();
        assert_eq!(out.get("success"), Some(&Value::Bool(false)));
        assert_eq!(out.get("error").and_then(Value::as_str), Some("mailbox unreachable"));
        assert_eq!(out.get("error_type").and_then(Value::as_str), Some("HandlerError"));
        assert_eq!(out.get("event").and_then(Value::as_str), Some("agent.mail.fetch"));
    }

    #[tokio::test]
    async fn test_panics_become_failure_payloads() {
        let stack = MiddlewareStack::new().with(Arc::new(ErrorHandlingMiddleware));
        let endpoint = endpoint_fn(|_topic, payload| async move {
            if payload.is_empty() {
                panic!("endpoint exploded");
            }
            Ok(payload)
        });

        let out = stack.execute("agent.chat.send", Payload::new(), &endpoint).await.unwrap();
        assert_eq!(out.get("error_type").and_then(Value::as_str), Some("Panicked"));
    }

    #[tokio::test]
    async fn test_metrics_count_calls_and_errors() {
        let metrics = Arc::new(MetricsMiddleware::new());
        let stack = MiddlewareStack::new()
            .with(Arc::new(LoggingMiddleware))
            .with(Arc::clone(&metrics) as Arc<dyn Middleware>);
        let endpoint = endpoint_fn(|_topic, payload: Payload| async move {
            let ok = payload.get("ok").and_then(Value::as_bool).unwrap_or(false);
            Ok(payload! { "success" => ok })
        });

        stack.execute("agent.mail.fetch", payload! { "ok" => true }, &endpoint).await.unwrap();
        stack.execute("agent.mail.fetch", payload! { "ok" => false }, &endpoint).await.unwrap();
        stack.execute("agent.chat.send", payload! { "ok" => true }, &endpoint).await.unwrap();

        let snap = metrics.snapshot();
        assert_eq!(snap["agent.mail.fetch"].count, 2);
        assert_eq!(snap["agent.mail.fetch"].errors, 1);
        assert_eq!(snap["agent.chat.send"].errors, 0);
        assert!(snap["agent.chat.send"].last_called.is_some());
    }
}
