//! Admission middlewares: authentication and rate limiting.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::warn;

use super::chain::{Middleware, MiddlewareError, MiddlewareResult, Next};
use crate::events::Payload;

/// Client key used when the payload carries no `client_id`.
pub const DEFAULT_CLIENT: &str = "default";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Topics (or `prefix.*` patterns) that require an `auth_token`.
    pub required_topics: Vec<String>,
    /// Accepted tokens. Empty means any non-empty token is accepted.
    pub tokens: Vec<String>,
}

/// Rejects protected topics whose payload lacks a valid `auth_token`.
#[derive(Debug)]
pub struct AuthenticationMiddleware {
    config: AuthConfig,
}

impl AuthenticationMiddleware {
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    fn requires_auth(&self, topic: &str) -> bool {
        self.config.required_topics.iter().any(|pattern| {
            match pattern.strip_suffix('*').filter(|p| p.ends_with('.')) {
                Some(prefix) => topic.starts_with(prefix),
                None => pattern == topic,
            }
        })
    }

    fn accepts(&self, token: Option<&str>) -> bool {
        match token.filter(|t| !t.is_empty()) {
            None => false,
            Some(t) => self.config.tokens.is_empty() || self.config.tokens.iter().any(|k| k == t),
        }
    }
}

#[async_trait]
impl Middleware for AuthenticationMiddleware {
    fn name(&self) -> &'static str {
        "authentication"
    }

    async fn process(&self, topic: &str, payload: Payload, next: Next<'_>) -> MiddlewareResult {
        if self.requires_auth(topic) {
            let token = payload.get("auth_token").and_then(Value::as_str);
            if !self.accepts(token) {
                warn!(topic, "Authentication failed");
                return Err(MiddlewareError::Unauthorized {
                    topic: topic.to_string(),
                });
            }
        }
        next.run(topic, payload).await
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: usize,
    pub window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_seconds: 60,
        }
    }
}

/// Sliding-window limiter keyed by the payload's `client_id`.
#[derive(Debug)]
pub struct RateLimitMiddleware {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimitMiddleware {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Clients with a request inside the current window.
    pub fn tracked_clients(&self) -> usize {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Record one request for `client`, or refuse it if the window is full.
    ///
    /// Clients whose every request has aged out are dropped.
    fn admit(&self, client: &str) -> bool {
        let window = Duration::from_secs(self.config.window_seconds);
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows.retain(|_, stamps| {
            while stamps
                .front()
                .is_some_and(|t| now.saturating_duration_since(*t) >= window)
            {
                stamps.pop_front();
            }
            !stamps.is_empty()
        });

        let stamps = windows.entry(client.to_string()).or_default();
        if stamps.len() >= self.config.max_requests {
            return false;
        }
        stamps.push_back(now);
        true
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn process(&self, topic: &str, payload: Payload, next: Next<'_>) -> MiddlewareResult {
        let client = payload
            .get("client_id")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_CLIENT)
            .to_string();

        if !self.admit(&client) {
            warn!(topic, client = %client, "Rate limit exceeded");
            return Err(MiddlewareError::RateLimited {
                client,
                limit: self.config.max_requests,
                window_seconds: self.config.window_seconds,
            });
        }
        next.run(topic, payload).await
    }
}
