//! Interceptor chain and terminal endpoint.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::events::Payload;

/// Error raised inside the chain. The error-handling middleware turns it
/// into a structured failure payload.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MiddlewareError {
    #[error("Authentication required for {topic}")]
    Unauthorized { topic: String },

    #[error("Rate limit exceeded for client '{client}': {limit} requests per {window_seconds}s")]
    RateLimited {
        client: String,
        limit: usize,
        window_seconds: u64,
    },

    #[error("Handler panicked while processing {topic}")]
    Panicked { topic: String },

    #[error("{0}")]
    Handler(String),
}

impl MiddlewareError {
    /// Stable name reported as `error_type` in failure payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "Unauthorized",
            Self::RateLimited { .. } => "RateLimited",
            Self::Panicked { .. } => "Panicked",
            Self::Handler(_) => "HandlerError",
        }
    }
}

impl From<anyhow::Error> for MiddlewareError {
    fn from(e: anyhow::Error) -> Self {
        Self::Handler(format!("{e:#}"))
    }
}

pub type MiddlewareResult = Result<Payload, MiddlewareError>;

/// Innermost handler reached when every middleware calls through.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn call(&self, topic: &str, payload: Payload) -> MiddlewareResult;
}

/// Adapter turning an async closure into an [`Endpoint`].
pub struct FnEndpoint<F>(F);

#[async_trait]
impl<F, Fut> Endpoint for FnEndpoint<F>
where
    F: Fn(String, Payload) -> Fut + Send + Sync,
    Fut: Future<Output = MiddlewareResult> + Send,
{
    async fn call(&self, topic: &str, payload: Payload) -> MiddlewareResult {
        (self.0)(topic.to_string(), payload).await
    }
}

pub fn endpoint_fn<F, Fut>(f: F) -> FnEndpoint<F>
where
    F: Fn(String, Payload) -> Fut + Send + Sync,
    Fut: Future<Output = MiddlewareResult> + Send,
{
    FnEndpoint(f)
}

/// One interceptor. Either call `next.run(..)` to continue or return a
/// result directly to short-circuit everything inside it.
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, topic: &str, payload: Payload, next: Next<'_>) -> MiddlewareResult;
}

/// Remainder of the chain below the current middleware.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    pub async fn run(self, topic: &str, payload: Payload) -> MiddlewareResult {
        match self.chain.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    chain: rest,
                    endpoint: self.endpoint,
                };
                head.process(topic, payload, next).await
            }
            None => self.endpoint.call(topic, payload).await,
        }
    }
}

/// Which prebuilt stack to assemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackProfile {
    #[default]
    Production,
    Development,
}

/// Ordered middleware list, outermost first.
#[derive(Clone, Default)]
pub struct MiddlewareStack {
    layers: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware inside the ones already added.
    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.add(middleware);
        self
    }

    pub fn add(&mut self, middleware: Arc<dyn Middleware>) {
        self.layers.push(middleware);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Layer names, outermost first.
    pub fn names(&self) -> Vec<&'static str> {
        self.layers.iter().map(|m| m.name()).collect()
    }

    /// Run `payload` through every layer and then `endpoint`.
    pub async fn execute(
        &self,
        topic: &str,
        payload: Payload,
        endpoint: &dyn Endpoint,
    ) -> MiddlewareResult {
        Next {
            chain: &self.layers,
            endpoint,
        }
        .run(topic, payload)
        .await
    }
}

impl std::fmt::Debug for MiddlewareStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareStack")
            .field("layers", &self.names())
            .finish()
    }
}
