//! Middleware stack wrapping agent-bound events.
//!
//! Layers run outermost first. Each may call through to the next layer or
//! return early (auth rejection, rate limit, cache hit). The terminal
//! [`Endpoint`] only runs when every layer calls through.
//!
//! # Prebuilt stacks
//!
//! - production: error handling, logging, metrics, authentication,
//!   rate limit, cache
//! - development: error handling, logging

pub mod cache;
pub mod chain;
pub mod guards;
pub mod observe;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use cache::{payload_hash, CacheConfig, CachingMiddleware};
pub use chain::{
    endpoint_fn, Endpoint, FnEndpoint, Middleware, MiddlewareError, MiddlewareResult,
    MiddlewareStack, Next, StackProfile,
};
pub use guards::{AuthConfig, AuthenticationMiddleware, RateLimitConfig, RateLimitMiddleware};
pub use observe::{
    failure_payload, ErrorHandlingMiddleware, LoggingMiddleware, MetricsMiddleware, TopicMetrics,
};

/// Middleware settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    pub profile: StackProfile,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheConfig,
    pub auth: AuthConfig,
}

/// A built stack plus a handle to its metrics layer, if it has one.
#[derive(Debug, Clone)]
pub struct BuiltStack {
    pub stack: MiddlewareStack,
    pub metrics: Option<Arc<MetricsMiddleware>>,
}

impl MiddlewareStack {
    /// Full stack for normal operation.
    pub fn production(config: &MiddlewareConfig) -> BuiltStack {
        let metrics = Arc::new(MetricsMiddleware::new());
        let stack = MiddlewareStack::new()
            .with(Arc::new(ErrorHandlingMiddleware))
            .with(Arc::new(LoggingMiddleware))
            .with(Arc::clone(&metrics) as Arc<dyn Middleware>)
            .with(Arc::new(AuthenticationMiddleware::new(config.auth.clone())))
            .with(Arc::new(RateLimitMiddleware::new(config.rate_limit.clone())))
            .with(Arc::new(CachingMiddleware::new(config.cache.clone())));
        BuiltStack {
            stack,
            metrics: Some(metrics),
        }
    }

    /// Error handling and logging only.
    pub fn development() -> BuiltStack {
        let stack = MiddlewareStack::new()
            .with(Arc::new(ErrorHandlingMiddleware))
            .with(Arc::new(LoggingMiddleware));
        BuiltStack { stack, metrics: None }
    }

    pub fn from_config(config: &MiddlewareConfig) -> BuiltStack {
        match config.profile {
            StackProfile::Production => Self::production(config),
            StackProfile::Development => Self::development(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prebuilt_stack_order() {
        let built = MiddlewareStack::from_config(&MiddlewareConfig::default());
        assert_eq!(
            built.stack.names(),
            vec!["error_handling", "logging", "metrics", "authentication", "rate_limit", "cache"]
        );
        assert!(built.metrics.is_some());

        let dev = MiddlewareStack::from_config(&MiddlewareConfig {
            profile: StackProfile::Development,
            ..MiddlewareConfig::default()
        });
        assert_eq!(dev.stack.names(), vec!["error_handling", "logging"]);
        assert!(dev.metrics.is_none());
    }
}
