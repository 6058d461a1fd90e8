//! Configuration for the orchestration backbone.
//!
//! Sources, later ones winning:
//! 1. Built-in defaults
//! 2. Optional TOML file
//! 3. `AUTOCOM_*` environment variables
//!
//! The result is validated before use.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::coordinator::CoordinatorConfig;
use crate::events::EventBusConfig;
use crate::health::HealthConfig;
use crate::llm::LlmConfig;
use crate::middleware::{MiddlewareConfig, StackProfile};
use crate::resilience::CircuitBreakerConfig;
use crate::router::RouterConfig;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Agents registered at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub names: Vec<String>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            names: vec!["mail".to_string(), "chat".to_string()],
        }
    }
}

/// Where interaction history is kept.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub path: PathBuf,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/interactions.jsonl"),
        }
    }
}

/// Complete backbone configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    pub event_bus: EventBusConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub router: RouterConfig,
    pub coordinator: CoordinatorConfig,
    pub middleware: MiddlewareConfig,
    pub health: HealthConfig,
    pub llm: LlmConfig,
    pub agents: AgentsConfig,
    pub context: ContextConfig,
}

impl OrchestrationConfig {
    /// Defaults, then `path` if given, then environment overrides.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `AUTOCOM_*` overrides from `lookup`. Unparseable values are
    /// ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            lookup(key).and_then(|s| s.trim().parse().ok())
        }

        if let Some(v) = parsed(&lookup, "AUTOCOM_MAX_QUEUE_SIZE") {
            self.event_bus.max_queue_size = v;
        }
        if let Some(v) = parsed(&lookup, "AUTOCOM_HANDLER_TIMEOUT_SECS") {
            self.event_bus.handler_timeout_secs = v;
        }
        if let Some(v) = parsed(&lookup, "AUTOCOM_FAILURE_THRESHOLD") {
            self.circuit_breaker.failure_threshold = v;
        }
        if let Some(v) = parsed(&lookup, "AUTOCOM_SUCCESS_THRESHOLD") {
            self.circuit_breaker.success_threshold = v;
        }
        if let Some(v) = parsed(&lookup, "AUTOCOM_BREAKER_TIMEOUT_SECS") {
            self.circuit_breaker.timeout_seconds = v;
        }
        if let Some(v) = parsed(&lookup, "AUTOCOM_CONFIDENCE_THRESHOLD") {
            self.router.confidence_threshold = v;
        }
        if let Some(v) = parsed(&lookup, "AUTOCOM_STEP_TIMEOUT_SECS") {
            self.coordinator.step_timeout_secs = v;
        }
        if let Some(v) = parsed(&lookup, "AUTOCOM_RATE_LIMIT_MAX_REQUESTS") {
            self.middleware.rate_limit.max_requests = v;
        }
        if let Some(v) = parsed(&lookup, "AUTOCOM_RATE_LIMIT_WINDOW_SECS") {
            self.middleware.rate_limit.window_seconds = v;
        }
        if let Some(v) = parsed(&lookup, "AUTOCOM_CACHE_TTL_SECS") {
            self.middleware.cache.ttl_seconds = v;
        }
        match lookup("AUTOCOM_MIDDLEWARE_PROFILE").as_deref().map(str::trim) {
            Some("production") => self.middleware.profile = StackProfile::Production,
            Some("development") => self.middleware.profile = StackProfile::Development,
            _ => {}
        }
        if let Some(v) = lookup("AUTOCOM_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = lookup("AUTOCOM_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = lookup("AUTOCOM_LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = parsed(&lookup, "AUTOCOM_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = v;
        }
        if let Some(v) = lookup("AUTOCOM_AGENTS") {
            self.agents.names = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("AUTOCOM_CONTEXT_PATH") {
            self.context.path = PathBuf::from(v);
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.event_bus.max_queue_size == 0 {
            return invalid("event_bus.max_queue_size must be at least 1");
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return invalid("circuit_breaker.failure_threshold must be at least 1");
        }
        if self.circuit_breaker.success_threshold == 0 {
            return invalid("circuit_breaker.success_threshold must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.router.confidence_threshold) {
            return invalid("router.confidence_threshold must be between 0 and 1");
        }
        if self.middleware.rate_limit.max_requests == 0 {
            return invalid("middleware.rate_limit.max_requests must be at least 1");
        }
        if self.coordinator.step_timeout_secs == 0 {
            return invalid("coordinator.step_timeout_secs must be at least 1");
        }
        if self.coordinator.history_limit == 0 {
            return invalid("coordinator.history_limit must be at least 1");
        }
        if self.health.interval_secs == 0 {
            return invalid("health.interval_secs must be at least 1");
        }
        Ok(())
    }
}
