//! Health checks with per-check timeouts and worst-status aggregation.
//!
//! A check that errors, panics or overruns its timeout is reported as
//! `Unhealthy`; nothing a check does can take down the manager.

pub mod checks;

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::Payload;

pub use checks::{
    AgentHealthCheck, CircuitBreakerHealthCheck, ContextStoreHealthCheck, EventBusHealthCheck,
    LanguageModelHealthCheck,
};

/// Check status, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Timeout for checks that do not set their own.
    pub check_timeout_secs: u64,
    /// Period of the background check loop.
    pub interval_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_timeout_secs: 5,
            interval_secs: 30,
        }
    }
}

/// What a check reports before timing is attached.
#[derive(Debug, Clone)]
pub struct Probe {
    pub status: HealthStatus,
    pub message: String,
    pub metadata: Payload,
}

impl Probe {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Healthy, message)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Degraded, message)
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(HealthStatus::Unhealthy, message)
    }

    fn with_status(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            metadata: Payload::new(),
        }
    }

    pub fn meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Outcome of one check invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
    pub metadata: Payload,
}

/// Outcome of `check_all`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateHealth {
    /// Worst individual status; `Healthy` with no checks registered.
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub checks: Vec<HealthCheckResult>,
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    /// Override for the manager's default timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn probe(&self) -> anyhow::Result<Probe>;
}

/// Registry and runner for health checks.
pub struct HealthCheckManager {
    checks: RwLock<Vec<Arc<dyn HealthCheck>>>,
    last_results: RwLock<BTreeMap<String, HealthCheckResult>>,
    default_timeout: Duration,
}

impl HealthCheckManager {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            checks: RwLock::new(Vec::new()),
            last_results: RwLock::new(BTreeMap::new()),
            default_timeout: Duration::from_secs(config.check_timeout_secs.max(1)),
        }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn register(&self, check: Arc<dyn HealthCheck>) {
        info!(check = %check.name(), "Health check registered");
        self.checks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(check);
    }

    pub fn len(&self) -> usize {
        self.checks.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every registered check concurrently.
    pub async fn check_all(&self) -> AggregateHealth {
        let checks: Vec<_> = self
            .checks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let results = join_all(checks.iter().map(|c| self.run_one(c.as_ref()))).await;
        let status = results
            .iter()
            .map(|r| r.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        {
            let mut last = self.last_results.write().unwrap_or_else(PoisonError::into_inner);
            for r in &results {
                last.insert(r.name.clone(), r.clone());
            }
        }

        debug!(status = %status, checks = results.len(), "Health checks complete");
        AggregateHealth {
            status,
            timestamp: Utc::now(),
            checks: results,
        }
    }

    /// Ready to accept work: overall status is healthy or degraded.
    pub async fn check_readiness(&self) -> bool {
        matches!(
            self.check_all().await.status,
            HealthStatus::Healthy | HealthStatus::Degraded
        )
    }

    /// Alive: overall status is not unhealthy.
    pub async fn check_liveness(&self) -> bool {
        self.check_all().await.status != HealthStatus::Unhealthy
    }

    /// Most recent result per check name.
    pub fn last_results(&self) -> BTreeMap<String, HealthCheckResult> {
        self.last_results
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-run `check_all` every `interval` until `shutdown` is cancelled.
    pub fn spawn_periodic(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let health = manager.check_all().await;
                        if health.status != HealthStatus::Healthy {
                            warn!(status = %health.status, "System health check not healthy");
                        }
                    }
                }
            }
            debug!("Periodic health checks stopped");
        })
    }

    async fn run_one(&self, check: &dyn HealthCheck) -> HealthCheckResult {
        let limit = check.timeout().unwrap_or(self.default_timeout);
        let started = Instant::now();
        let outcome =
            tokio::time::timeout(limit, AssertUnwindSafe(check.probe()).catch_unwind()).await;

        let probe = match outcome {
            Ok(Ok(Ok(probe))) => probe,
            Ok(Ok(Err(e))) => Probe::unhealthy(format!("Health check failed: {e:#}"))
                .meta("error", e.to_string()),
            Ok(Err(_)) => Probe::unhealthy("Health check panicked"),
            Err(_) => Probe::unhealthy(format!(
                "Health check timed out after {:.1}s",
                limit.as_secs_f64()
            )),
        };

        HealthCheckResult {
            name: check.name().to_string(),
            status: probe.status,
            message: probe.message,
            duration: started.elapsed(),
            timestamp: Utc::now(),
            metadata: probe.metadata,
        }
    }
}

impl Default for HealthCheckManager {
    fn default() -> Self {
        Self::new(&HealthConfig::default())
    }
}
