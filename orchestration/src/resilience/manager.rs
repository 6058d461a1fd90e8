//! Registry of circuit breakers keyed by dependency name.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};

/// Shared reference to a CircuitBreakerManager
pub type SharedBreakers = Arc<CircuitBreakerManager>;

/// Lazily populated breaker registry.
///
/// Constructed at the composition root and passed to every component that
/// guards a dependency. Read-mostly after warm-up.
#[derive(Debug, Default)]
pub struct CircuitBreakerManager {
    default_config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerManager {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn shared(self) -> SharedBreakers {
        Arc::new(self)
    }

    /// Breaker for `name`, created with the default policy on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, self.default_config.clone())
    }

    /// Breaker for `name`, created with `config` on first use. An existing
    /// breaker keeps the policy it was created with.
    pub fn get_or_create_with(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.get(name) {
            return existing;
        }

        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            info!(
                breaker = name,
                failure_threshold = config.failure_threshold,
                success_threshold = config.success_threshold,
                timeout_seconds = config.timeout_seconds,
                "Circuit breaker created"
            );
            Arc::new(CircuitBreaker::new(name, config))
        });
        Arc::clone(breaker)
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Snapshot of every breaker, sorted by name.
    pub fn states(&self) -> BTreeMap<String, CircuitSnapshot> {
        self.all()
            .into_iter()
            .map(|b| (b.name().to_string(), b.snapshot()))
            .collect()
    }

    /// Names of breakers currently open.
    pub fn open_circuits(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .all()
            .into_iter()
            .filter(|b| b.state() == CircuitState::Open)
            .map(|b| b.name().to_string())
            .collect();
        open.sort();
        open
    }

    pub fn reset_all(&self) {
        let all = self.all();
        debug!(count = all.len(), "Resetting all circuit breakers");
        for breaker in all {
            breaker.reset();
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}
