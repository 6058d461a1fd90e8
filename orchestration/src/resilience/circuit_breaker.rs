//! Circuit breaker guarding one external dependency.
//!
//! The breaker counts consecutive failures while *closed*. Once the count
//! reaches the threshold the circuit *opens* and calls are rejected without
//! touching the dependency. The first call after the cooldown moves the
//! circuit to *half-open* and runs as a single trial; enough consecutive
//! trial successes close it again, any failure re-opens it.
//!
//! Transitions are evaluated lazily on each call. There is no background
//! timer.

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Circuit state for a single dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls are rejected until the cooldown expires.
    Open,
    /// Cooldown expired; one trial call at a time.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Breaker policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive half-open successes before the circuit closes.
    pub success_threshold: u32,
    /// Seconds after the last failure before a trial call is allowed.
    pub timeout_seconds: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_seconds: 60,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, success_threshold: u32, timeout_seconds: u64) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            timeout_seconds,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Outcome of a guarded call.
///
/// `Open` and `TrialInProgress` mean the dependency was never invoked;
/// `Failed` carries the dependency's own error.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    #[error("Circuit '{name}' is open, retry in {:.1}s", .retry_after.as_secs_f64())]
    Open { name: String, retry_after: Duration },

    #[error("Circuit '{name}' is half-open with a trial call in flight")]
    TrialInProgress { name: String },

    #[error("{0}")]
    Failed(E),
}

impl<E> CircuitError<E> {
    /// True when the breaker rejected the call without running it.
    pub fn is_rejected(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }

    /// The dependency error, if the dependency actually ran and failed.
    pub fn into_failure(self) -> Option<E> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Map the dependency error, keeping rejections as they are.
    pub fn map_failure<F>(self, f: impl FnOnce(E) -> F) -> CircuitError<F> {
        match self {
            Self::Open { name, retry_after } => CircuitError::Open { name, retry_after },
            Self::TrialInProgress { name } => CircuitError::TrialInProgress { name },
            Self::Failed(e) => CircuitError::Failed(f(e)),
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub time_in_state: Duration,
    /// Remaining cooldown while open.
    pub time_until_retry: Option<Duration>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    state_since: Instant,
    trial_in_flight: bool,
}

/// Failure-isolating wrapper around calls to one named dependency.
///
/// Shared by every caller targeting the dependency; counters are updated
/// under a lock that is never held across an await.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                last_failure_at: None,
                state_since: Instant::now(),
                trial_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Stored state. An open circuit whose cooldown has elapsed still
    /// reports `Open` until the next call moves it to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Run one invocation of `f` through the breaker.
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let trial = self.admit()?;
        let mut permit = Permit {
            breaker: self,
            trial,
            settled: false,
        };

        let outcome = f().await;
        permit.settled = true;
        match outcome {
            Ok(value) => {
                self.on_success(trial);
                Ok(value)
            }
            Err(e) => {
                self.on_failure(trial);
                Err(CircuitError::Failed(e))
            }
        }
    }

    /// Force the circuit closed and clear all counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        self.transition(&mut inner, CircuitState::Closed);
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure = None;
        inner.last_failure_at = None;
        info!(breaker = %self.name, "Circuit breaker manually reset");
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        let now = Instant::now();
        let time_until_retry = match inner.state {
            CircuitState::Open => Some(self.remaining_cooldown(&inner, now)),
            _ => None,
        };
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_at: inner.last_failure_at,
            time_in_state: now.saturating_duration_since(inner.state_since),
            time_until_retry,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remaining_cooldown(&self, inner: &BreakerInner, now: Instant) -> Duration {
        let elapsed = inner
            .last_failure
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_else(|| self.config.timeout());
        self.config.timeout().saturating_sub(elapsed)
    }

    /// Decide whether a call may proceed. Returns whether it is a trial.
    fn admit<E>(&self) -> Result<bool, CircuitError<E>> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let retry_after = self.remaining_cooldown(&inner, Instant::now());
                if !retry_after.is_zero() {
                    return Err(CircuitError::Open {
                        name: self.name.clone(),
                        retry_after,
                    });
                }
                self.transition(&mut inner, CircuitState::HalfOpen);
                inner.trial_in_flight = true;
                Ok(true)
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    warn!(breaker = %self.name, "Rejecting call, trial already in flight");
                    return Err(CircuitError::TrialInProgress {
                        name: self.name.clone(),
                    });
                }
                inner.trial_in_flight = true;
                Ok(true)
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen if trial => {
                inner.trial_in_flight = false;
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                    inner.failure_count = 0;
                    inner.success_count = 0;
                }
            }
            // Stale result from a call admitted before the circuit opened.
            _ => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());
        inner.failure_count = inner.failure_count.saturating_add(1);

        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                if !trial {
                    warn!(breaker = %self.name, "Non-trial failure while half-open");
                }
                inner.success_count = 0;
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        inner.trial_in_flight = false;
        if from == to {
            return;
        }
        inner.state = to;
        inner.state_since = Instant::now();
        if to == CircuitState::Open {
            error!(
                breaker = %self.name,
                from = %from,
                failures = inner.failure_count,
                "Circuit breaker opened"
            );
        } else {
            info!(breaker = %self.name, from = %from, to = %to, "Circuit breaker transition");
        }
    }
}

/// Admission for one call. Releases the trial slot if the call is dropped
/// before it completes.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.settled || !self.trial {
            return;
        }
        let mut inner = self.breaker.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("llm", CircuitBreakerConfig::new(3, 2, 10))
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        b.call(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        b.call(|| async { Ok::<_, &'static str>(()) }).await
    }

    #[test]
    fn test_default_policy() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.success_threshold, 2);
        assert_eq!(config.timeout_seconds, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_rejects_without_calling() {
        let b = breaker();
        for _ in 0..2 {
            assert!(matches!(fail(&b).await, Err(CircuitError::Failed("boom"))));
            assert_eq!(b.state(), CircuitState::Closed);
        }
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);

        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let err = b
            .call(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &'static str>(())
            })
            .await
            .unwrap_err();
        assert!(err.is_rejected());
        assert!(matches!(
            err,
            CircuitError::Open { retry_after, .. } if retry_after <= Duration::from_secs(10)
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_while_closed_resets_failures() {
        let b = breaker();
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        succeed(&b).await.unwrap();
        assert_eq!(b.snapshot().failure_count, 0);
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_recovers_after_success_threshold() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await.unwrap_err();
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert_eq!(b.snapshot().success_count, 1);

        succeed(&b).await.unwrap();
        let snap = b.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 0);
        assert_eq!(snap.success_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_and_restarts_cooldown() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await.unwrap_err();
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(matches!(succeed(&b).await, Err(CircuitError::Open { .. })));
        let retry = b.snapshot().time_until_retry.unwrap();
        assert_eq!(retry, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_in_half_open() {
        let b = Arc::new(breaker());
        for _ in 0..3 {
            fail(&b).await.unwrap_err();
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let b = Arc::clone(&b);
            tokio::spawn(async move {
                b.call(|| async move {
                    let _ = started_tx.send(());
                    release_rx.await.map_err(|_| "dropped")
                })
                .await
            })
        };
        started_rx.await.unwrap();

        assert!(matches!(
            succeed(&b).await,
            Err(CircuitError::TrialInProgress { .. })
        ));

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_releases_slot() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await.unwrap_err();
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        let hung = b.call(|| std::future::pending::<Result<(), &'static str>>());
        let timed_out = tokio::time::timeout(Duration::from_secs(1), hung).await;
        assert!(timed_out.is_err());

        succeed(&b).await.unwrap();
        assert_eq!(b.snapshot().success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_closes_circuit() {
        let b = breaker();
        for _ in 0..3 {
            fail(&b).await.unwrap_err();
        }
        b.reset();
        let snap = b.snapshot();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.failure_count, 0);
        assert!(snap.last_failure_at.is_none());
        succeed(&b).await.unwrap();
    }
}
