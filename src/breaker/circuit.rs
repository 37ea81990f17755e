//! Three-state circuit breaker.

use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use super::metrics::CircuitBreakerMetrics;
use crate::config::duration_secs;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow through normally.
    Closed,
    /// Calls are rejected without touching the dependency.
    Open,
    /// Trial calls are admitted to probe recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(label)
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
    /// How long the circuit stays open before admitting a trial call.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// How long a half-open window may last without closing before it reopens.
    #[serde(with = "duration_secs")]
    pub half_open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            half_open_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold (minimum 1).
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the success threshold (minimum 1).
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// Set the open-state timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the half-open window.
    pub fn with_half_open_timeout(mut self, timeout: Duration) -> Self {
        self.half_open_timeout = timeout;
        self
    }
}

/// Error returned from a breaker-protected call.
#[derive(Error, Debug, PartialEq)]
pub enum CircuitBreakerError<E> {
    /// The circuit is open; the operation was not invoked.
    #[error("Circuit breaker '{name}' is open")]
    Open { name: String },

    /// The operation ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    /// Whether the call was rejected without running.
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitBreakerError::Open { .. })
    }

    /// The wrapped operation error, if the operation ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitBreakerError::Inner(err) => Some(err),
            CircuitBreakerError::Open { .. } => None,
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    half_opened_at: Option<Instant>,
    metrics: CircuitBreakerMetrics,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            opened_at: None,
            half_opened_at: None,
            metrics: CircuitBreakerMetrics::default(),
        }
    }

    fn transition(&mut self, name: &str, to: CircuitState) {
        let from = self.state;
        if from == to {
            return;
        }
        self.state = to;
        match to {
            CircuitState::Open => {
                self.opened_at = Some(Instant::now());
                self.half_opened_at = None;
                self.success_count = 0;
            }
            CircuitState::HalfOpen => {
                self.half_opened_at = Some(Instant::now());
                self.success_count = 0;
            }
            CircuitState::Closed => {
                self.opened_at = None;
                self.half_opened_at = None;
                self.failure_count = 0;
                self.success_count = 0;
            }
        }
        self.metrics.record_transition(from, to);
        if to == CircuitState::Open {
            warn!(breaker = %name, %from, %to, "Circuit breaker opened");
        } else {
            debug!(breaker = %name, %from, %to, "Circuit breaker state change");
        }
    }
}

/// Thread-safe circuit breaker protecting a single dependency.
///
/// One lock guards state and counters; it is never held while the protected
/// operation runs.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    /// Name of the protected dependency.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Breaker configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state. Does not advance timers; see [`CircuitBreaker::call`].
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Snapshot of state and counters.
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.lock();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_time: inner.last_failure_time,
        }
    }

    /// Copy of the lifetime metrics.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        self.lock().metrics.clone()
    }

    /// Force the breaker back to closed. Metrics are kept.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.transition(&self.name, CircuitState::Closed);
        inner.failure_count = 0;
        inner.success_count = 0;
    }

    /// Decide whether a call may proceed, advancing open/half-open timers.
    fn admit(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {}
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed < self.config.timeout {
                    inner.metrics.rejected_calls += 1;
                    return false;
                }
                inner.transition(&self.name, CircuitState::HalfOpen);
            }
            CircuitState::HalfOpen => {
                let elapsed = inner
                    .half_opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.half_open_timeout {
                    inner.transition(&self.name, CircuitState::Open);
                    inner.metrics.rejected_calls += 1;
                    return false;
                }
            }
        }
        inner.metrics.total_calls += 1;
        true
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        inner.metrics.successful_calls += 1;
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.transition(&self.name, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.metrics.failed_calls += 1;
        inner.last_failure_time = Some(Utc::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.transition(&self.name, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.failure_count += 1;
                inner.transition(&self.name, CircuitState::Open);
            }
            CircuitState::Open => inner.failure_count += 1,
        }
    }

    fn rejected<E>(&self) -> CircuitBreakerError<E> {
        debug!(breaker = %self.name, "Call rejected by open circuit");
        CircuitBreakerError::Open {
            name: self.name.clone(),
        }
    }

    /// Run a synchronous operation through the breaker.
    pub fn call<F, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        if !self.admit() {
            return Err(self.rejected());
        }
        match operation() {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    /// Run an asynchronous operation through the breaker.
    pub async fn call_async<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.admit() {
            return Err(self.rejected());
        }
        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::thread;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_failure_threshold(3)
            .with_success_threshold(2)
            .with_timeout(Duration::from_millis(50))
            .with_half_open_timeout(Duration::from_secs(10))
    }

    fn fail(breaker: &CircuitBreaker) {
        let _ = breaker.call(|| -> Result<(), &str> { Err("boom") });
    }

    fn trip(breaker: &CircuitBreaker) {
        for _ in 0..breaker.config().failure_threshold {
            fail(breaker);
        }
    }

    #[test]
    fn test_starts_closed_and_passes_values() {
        let breaker = CircuitBreaker::new("dep", fast_config());
        assert_eq!(breaker.state(), CircuitState::Closed);

        let value = breaker.call(|| -> Result<u32, &str> { Ok(7) });
        assert_eq!(value, Ok(7));
        assert_eq!(breaker.metrics().successful_calls, 1);
    }

    #[test]
    fn test_opens_after_failure_threshold() {
        let breaker = CircuitBreaker::new("dep", fast_config());
        fail(&breaker);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.snapshot().failure_count, 3);
        assert!(breaker.snapshot().last_failure_time.is_some());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new("dep", fast_config());
        fail(&breaker);
        fail(&breaker);
        let _ = breaker.call(|| -> Result<(), &str> { Ok(()) });
        fail(&breaker);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_rejects_without_invoking() {
        let breaker = CircuitBreaker::new("dep", fast_config());
        trip(&breaker);
        let calls_before = breaker.metrics().total_calls;

        let invoked = Cell::new(false);
        let result = breaker.call(|| -> Result<(), &str> {
            invoked.set(true);
            Ok(())
        });

        assert!(!invoked.get());
        assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
        let metrics = breaker.metrics();
        assert_eq!(metrics.rejected_calls, 1);
        assert_eq!(metrics.total_calls, calls_before);
        assert_eq!(metrics.failed_calls, 3);
    }

    #[test]
    fn test_timeout_moves_to_half_open_before_executing() {
        let breaker = CircuitBreaker::new("dep", fast_config());
        trip(&breaker);
        thread::sleep(Duration::from_millis(70));

        let seen = Cell::new(None);
        let result = breaker.call(|| -> Result<(), &str> {
            seen.set(Some(breaker.state()));
            Ok(())
        });

        assert!(result.is_ok());
        assert_eq!(seen.get(), Some(CircuitState::HalfOpen));
        assert_eq!(
            breaker
                .metrics()
                .transitions(CircuitState::Open, CircuitState::HalfOpen),
            1
        );
    }

    #[test]
    fn test_half_open_successes_close_circuit() {
        let breaker = CircuitBreaker::new("dep", fast_config());
        trip(&breaker);
        thread::sleep(Duration::from_millis(70));

        let _ = breaker.call(|| -> Result<(), &str> { Ok(()) });
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let _ = breaker.call(|| -> Result<(), &str> { Ok(()) });
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().failure_count, 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("dep", fast_config());
        trip(&breaker);
        thread::sleep(Duration::from_millis(70));

        let _ = breaker.call(|| -> Result<(), &str> { Ok(()) });
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(
            breaker
                .metrics()
                .transitions(CircuitState::HalfOpen, CircuitState::Open),
            1
        );
    }

    #[test]
    fn test_half_open_window_expires() {
        let config = fast_config().with_half_open_timeout(Duration::from_millis(30));
        let breaker = CircuitBreaker::new("dep", config);
        trip(&breaker);
        thread::sleep(Duration::from_millis(70));

        let _ = breaker.call(|| -> Result<(), &str> { Ok(()) });
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        thread::sleep(Duration::from_millis(40));

        let invoked = Cell::new(false);
        let result = breaker.call(|| -> Result<(), &str> {
            invoked.set(true);
            Ok(())
        });
        assert!(!invoked.get());
        assert!(result.unwrap_err().is_rejected());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_reset_closes() {
        let breaker = CircuitBreaker::new("dep", fast_config());
        trip(&breaker);
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().failed_calls, 3);
    }

    #[tokio::test]
    async fn test_call_async() {
        let breaker = CircuitBreaker::new("dep", fast_config());
        let ok = breaker
            .call_async(|| async { Ok::<_, String>("done") })
            .await;
        assert_eq!(ok, Ok("done"));

        for _ in 0..3 {
            let _ = breaker
                .call_async(|| async { Err::<(), _>("down".to_string()) })
                .await;
        }
        let rejected = breaker.call_async(|| async { Ok::<_, String>(1) }).await;
        assert!(rejected.unwrap_err().is_rejected());
    }

    #[test]
    fn test_inner_error_is_returned() {
        let breaker = CircuitBreaker::new("dep", fast_config());
        let err = breaker
            .call(|| -> Result<(), &str> { Err("nope") })
            .unwrap_err();
        assert_eq!(err.into_inner(), Some("nope"));
    }
}
