//! Circuit breaker protection for flaky external dependencies.
//!
//! A [`CircuitBreaker`] wraps calls to one dependency (the status API, the
//! model router, ...) and fails fast once that dependency keeps failing:
//!
//! - **Closed**: calls pass through; consecutive failures are counted.
//! - **Open**: calls are rejected without invoking the dependency until the
//!   configured timeout elapses.
//! - **Half-open**: trial calls are admitted; enough consecutive successes
//!   close the circuit, any failure opens it again.
//!
//! This is distinct from the run-level health ledger in [`crate::health`],
//! which counts failures across the whole run.
//!
//! # Example
//!
//! ```ignore
//! use phaseward::breaker::{CircuitBreaker, CircuitBreakerConfig};
//!
//! let breaker = CircuitBreaker::new("status-api", CircuitBreakerConfig::default());
//! let result = breaker.call(|| -> Result<u32, String> { Ok(42) });
//! assert_eq!(result.unwrap(), 42);
//! ```

mod circuit;
mod metrics;
mod registry;

pub use circuit::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerSnapshot,
    CircuitState,
};
pub use metrics::CircuitBreakerMetrics;
pub use registry::CircuitBreakerRegistry;
