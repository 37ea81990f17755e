//! Named breaker registry, one breaker per protected dependency.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::circuit::{CircuitBreaker, CircuitBreakerConfig};
use super::metrics::CircuitBreakerMetrics;

/// Hands out a shared [`CircuitBreaker`] per dependency name.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: Mutex<BTreeMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry whose breakers use `default_config`.
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: Mutex::new(BTreeMap::new()),
        }
    }

    /// Get the breaker for `name`, creating it with the default config.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, self.default_config.clone())
    }

    /// Get the breaker for `name`, creating it with `config` if missing.
    pub fn get_or_create_with(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    /// Metrics for every registered breaker, keyed by name.
    pub fn all_metrics(&self) -> BTreeMap<String, CircuitBreakerMetrics> {
        let breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakers
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.metrics()))
            .collect()
    }

    /// Reset every registered breaker to closed.
    pub fn reset_all(&self) {
        let breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for breaker in breakers.values() {
            breaker.reset();
        }
    }
}
