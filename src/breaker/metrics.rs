//! Circuit breaker call and transition counters.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::circuit::CircuitState;

/// Lifetime counters for a single breaker. All counts only ever increase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Calls that were admitted and actually invoked the protected operation.
    pub total_calls: u64,
    /// Admitted calls that succeeded.
    pub successful_calls: u64,
    /// Admitted calls that failed.
    pub failed_calls: u64,
    /// Calls rejected while the circuit was open.
    pub rejected_calls: u64,
    /// Transition counts keyed by `"FROM->TO"`.
    pub state_transitions: BTreeMap<String, u64>,
    /// When the state last changed.
    pub last_state_change: Option<DateTime<Utc>>,
}

impl CircuitBreakerMetrics {
    pub(crate) fn record_transition(&mut self, from: CircuitState, to: CircuitState) {
        let key = format!("{}->{}", from, to);
        *self.state_transitions.entry(key).or_insert(0) += 1;
        self.last_state_change = Some(Utc::now());
    }

    /// Number of recorded transitions from `from` to `to`.
    pub fn transitions(&self, from: CircuitState, to: CircuitState) -> u64 {
        self.state_transitions
            .get(&format!("{}->{}", from, to))
            .copied()
            .unwrap_or(0)
    }

    /// Failure rate over admitted calls (0.0 when nothing ran yet).
    pub fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.failed_calls as f64 / self.total_calls as f64
        }
    }
}
