//! Health budget counters.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Configuration for the run-level health budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthBudgetConfig {
    /// Maximum failed attempts across the run (0 = unlimited)
    pub total_cap: u32,
}

impl Default for HealthBudgetConfig {
    fn default() -> Self {
        Self { total_cap: 25 }
    }
}

impl HealthBudgetConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the total failure cap.
    pub fn with_total_cap(mut self, cap: u32) -> Self {
        self.total_cap = cap;
        self
    }
}

/// Immutable snapshot of the health counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthBudget {
    pub infra_failure_count: u32,
    pub patch_failure_count: u32,
    pub total_failures: u32,
    pub total_cap: u32,
}

impl HealthBudget {
    /// Failures left before the cap (`None` when unlimited).
    pub fn remaining(&self) -> Option<u32> {
        (self.total_cap > 0).then(|| self.total_cap.saturating_sub(self.total_failures))
    }

    /// Whether the cap has been reached.
    pub fn is_exhausted(&self) -> bool {
        self.total_cap > 0 && self.total_failures >= self.total_cap
    }
}

/// Thread-safe health budget for one run.
#[derive(Debug, Default)]
pub struct HealthBudgetTracker {
    state: Mutex<HealthBudget>,
}

impl HealthBudgetTracker {
    pub fn new(config: HealthBudgetConfig) -> Self {
        Self {
            state: Mutex::new(HealthBudget {
                total_cap: config.total_cap,
                ..HealthBudget::default()
            }),
        }
    }

    fn update<F: FnOnce(&mut HealthBudget)>(&self, f: F) -> HealthBudget {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state);
        *state
    }

    /// Record an infrastructure failure that exhausted its local retries.
    pub fn increment_infra_failures(&self) -> HealthBudget {
        let snapshot = self.update(|s| s.infra_failure_count += 1);
        debug!(
            infra_failures = snapshot.infra_failure_count,
            "Recorded infrastructure failure"
        );
        snapshot
    }

    /// Record a patch application failure.
    pub fn increment_patch_failures(&self) -> HealthBudget {
        let snapshot = self.update(|s| s.patch_failure_count += 1);
        debug!(
            patch_failures = snapshot.patch_failure_count,
            "Recorded patch failure"
        );
        snapshot
    }

    /// Record one failed attempt.
    pub fn increment_total_failures(&self) -> HealthBudget {
        let snapshot = self.update(|s| s.total_failures += 1);
        if snapshot.is_exhausted() {
            warn!(
                total_failures = snapshot.total_failures,
                total_cap = snapshot.total_cap,
                "Health budget exhausted"
            );
        }
        snapshot
    }

    /// Copy of the current counters.
    pub fn snapshot(&self) -> HealthBudget {
        self.update(|_| {})
    }

    /// Whether total failures reached the cap.
    pub fn is_exhausted(&self) -> bool {
        self.snapshot().is_exhausted()
    }
}
