use std::env;

use serde::{Deserialize, Serialize};

/// Environment variable for evidence retention period (days).
pub const RETENTION_ENV_VAR: &str = "PHASEWARD_EVIDENCE_RETENTION_DAYS";

/// Default retention period in days.
pub const DEFAULT_RETENTION_DAYS: u64 = 30;

/// Configuration for evidence storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceStoreConfig {
    /// Whether the orchestrator writes evidence at all.
    pub enabled: bool,
    /// Retention period in days (0 disables retention pruning).
    pub retention_days: u64,
}

impl EvidenceStoreConfig {
    /// Create a new config with the specified retention period.
    pub fn new(retention_days: u64) -> Self {
        Self {
            enabled: true,
            retention_days,
        }
    }

    /// Build config from environment variables.
    pub fn from_env() -> Self {
        let retention_days = env::var(RETENTION_ENV_VAR)
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_RETENTION_DAYS);
        Self::new(retention_days)
    }

    /// Enable or disable evidence writing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

impl Default for EvidenceStoreConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
