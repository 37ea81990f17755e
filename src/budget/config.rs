//! Run budget configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_secs;

/// Cost per 1000 tokens for the generation model.
/// These are approximate and can be configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenCost {
    /// Cost per 1K tokens (in cents)
    pub cost_per_1k: f64,
    /// Model name for reference
    pub model_name: String,
}

impl Default for TokenCost {
    fn default() -> Self {
        Self {
            cost_per_1k: 0.9,
            model_name: "default".to_string(),
        }
    }
}

impl TokenCost {
    pub fn new(model_name: impl Into<String>, cost_per_1k: f64) -> Self {
        Self {
            cost_per_1k: cost_per_1k.max(0.0),
            model_name: model_name.into(),
        }
    }

    /// Calculate cost in cents for a token count.
    pub fn calculate_cost(&self, tokens: u64) -> f64 {
        (tokens as f64 / 1000.0) * self.cost_per_1k
    }
}

/// Configuration for the run's time, token and cost budget.
///
/// Every limit uses 0 for "unlimited". The remaining fraction handed to the
/// stuck-handling policy is the tightest of the enabled limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunBudgetConfig {
    /// Maximum tokens across all phases (0 = unlimited)
    pub total_tokens: u64,

    /// Maximum cost in cents (0 = unlimited)
    pub max_cost_cents: f64,

    /// Wall-clock budget of the run (zero = unlimited)
    #[serde(with = "duration_secs")]
    pub time_budget: Duration,

    /// Warning threshold as fraction of budget used (0.0 - 1.0)
    pub warning_threshold: f64,

    /// Critical threshold as fraction of budget used (0.0 - 1.0)
    pub critical_threshold: f64,

    /// Cost settings for the model being used
    pub cost_settings: TokenCost,
}

impl Default for RunBudgetConfig {
    fn default() -> Self {
        Self {
            total_tokens: 2_000_000,
            max_cost_cents: 0.0,
            time_budget: Duration::ZERO,
            warning_threshold: 0.7,
            critical_threshold: 0.85,
            cost_settings: TokenCost::default(),
        }
    }
}

impl RunBudgetConfig {
    /// Create a new budget config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unlimited budget config (no enforcement).
    pub fn unlimited() -> Self {
        Self {
            total_tokens: 0,
            max_cost_cents: 0.0,
            time_budget: Duration::ZERO,
            warning_threshold: 1.0,
            critical_threshold: 1.0,
            cost_settings: TokenCost::default(),
        }
    }

    /// Set the total token budget.
    pub fn with_total_tokens(mut self, tokens: u64) -> Self {
        self.total_tokens = tokens;
        self
    }

    /// Set the maximum cost in cents.
    pub fn with_max_cost(mut self, cents: f64) -> Self {
        self.max_cost_cents = cents.max(0.0);
        self
    }

    /// Set the wall-clock budget.
    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = budget;
        self
    }

    /// Set the warning threshold.
    pub fn with_warning_threshold(mut self, threshold: f64) -> Self {
        self.warning_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Set the critical threshold.
    pub fn with_critical_threshold(mut self, threshold: f64) -> Self {
        self.critical_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Set the cost settings.
    pub fn with_cost_settings(mut self, cost: TokenCost) -> Self {
        self.cost_settings = cost;
        self
    }

    /// Check if any limit is enabled.
    pub fn is_enabled(&self) -> bool {
        self.total_tokens > 0 || self.max_cost_cents > 0.0 || !self.time_budget.is_zero()
    }
}
