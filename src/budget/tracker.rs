//! Run budget tracking.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use super::config::RunBudgetConfig;

/// Status of budget usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BudgetStatus {
    /// Under warning threshold, all good
    Ok,
    /// Approaching budget limit (over warning threshold)
    Warning,
    /// Near budget limit (over critical threshold)
    Critical,
    /// Budget exceeded
    Exceeded,
}

impl BudgetStatus {
    /// Check if warnings should be emitted.
    pub fn should_warn(&self) -> bool {
        matches!(self, BudgetStatus::Warning | BudgetStatus::Critical)
    }
}

impl fmt::Display for BudgetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BudgetStatus::Ok => "OK",
            BudgetStatus::Warning => "WARNING",
            BudgetStatus::Critical => "CRITICAL",
            BudgetStatus::Exceeded => "EXCEEDED",
        };
        f.write_str(label)
    }
}

/// Tokens charged to a single phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseBudget {
    pub phase_id: String,
    /// Total tokens charged
    pub tokens: u64,
    /// Number of attempts charged
    pub attempts: u32,
}

impl PhaseBudget {
    pub fn new(phase_id: impl Into<String>) -> Self {
        Self {
            phase_id: phase_id.into(),
            ..Self::default()
        }
    }

    /// Average tokens per charged attempt.
    pub fn avg_tokens_per_attempt(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.tokens as f64 / self.attempts as f64
        }
    }
}

/// Main run budget tracker.
#[derive(Debug, Clone)]
pub struct RunBudget {
    config: RunBudgetConfig,
    total_tokens: u64,
    total_cost: f64,
    phase_budgets: HashMap<String, PhaseBudget>,
    started_at: Instant,
}

impl RunBudget {
    /// Create a new run budget tracker; the clock starts now.
    pub fn new(config: RunBudgetConfig) -> Self {
        Self {
            config,
            total_tokens: 0,
            total_cost: 0.0,
            phase_budgets: HashMap::new(),
            started_at: Instant::now(),
        }
    }

    /// Charge one attempt's tokens to a phase.
    pub fn record_tokens(&mut self, phase_id: &str, tokens: u64) {
        self.total_tokens = self.total_tokens.saturating_add(tokens);
        self.total_cost += self.config.cost_settings.calculate_cost(tokens);
        let phase = self
            .phase_budgets
            .entry(phase_id.to_string())
            .or_insert_with(|| PhaseBudget::new(phase_id));
        phase.tokens = phase.tokens.saturating_add(tokens);
        phase.attempts += 1;
    }

    /// Get total tokens used.
    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }

    /// Get total cost (cents).
    pub fn total_cost(&self) -> f64 {
        self.total_cost
    }

    /// Wall-clock time since the run started.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn token_usage(&self) -> Option<f64> {
        (self.config.total_tokens > 0)
            .then(|| self.total_tokens as f64 / self.config.total_tokens as f64)
    }

    fn cost_usage(&self) -> Option<f64> {
        (self.config.max_cost_cents > 0.0).then(|| self.total_cost / self.config.max_cost_cents)
    }

    fn time_usage(&self) -> Option<f64> {
        (!self.config.time_budget.is_zero())
            .then(|| self.elapsed().as_secs_f64() / self.config.time_budget.as_secs_f64())
    }

    /// Fraction of the tightest enabled budget used so far (0.0 when unlimited).
    pub fn usage_fraction(&self) -> f64 {
        [self.token_usage(), self.cost_usage(), self.time_usage()]
            .into_iter()
            .flatten()
            .fold(0.0_f64, f64::max)
    }

    /// Remaining fraction of the tightest enabled budget, always in [0.0, 1.0].
    pub fn remaining_fraction(&self) -> f64 {
        let remaining = 1.0 - self.usage_fraction();
        if remaining.is_nan() {
            0.0
        } else {
            remaining.clamp(0.0, 1.0)
        }
    }

    /// Compute status from usage.
    pub fn status(&self) -> BudgetStatus {
        let usage = self.usage_fraction();
        if usage >= 1.0 {
            BudgetStatus::Exceeded
        } else if usage >= self.config.critical_threshold {
            BudgetStatus::Critical
        } else if usage >= self.config.warning_threshold {
            BudgetStatus::Warning
        } else {
            BudgetStatus::Ok
        }
    }

    /// Whether any enabled budget is used up.
    pub fn is_exhausted(&self) -> bool {
        self.status() == BudgetStatus::Exceeded
    }

    /// Per-phase charges.
    pub fn phase_budget(&self, phase_id: &str) -> Option<&PhaseBudget> {
        self.phase_budgets.get(phase_id)
    }

    /// Get the configuration.
    pub fn config(&self) -> &RunBudgetConfig {
        &self.config
    }

    /// Point-in-time view of the budget.
    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            total_tokens: self.total_tokens,
            total_cost_cents: self.total_cost,
            elapsed_secs: self.elapsed().as_secs_f64(),
            token_limit: self.config.total_tokens,
            cost_limit_cents: self.config.max_cost_cents,
            time_limit_secs: self.config.time_budget.as_secs_f64(),
            remaining_fraction: self.remaining_fraction(),
            status: self.status(),
            phases_tracked: self.phase_budgets.len(),
        }
    }
}

/// Snapshot of budget usage, attached to STOP decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub total_tokens: u64,
    pub total_cost_cents: f64,
    pub elapsed_secs: f64,
    pub token_limit: u64,
    pub cost_limit_cents: f64,
    pub time_limit_secs: f64,
    pub remaining_fraction: f64,
    pub status: BudgetStatus,
    pub phases_tracked: usize,
}

impl fmt::Display for BudgetSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "budget {:.0}% remaining [{}]",
            self.remaining_fraction * 100.0,
            self.status
        )?;
        if self.token_limit > 0 {
            write!(f, ", tokens {}/{}", self.total_tokens, self.token_limit)?;
        } else {
            write!(f, ", tokens {}", self.total_tokens)?;
        }
        if self.cost_limit_cents > 0.0 {
            write!(
                f,
                ", cost ${:.2}/${:.2}",
                self.total_cost_cents / 100.0,
                self.cost_limit_cents / 100.0
            )?;
        }
        if self.time_limit_secs > 0.0 {
            write!(
                f,
                ", time {:.0}s/{:.0}s",
                self.elapsed_secs, self.time_limit_secs
            )?;
        }
        Ok(())
    }
}

/// Thread-safe run budget shared by concurrently executing phases.
#[derive(Debug, Clone)]
pub struct SharedRunBudget {
    inner: Arc<RwLock<RunBudget>>,
}

impl SharedRunBudget {
    /// Create a new shared run budget.
    pub fn new(config: RunBudgetConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RunBudget::new(config))),
        }
    }

    /// Charge one attempt's tokens to a phase and return the resulting status.
    pub fn record_tokens(&self, phase_id: &str, tokens: u64) -> BudgetStatus {
        let mut budget = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        budget.record_tokens(phase_id, tokens);
        budget.status()
    }

    /// Remaining fraction in [0.0, 1.0].
    pub fn remaining_fraction(&self) -> f64 {
        self.inner
            .read()
            .map(|b| b.remaining_fraction())
            .unwrap_or(0.0)
    }

    /// Whether any enabled budget is used up.
    pub fn is_exhausted(&self) -> bool {
        self.inner.read().map(|b| b.is_exhausted()).unwrap_or(true)
    }

    /// Point-in-time view of the budget.
    pub fn snapshot(&self) -> BudgetSnapshot {
        let budget = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        budget.snapshot()
    }
}
