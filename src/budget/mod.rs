//! Run budget management.
//!
//! Tracks the time, token and cost budget of a run and turns it into the
//! remaining-budget fraction consulted by the stuck-handling policy.
//!
//! # Example
//!
//! ```ignore
//! use phaseward::budget::{RunBudgetConfig, SharedRunBudget};
//!
//! let budget = SharedRunBudget::new(RunBudgetConfig::default().with_total_tokens(500_000));
//! budget.record_tokens("P1", 12_000);
//!
//! if budget.remaining_fraction() <= 0.15 {
//!     // near exhaustion
//! }
//! ```

mod config;
mod tracker;

pub use config::{RunBudgetConfig, TokenCost};
pub use tracker::{BudgetSnapshot, BudgetStatus, PhaseBudget, RunBudget, SharedRunBudget};
