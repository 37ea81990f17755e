//! Run-level health budget.
//!
//! Counts infrastructure failures, patch failures and total failed attempts
//! for one run. The counters are shared by every worker of the run; each
//! qualifying event must increment its counter exactly once, so all updates
//! go through a single mutex and readers only ever see a copied snapshot.

mod outcome;
mod tracker;

pub use outcome::{status_to_outcome, FailureOutcome};
pub use tracker::{HealthBudget, HealthBudgetConfig, HealthBudgetTracker};
