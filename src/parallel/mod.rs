//! Scope-isolated parallel dispatch of queued phases.

pub mod isolation;
pub mod scheduler;

pub use isolation::{
    prefixes_overlap, scopes_overlap, IsolationChecker, IsolationLayer, IsolationPolicy,
    ScopeIsolationChecker,
};
pub use scheduler::{
    BatchPlan, Dispatch, ParallelExecutionScheduler, ParallelStats, RunReport, SchedulerConfig,
};
