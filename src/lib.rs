//! Decision core for autonomous multi-phase build runs.
//!
//! A run is a queue of [`Phase`]s. The [`PhaseStateMachine`] drives each
//! phase through build, quality gate and CI using injected collaborators,
//! counts failures against a run-wide [`HealthBudgetTracker`], asks the
//! [`ApproachFlawDetector`] whether repeated failures share a root cause and
//! applies [`StuckHandlingPolicy`] decisions when a phase is stuck. The
//! [`ParallelExecutionScheduler`] runs scope-isolated phases concurrently.
//!
//! Calls to external services go through named [`CircuitBreaker`]s.

pub mod breaker;
pub mod budget;
pub mod config;
pub mod error;
pub mod evidence;
pub mod flaw;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod parallel;
pub mod phase;
pub mod policy;

pub use breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry,
    CircuitState,
};
pub use budget::{BudgetSnapshot, RunBudgetConfig, SharedRunBudget};
pub use config::OrchestratorConfig;
pub use error::{CollaboratorError, OrchestratorError, OrchestratorResult};
pub use evidence::{generate_run_id, EvidenceWriter};
pub use flaw::{ApproachFlawDetector, ErrorPattern, ErrorRecord, FlawDetectorConfig};
pub use health::{status_to_outcome, FailureOutcome, HealthBudget, HealthBudgetTracker};
pub use logging::LoggingConfig;
pub use metrics::{RunMetrics, RunMetricsCollector, RunMetricsStore};
pub use parallel::{
    Dispatch, IsolationPolicy, ParallelExecutionScheduler, RunReport, SchedulerConfig,
    ScopeIsolationChecker,
};
pub use phase::{
    LoopState, ModelSelection, Phase, PhaseExecution, PhaseOutcome, PhaseRunner,
    PhaseStateMachine, PhaseStatus, StateMachineConfig,
};
pub use policy::{StuckDecision, StuckHandlingPolicy, StuckReason, StuckResolutionDecision};
