//! Phase model and lifecycle.
//!
//! A phase is one unit of scoped work. [`PhaseStateMachine`] owns every phase
//! of a run and drives each attempt through build, quality gate and CI,
//! then applies the stuck-handling policy when attempts keep failing.
//!
//! ```text
//! QUEUED ─► EXECUTING ─► GATE ─► CI_RUNNING ─► COMPLETE
//!               │          │          │
//!               ▼          ▼          ▼
//!        PATCH_FAILED   BLOCKED    CI_FAILED   (and FAILED, DVF)
//!               └──────────┴──────────┴──► QUEUED | FAILED | SKIPPED
//! ```

mod hooks;
mod state_machine;
mod types;

pub use hooks::{
    HalveScope, ModelEscalator, NoopModelEscalator, NoopPatchCorrector, NoopStatusReporter,
    NoopSummaryRefresher, PatchCorrector, PhaseRunner, ScopeReducer, StatusReporter,
    SummaryRefresher,
};
pub use state_machine::{
    PhaseExecution, PhaseStateMachine, PhaseStateMachineBuilder, RunAbort, StateMachineConfig,
    ESCALATION_BREAKER, INFRA_ERROR_TYPE, STATUS_BREAKER, STUCK_CONSECUTIVE_FAILURES,
};
pub use types::{LoopState, ModelSelection, Phase, PhaseOutcome, PhaseStatus};
