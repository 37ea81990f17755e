//! External collaborators consumed by the state machine.
//!
//! Each collaborator is injected as an `Arc<dyn Trait>`. Where a sensible
//! default exists there is a no-op implementation, so a state machine can be
//! built with only a [`PhaseRunner`].

use async_trait::async_trait;

use crate::error::CollaboratorError;
use crate::phase::types::{ModelSelection, Phase, PhaseOutcome, PhaseStatus};

/// Builder, auditor and CI for a phase.
#[async_trait]
pub trait PhaseRunner: Send + Sync {
    /// Produce and apply the phase's change.
    async fn build(&self, phase: &Phase) -> Result<PhaseOutcome, CollaboratorError>;

    /// Quality-gate review of the built change.
    async fn audit(&self, _phase: &Phase) -> Result<PhaseOutcome, CollaboratorError> {
        Ok(PhaseOutcome::success())
    }

    /// Continuous-integration run.
    async fn ci(&self, _phase: &Phase) -> Result<PhaseOutcome, CollaboratorError> {
        Ok(PhaseOutcome::success())
    }
}

/// Persistence boundary for phase statuses.
///
/// Receives only the external vocabulary: `BLOCKED` is never passed in.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn update_status(&self, run_id: &str, phase_id: &str, status: PhaseStatus) -> bool;
}

/// Chooses a stronger model after the policy returns `ESCALATE_MODEL`.
#[async_trait]
pub trait ModelEscalator: Send + Sync {
    async fn escalate(&self, phase: &Phase) -> Result<ModelSelection, CollaboratorError>;
}

/// Refreshes the run summary whenever a phase reaches a terminal status.
#[async_trait]
pub trait SummaryRefresher: Send + Sync {
    async fn refresh(&self, run_id: &str) -> Result<(), CollaboratorError>;
}

/// One-shot correction of a patch that failed to apply.
#[async_trait]
pub trait PatchCorrector: Send + Sync {
    /// Returns `Ok(None)` when no correction is attempted.
    async fn correct(
        &self,
        phase: &Phase,
        failed: &PhaseOutcome,
    ) -> Result<Option<PhaseOutcome>, CollaboratorError>;
}

/// Narrows a phase's scope after the policy returns `REDUCE_SCOPE`.
pub trait ScopeReducer: Send + Sync {
    fn reduce(&self, phase: &Phase) -> Vec<String>;
}

/// Reporter that accepts every update without persisting it.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStatusReporter;

#[async_trait]
impl StatusReporter for NoopStatusReporter {
    async fn update_status(&self, _run_id: &str, _phase_id: &str, _status: PhaseStatus) -> bool {
        true
    }
}

/// Escalator used when no model router is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopModelEscalator;

#[async_trait]
impl ModelEscalator for NoopModelEscalator {
    async fn escalate(&self, _phase: &Phase) -> Result<ModelSelection, CollaboratorError> {
        Err(CollaboratorError::Other(
            "no model escalator configured".to_string(),
        ))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSummaryRefresher;

#[async_trait]
impl SummaryRefresher for NoopSummaryRefresher {
    async fn refresh(&self, _run_id: &str) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// Corrector that never attempts a correction.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPatchCorrector;

#[async_trait]
impl PatchCorrector for NoopPatchCorrector {
    async fn correct(
        &self,
        _phase: &Phase,
        _failed: &PhaseOutcome,
    ) -> Result<Option<PhaseOutcome>, CollaboratorError> {
        Ok(None)
    }
}

/// Keeps the first half of the scope prefixes, at least one.
#[derive(Debug, Clone, Copy, Default)]
pub struct HalveScope;

impl ScopeReducer for HalveScope {
    fn reduce(&self, phase: &Phase) -> Vec<String> {
        let keep = phase.scope.len().div_ceil(2).max(1);
        phase.scope.iter().take(keep).cloned().collect()
    }
}
