//! Phase lifecycle, attempt pipeline and stuck-decision application.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::breaker::CircuitBreakerRegistry;
use crate::budget::{RunBudgetConfig, SharedRunBudget};
use crate::config::duration_secs;
use crate::error::{CollaboratorError, OrchestratorError, OrchestratorResult};
use crate::evidence::EvidenceWriter;
use crate::flaw::{ApproachFlawDetector, FlawDetectorConfig};
use crate::health::{FailureOutcome, HealthBudget, HealthBudgetConfig, HealthBudgetTracker};
use crate::metrics::RunMetricsCollector;
use crate::phase::hooks::{
    HalveScope, ModelEscalator, NoopModelEscalator, NoopPatchCorrector, NoopStatusReporter,
    NoopSummaryRefresher, PatchCorrector, PhaseRunner, ScopeReducer, StatusReporter,
    SummaryRefresher,
};
use crate::phase::types::{Phase, PhaseOutcome, PhaseStatus};
use crate::policy::{
    StuckDecision, StuckHandlingPolicy, StuckReason, StuckResolutionDecision, MAX_ESCALATIONS,
};

/// Breaker name guarding the status API.
pub const STATUS_BREAKER: &str = "status-api";

/// Breaker name guarding the model router.
pub const ESCALATION_BREAKER: &str = "model-router";

/// Consecutive failed attempts that make a phase stuck.
pub const STUCK_CONSECUTIVE_FAILURES: u32 = 2;

/// Error type recorded when local infrastructure retries run out.
pub const INFRA_ERROR_TYPE: &str = "infra";

const COMPLETE_REASON: &str = "build, gate and CI passed";

/// Configuration for the phase state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateMachineConfig {
    /// Attempts a phase may start before it fails terminally
    pub max_iterations_per_phase: u32,
    /// Local retries of a transient infrastructure error per step
    pub infra_retry_limit: u32,
    /// Pause between infrastructure retries
    #[serde(with = "duration_secs")]
    pub infra_retry_backoff: Duration,
    /// Outcome error types treated as transient infrastructure errors
    pub infra_error_types: Vec<String>,
    /// Attempts of the force-mark-failed status report
    pub status_retry_attempts: u32,
    /// Pause between force-mark-failed attempts
    #[serde(with = "duration_secs")]
    pub status_retry_delay: Duration,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            max_iterations_per_phase: 6,
            infra_retry_limit: 2,
            infra_retry_backoff: Duration::from_secs(2),
            infra_error_types: vec![
                INFRA_ERROR_TYPE.to_string(),
                "timeout".to_string(),
                "rate_limit".to_string(),
                "network".to_string(),
            ],
            status_retry_attempts: 3,
            status_retry_delay: Duration::from_secs(1),
        }
    }
}

impl StateMachineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-phase attempt limit (at least 1).
    pub fn with_max_iterations(mut self, iterations: u32) -> Self {
        self.max_iterations_per_phase = iterations.max(1);
        self
    }

    /// Set the local infrastructure retry limit.
    pub fn with_infra_retry_limit(mut self, limit: u32) -> Self {
        self.infra_retry_limit = limit;
        self
    }

    /// Set the pause between infrastructure retries.
    pub fn with_infra_retry_backoff(mut self, backoff: Duration) -> Self {
        self.infra_retry_backoff = backoff;
        self
    }

    /// Set the outcome error types treated as transient infrastructure errors.
    pub fn with_infra_error_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.infra_error_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Set the force-mark-failed retry schedule.
    pub fn with_status_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.status_retry_attempts = attempts.max(1);
        self.status_retry_delay = delay;
        self
    }
}

/// Result of one pass through the single-phase execution path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseExecution {
    pub phase_id: String,
    pub success: bool,
    /// Status of the phase after the attempt was handled.
    pub status: PhaseStatus,
    /// Status the attempt itself ended in (e.g. `CI_FAILED`).
    pub attempt_status: PhaseStatus,
    /// Escalation bookkeeping outcome of a failed attempt.
    pub failure_outcome: Option<FailureOutcome>,
    /// Policy decision applied, if the phase was stuck.
    pub decision: Option<StuckDecision>,
}

/// Why the run stopped early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAbort {
    pub reason: String,
    /// Set when the health budget was breached and an operator should look.
    pub needs_review: bool,
}

/// Pipeline step, used for retry bookkeeping and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Build,
    Audit,
    Ci,
}

impl Step {
    fn as_str(&self) -> &'static str {
        match self {
            Step::Build => "build",
            Step::Audit => "audit",
            Step::Ci => "ci",
        }
    }
}

/// Builder for [`PhaseStateMachine`].
pub struct PhaseStateMachineBuilder {
    run_id: String,
    runner: Arc<dyn PhaseRunner>,
    config: StateMachineConfig,
    health_config: HealthBudgetConfig,
    flaw_config: FlawDetectorConfig,
    budget: Option<SharedRunBudget>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    reporter: Arc<dyn StatusReporter>,
    escalator: Arc<dyn ModelEscalator>,
    refresher: Arc<dyn SummaryRefresher>,
    corrector: Arc<dyn PatchCorrector>,
    scope_reducer: Arc<dyn ScopeReducer>,
    evidence: Option<Arc<EvidenceWriter>>,
}

impl PhaseStateMachineBuilder {
    pub fn config(mut self, config: StateMachineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn health_config(mut self, config: HealthBudgetConfig) -> Self {
        self.health_config = config;
        self
    }

    pub fn flaw_config(mut self, config: FlawDetectorConfig) -> Self {
        self.flaw_config = config;
        self
    }

    /// Share an existing run budget.
    pub fn budget(mut self, budget: SharedRunBudget) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Create the run budget from a config.
    pub fn budget_config(self, config: RunBudgetConfig) -> Self {
        self.budget(SharedRunBudget::new(config))
    }

    pub fn breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn status_reporter(mut self, reporter: Arc<dyn StatusReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn model_escalator(mut self, escalator: Arc<dyn ModelEscalator>) -> Self {
        self.escalator = escalator;
        self
    }

    pub fn summary_refresher(mut self, refresher: Arc<dyn SummaryRefresher>) -> Self {
        self.refresher = refresher;
        self
    }

    pub fn patch_corrector(mut self, corrector: Arc<dyn PatchCorrector>) -> Self {
        self.corrector = corrector;
        self
    }

    pub fn scope_reducer(mut self, reducer: Arc<dyn ScopeReducer>) -> Self {
        self.scope_reducer = reducer;
        self
    }

    pub fn evidence(mut self, writer: Arc<EvidenceWriter>) -> Self {
        self.evidence = Some(writer);
        self
    }

    pub fn build(self) -> PhaseStateMachine {
        PhaseStateMachine {
            metrics: RunMetricsCollector::new(self.run_id.clone()),
            run_id: self.run_id,
            config: self.config,
            phases: Mutex::new(Vec::new()),
            health: HealthBudgetTracker::new(self.health_config),
            flaw_detector: ApproachFlawDetector::new(self.flaw_config),
            policy: StuckHandlingPolicy::new(),
            budget: self
                .budget
                .unwrap_or_else(|| SharedRunBudget::new(RunBudgetConfig::default())),
            breakers: self.breakers.unwrap_or_default(),
            runner: self.runner,
            reporter: self.reporter,
            escalator: self.escalator,
            refresher: self.refresher,
            corrector: self.corrector,
            scope_reducer: self.scope_reducer,
            evidence: self.evidence,
            abort: Mutex::new(None),
        }
    }
}

/// Owns the phases of one run and drives each through its lifecycle.
///
/// Shared across scheduler workers behind an `Arc`. The phase table lock is
/// only held for short read/update sections, never across an `.await`.
pub struct PhaseStateMachine {
    run_id: String,
    config: StateMachineConfig,
    phases: Mutex<Vec<Phase>>,
    health: HealthBudgetTracker,
    flaw_detector: ApproachFlawDetector,
    policy: StuckHandlingPolicy,
    budget: SharedRunBudget,
    breakers: Arc<CircuitBreakerRegistry>,
    runner: Arc<dyn PhaseRunner>,
    reporter: Arc<dyn StatusReporter>,
    escalator: Arc<dyn ModelEscalator>,
    refresher: Arc<dyn SummaryRefresher>,
    corrector: Arc<dyn PatchCorrector>,
    scope_reducer: Arc<dyn ScopeReducer>,
    evidence: Option<Arc<EvidenceWriter>>,
    metrics: RunMetricsCollector,
    abort: Mutex<Option<RunAbort>>,
}

impl std::fmt::Debug for PhaseStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseStateMachine")
            .field("run_id", &self.run_id)
            .field("config", &self.config)
            .field("health", &self.health.snapshot())
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}

impl PhaseStateMachine {
    /// Start building a state machine for a run.
    pub fn builder(run_id: impl Into<String>, runner: Arc<dyn PhaseRunner>) -> PhaseStateMachineBuilder {
        PhaseStateMachineBuilder {
            run_id: run_id.into(),
            runner,
            config: StateMachineConfig::default(),
            health_config: HealthBudgetConfig::default(),
            flaw_config: FlawDetectorConfig::default(),
            budget: None,
            breakers: None,
            reporter: Arc::new(NoopStatusReporter),
            escalator: Arc::new(NoopModelEscalator),
            refresher: Arc::new(NoopSummaryRefresher),
            corrector: Arc::new(NoopPatchCorrector),
            scope_reducer: Arc::new(HalveScope),
            evidence: None,
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &StateMachineConfig {
        &self.config
    }

    pub fn health_snapshot(&self) -> HealthBudget {
        self.health.snapshot()
    }

    pub fn budget(&self) -> &SharedRunBudget {
        &self.budget
    }

    pub fn flaw_detector(&self) -> &ApproachFlawDetector {
        &self.flaw_detector
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn metrics(&self) -> &RunMetricsCollector {
        &self.metrics
    }

    pub fn evidence(&self) -> Option<&Arc<EvidenceWriter>> {
        self.evidence.as_ref()
    }

    fn lock_phases(&self) -> MutexGuard<'_, Vec<Phase>> {
        self.phases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a phase at the end of the queue.
    pub fn register_phase(&self, phase: Phase) -> OrchestratorResult<()> {
        let count = {
            let mut phases = self.lock_phases();
            if phases.iter().any(|p| p.phase_id == phase.phase_id) {
                return Err(OrchestratorError::DuplicatePhase(phase.phase_id));
            }
            debug!(phase_id = %phase.phase_id, scope = ?phase.scope, "Registered phase");
            phases.push(phase);
            phases.len()
        };
        self.metrics.set_expected_phases(count);
        Ok(())
    }

    /// Copy of a phase.
    pub fn phase(&self, phase_id: &str) -> OrchestratorResult<Phase> {
        self.lock_phases()
            .iter()
            .find(|p| p.phase_id == phase_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::PhaseNotFound(phase_id.to_string()))
    }

    /// Copy of every phase, in queue order.
    pub fn phases(&self) -> Vec<Phase> {
        self.lock_phases().clone()
    }

    /// Copy of the queued phases, in queue order.
    pub fn queued_phases(&self) -> Vec<Phase> {
        self.lock_phases()
            .iter()
            .filter(|p| p.is_queued())
            .cloned()
            .collect()
    }

    fn update_phase<R>(
        &self,
        phase_id: &str,
        f: impl FnOnce(&mut Phase) -> R,
    ) -> OrchestratorResult<R> {
        let mut phases = self.lock_phases();
        let phase = phases
            .iter_mut()
            .find(|p| p.phase_id == phase_id)
            .ok_or_else(|| OrchestratorError::PhaseNotFound(phase_id.to_string()))?;
        Ok(f(phase))
    }

    /// Drain the phase table at run end.
    pub fn archive(&self) -> Vec<Phase> {
        let archived = std::mem::take(&mut *self.lock_phases());
        info!(run_id = %self.run_id, phases = archived.len(), "Archived run phases");
        archived
    }

    // ========================================================================
    // Run abort
    // ========================================================================

    pub fn is_aborted(&self) -> bool {
        self.run_abort().is_some()
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.run_abort().map(|abort| abort.reason)
    }

    pub fn run_abort(&self) -> Option<RunAbort> {
        self.abort
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn abort_run(&self, reason: String, needs_review: bool) {
        let mut abort = self
            .abort
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if abort.is_none() {
            if needs_review {
                error!(run_id = %self.run_id, reason = %reason, "Run aborted, flagged for operator review");
            } else {
                warn!(run_id = %self.run_id, reason = %reason, "Run aborted");
            }
            *abort = Some(RunAbort {
                reason,
                needs_review,
            });
        }
    }

    // ========================================================================
    // Transitions and reporting
    // ========================================================================

    /// Move a phase to `to`, report it and refresh the summary on terminal statuses.
    pub async fn transition(
        &self,
        phase_id: &str,
        to: PhaseStatus,
        reason: Option<&str>,
    ) -> OrchestratorResult<()> {
        let from = self.update_phase(phase_id, |phase| {
            let from = phase.status;
            if !from.can_transition_to(to) {
                return Err(OrchestratorError::IllegalTransition {
                    phase_id: phase_id.to_string(),
                    from,
                    to,
                });
            }
            phase.status = to;
            if let Some(reason) = reason {
                phase.last_reason = Some(reason.to_string());
            }
            Ok(from)
        })??;

        info!(phase_id, from = %from, to = %to, reason = reason.unwrap_or(""), "Phase transition");
        if let Some(evidence) = &self.evidence {
            evidence.emit_transition(phase_id, from, to, reason);
        }
        if to.is_terminal() {
            self.metrics
                .complete_phase(phase_id, to, reason.map(str::to_string));
        } else if to == PhaseStatus::Queued {
            self.metrics.requeue_phase(phase_id);
        }

        if !self.report_status(phase_id, to).await {
            if to.external() == PhaseStatus::Failed {
                if let Err(err) = self.report_with_retry(phase_id, PhaseStatus::Failed).await {
                    error!(phase_id, error = %err, "Failed status could not be recorded");
                }
            } else {
                warn!(phase_id, status = %to.external(), "Status update not recorded");
            }
        }

        if to.is_terminal() {
            self.refresh_summary().await;
        }
        Ok(())
    }

    /// Mark a phase FAILED without transition validation and report it with retries.
    pub async fn force_mark_failed(&self, phase_id: &str, reason: &str) -> OrchestratorResult<()> {
        let from = self.update_phase(phase_id, |phase| {
            let from = phase.status;
            phase.status = PhaseStatus::Failed;
            phase.last_reason = Some(reason.to_string());
            from
        })?;

        warn!(phase_id, from = %from, reason, "Force marking phase failed");
        if let Some(evidence) = &self.evidence {
            evidence.emit_transition(phase_id, from, PhaseStatus::Failed, Some(reason));
        }
        self.metrics
            .complete_phase(phase_id, PhaseStatus::Failed, Some(reason.to_string()));

        let reported = self.report_with_retry(phase_id, PhaseStatus::Failed).await;
        self.refresh_summary().await;
        reported
    }

    async fn report_status(&self, phase_id: &str, status: PhaseStatus) -> bool {
        let external = status.external();
        let breaker = self.breakers.get_or_create(STATUS_BREAKER);
        let reporter = &self.reporter;
        let run_id = self.run_id.as_str();
        let result = breaker
            .call_async(|| async move {
                if reporter.update_status(run_id, phase_id, external).await {
                    Ok(())
                } else {
                    Err("status update rejected")
                }
            })
            .await;
        match result {
            Ok(()) => true,
            Err(err) => {
                debug!(phase_id, status = %external, error = %err, "Status report failed");
                false
            }
        }
    }

    /// Bounded retry that talks to the reporter directly, bypassing the breaker.
    async fn report_with_retry(&self, phase_id: &str, status: PhaseStatus) -> OrchestratorResult<()> {
        let external = status.external();
        let attempts = self.config.status_retry_attempts.max(1);
        for attempt in 1..=attempts {
            if self
                .reporter
                .update_status(&self.run_id, phase_id, external)
                .await
            {
                return Ok(());
            }
            warn!(phase_id, attempt, attempts, status = %external, "Status update attempt failed");
            if attempt < attempts && !self.config.status_retry_delay.is_zero() {
                tokio::time::sleep(self.config.status_retry_delay).await;
            }
        }
        Err(OrchestratorError::StatusUpdateFailed {
            phase_id: phase_id.to_string(),
            attempts,
        })
    }

    async fn refresh_summary(&self) {
        match AssertUnwindSafe(self.refresher.refresh(&self.run_id))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => debug!(run_id = %self.run_id, "Run summary refreshed"),
            Ok(Err(err)) => warn!(run_id = %self.run_id, error = %err, "Run summary refresh failed"),
            Err(_) => warn!(run_id = %self.run_id, "Run summary refresh panicked"),
        }
    }

    // ========================================================================
    // Single-phase execution
    // ========================================================================

    /// Run one attempt of a queued phase and handle its outcome.
    pub async fn execute_phase(&self, phase_id: &str) -> OrchestratorResult<PhaseExecution> {
        self.transition(phase_id, PhaseStatus::Executing, None).await?;
        let phase = self.update_phase(phase_id, |phase| {
            phase.loop_state.iterations_used += 1;
            phase.clone()
        })?;
        let attempt = phase.loop_state.iterations_used;
        self.metrics.start_attempt(phase_id);
        info!(phase_id, attempt, "Starting phase attempt");

        let outcome = self.run_pipeline(&phase).await?;
        self.metrics.finish_attempt(phase_id, outcome.status);
        let budget_status = self.budget.record_tokens(phase_id, outcome.tokens_used);
        if budget_status.should_warn() {
            warn!(phase_id, status = %budget_status, "Run budget running low");
        }

        if outcome.success {
            self.update_phase(phase_id, |phase| {
                phase.loop_state.consecutive_failures = 0;
            })?;
            info!(phase_id, attempt, "Phase complete");
            return Ok(PhaseExecution {
                phase_id: phase_id.to_string(),
                success: true,
                status: PhaseStatus::Complete,
                attempt_status: PhaseStatus::Complete,
                failure_outcome: None,
                decision: None,
            });
        }

        let failure_outcome = FailureOutcome::from_status(outcome.status);
        self.health.increment_total_failures();
        self.update_phase(phase_id, |phase| {
            phase.loop_state.consecutive_failures += 1;
        })?;
        self.flaw_detector.record_error(
            phase_id,
            attempt,
            outcome.error_type_or_status(),
            outcome.message.clone(),
        );
        warn!(
            phase_id,
            attempt,
            status = %outcome.status,
            outcome = %failure_outcome,
            error_type = outcome.error_type.as_deref().unwrap_or(""),
            "Phase attempt failed"
        );

        let (status, decision) = self.handle_failure(phase_id, &outcome).await?;
        Ok(PhaseExecution {
            phase_id: phase_id.to_string(),
            success: false,
            status,
            attempt_status: outcome.status,
            failure_outcome: Some(failure_outcome),
            decision,
        })
    }

    fn is_infra_error(&self, outcome: &PhaseOutcome) -> bool {
        outcome
            .error_type
            .as_ref()
            .is_some_and(|t| self.config.infra_error_types.iter().any(|i| i == t))
    }

    /// Call one collaborator step, retrying transient infrastructure errors.
    ///
    /// `Ok` carries the collaborator's own outcome (passing or not); `Err`
    /// carries a synthesized FAILED outcome for collaborator errors and
    /// exhausted infrastructure retries.
    async fn run_step(&self, step: Step, phase: &Phase) -> Result<PhaseOutcome, PhaseOutcome> {
        let mut tokens = 0u64;
        let mut retries = 0u32;
        loop {
            let result = match step {
                Step::Build => self.runner.build(phase).await,
                Step::Audit => self.runner.audit(phase).await,
                Step::Ci => self.runner.ci(phase).await,
            };
            if let Ok(outcome) = &result {
                tokens = tokens.saturating_add(outcome.tokens_used);
            }
            let transient = match &result {
                Ok(outcome) => !outcome.success && self.is_infra_error(outcome),
                Err(err) => err.is_transient(),
            };

            if !transient {
                return match result {
                    Ok(outcome) => Ok(PhaseOutcome {
                        tokens_used: tokens,
                        ..outcome
                    }),
                    Err(err) => Err(collaborator_failure(step, &err).with_tokens(tokens)),
                };
            }

            let message = match result {
                Ok(outcome) => outcome.message,
                Err(err) => err.to_string(),
            };
            if retries >= self.config.infra_retry_limit {
                let snapshot = self.health.increment_infra_failures();
                warn!(
                    phase_id = %phase.phase_id,
                    step = step.as_str(),
                    retries,
                    infra_failures = snapshot.infra_failure_count,
                    "Infrastructure retries exhausted"
                );
                return Err(PhaseOutcome::failure(
                    PhaseStatus::Failed,
                    INFRA_ERROR_TYPE,
                    format!(
                        "{} infrastructure error after {} attempts: {}",
                        step.as_str(),
                        retries + 1,
                        message
                    ),
                )
                .with_tokens(tokens));
            }

            retries += 1;
            debug!(
                phase_id = %phase.phase_id,
                step = step.as_str(),
                retry = retries,
                error = %message,
                "Retrying transient infrastructure error"
            );
            if !self.config.infra_retry_backoff.is_zero() {
                tokio::time::sleep(self.config.infra_retry_backoff).await;
            }
        }
    }

    /// Build, gate and CI for one attempt. Returns the attempt's outcome with
    /// the status the phase ended in and the tokens of every step.
    async fn run_pipeline(&self, phase: &Phase) -> OrchestratorResult<PhaseOutcome> {
        let phase_id = phase.phase_id.as_str();
        let mut tokens = 0u64;

        let mut build = match self.run_step(Step::Build, phase).await {
            Ok(outcome) => outcome,
            Err(failed) => return self.fail_attempt(phase_id, PhaseStatus::Failed, failed, 0).await,
        };
        tokens = tokens.saturating_add(build.tokens_used);

        if !build.success && build.status == PhaseStatus::PatchFailed {
            let snapshot = self.health.increment_patch_failures();
            debug!(phase_id, patch_failures = snapshot.patch_failure_count, "Patch failed to apply");
            match self.corrector.correct(phase, &build).await {
                Ok(Some(corrected)) => {
                    tokens = tokens.saturating_add(corrected.tokens_used);
                    if corrected.success {
                        info!(phase_id, "Patch correction applied");
                        build = corrected;
                    } else {
                        debug!(phase_id, "Patch correction did not apply");
                    }
                }
                Ok(None) => debug!(phase_id, "No patch correction attempted"),
                Err(err) => warn!(phase_id, error = %err, "Patch correction failed"),
            }
        }

        if !build.success {
            let status = if build.status.is_failure() {
                build.status
            } else {
                PhaseStatus::Failed
            };
            return self.fail_attempt(phase_id, status, build, tokens).await;
        }

        self.transition(phase_id, PhaseStatus::Gate, None).await?;
        match self.run_step(Step::Audit, phase).await {
            Ok(audit) if audit.success => tokens = tokens.saturating_add(audit.tokens_used),
            Ok(audit) => {
                let status = if audit.status == PhaseStatus::DeliverablesValidationFailed {
                    PhaseStatus::DeliverablesValidationFailed
                } else {
                    PhaseStatus::Blocked
                };
                return self.fail_attempt(phase_id, status, audit, tokens).await;
            }
            Err(failed) => {
                return self
                    .fail_attempt(phase_id, PhaseStatus::Failed, failed, tokens)
                    .await
            }
        }

        self.transition(phase_id, PhaseStatus::CiRunning, None).await?;
        match self.run_step(Step::Ci, phase).await {
            Ok(ci) if ci.success => tokens = tokens.saturating_add(ci.tokens_used),
            Ok(ci) => {
                return self
                    .fail_attempt(phase_id, PhaseStatus::CiFailed, ci, tokens)
                    .await
            }
            Err(failed) => {
                return self
                    .fail_attempt(phase_id, PhaseStatus::Failed, failed, tokens)
                    .await
            }
        }

        self.transition(phase_id, PhaseStatus::Complete, Some(COMPLETE_REASON))
            .await?;
        Ok(PhaseOutcome::success().with_tokens(tokens))
    }

    async fn fail_attempt(
        &self,
        phase_id: &str,
        status: PhaseStatus,
        outcome: PhaseOutcome,
        tokens_before: u64,
    ) -> OrchestratorResult<PhaseOutcome> {
        let message = if outcome.message.is_empty() {
            format!("attempt ended in {}", status)
        } else {
            outcome.message.clone()
        };
        self.transition(phase_id, status, Some(&message)).await?;
        Ok(PhaseOutcome {
            success: false,
            status,
            tokens_used: tokens_before.saturating_add(outcome.tokens_used),
            message,
            ..outcome
        })
    }

    // ========================================================================
    // Failure handling
    // ========================================================================

    /// Decide what happens to a phase after a failed attempt.
    ///
    /// Returns the phase's resulting status and the policy decision, if one
    /// was needed.
    pub async fn handle_failure(
        &self,
        phase_id: &str,
        outcome: &PhaseOutcome,
    ) -> OrchestratorResult<(PhaseStatus, Option<StuckDecision>)> {
        let health = self.health.snapshot();
        if health.is_exhausted() {
            let reason = format!(
                "health budget exhausted: {} failed attempts (cap {}), {} infra, {} patch",
                health.total_failures,
                health.total_cap,
                health.infra_failure_count,
                health.patch_failure_count
            );
            self.transition(phase_id, PhaseStatus::Failed, Some(&reason))
                .await?;
            self.abort_run(reason, true);
            return Ok((PhaseStatus::Failed, None));
        }

        let phase = self.phase(phase_id)?;
        let pattern = self.flaw_detector.detect_approach_flaw(phase_id);
        if let (Some(pattern), Some(evidence)) = (&pattern, &self.evidence) {
            evidence.emit_flaw(phase_id, pattern);
        }

        let stuck_reason = if outcome.goal_drift {
            Some(StuckReason::GoalDriftWarning)
        } else if self.budget.is_exhausted() {
            Some(StuckReason::BudgetExceeded)
        } else if phase.loop_state.consecutive_failures >= STUCK_CONSECUTIVE_FAILURES
            || pattern.is_some()
        {
            Some(StuckReason::RepeatedFailures)
        } else {
            None
        };

        let Some(stuck_reason) = stuck_reason else {
            let status = self
                .requeue(phase_id, &format!("retrying after {}", outcome.status))
                .await?;
            return Ok((status, None));
        };

        let decision = self.policy.decide(
            stuck_reason,
            &phase.loop_state,
            self.budget.remaining_fraction(),
        );
        info!(
            phase_id,
            reason = %decision.reason,
            decision = %decision.decision,
            budget_remaining = decision.budget_remaining,
            rationale = %decision.rationale,
            "Stuck phase decision"
        );
        self.metrics.record_decision(decision.decision);
        if let Some(evidence) = &self.evidence {
            evidence.emit_decision(phase_id, &decision, Some(self.budget.snapshot()));
        }

        let status = self.apply_decision(phase_id, &decision).await?;
        Ok((status, Some(decision.decision)))
    }

    async fn apply_decision(
        &self,
        phase_id: &str,
        decision: &StuckResolutionDecision,
    ) -> OrchestratorResult<PhaseStatus> {
        match decision.decision {
            StuckDecision::Replan => {
                self.update_phase(phase_id, |phase| {
                    phase.loop_state.replan_attempted = true;
                    phase.loop_state.consecutive_failures = 0;
                })?;
                self.flaw_detector.clear_history(phase_id);
                self.requeue(phase_id, &format!("replan after {}", decision.reason))
                    .await
            }
            StuckDecision::EscalateModel => {
                let phase = self.phase(phase_id)?;
                let breaker = self.breakers.get_or_create(ESCALATION_BREAKER);
                let escalator = &self.escalator;
                let target = &phase;
                let result = breaker
                    .call_async(|| async move {
                        match AssertUnwindSafe(escalator.escalate(target)).catch_unwind().await {
                            Ok(result) => result,
                            Err(_) => Err(CollaboratorError::Other(
                                "model escalator panicked".to_string(),
                            )),
                        }
                    })
                    .await;
                match result {
                    Ok(selection) => {
                        info!(phase_id, model = %selection.model, "Model escalated");
                        self.update_phase(phase_id, |phase| {
                            phase.loop_state.escalations_used =
                                (phase.loop_state.escalations_used + 1).min(MAX_ESCALATIONS);
                            phase.loop_state.consecutive_failures = 0;
                            phase.model_selection = Some(selection);
                        })?;
                        self.requeue(phase_id, &format!("escalated after {}", decision.reason))
                            .await
                    }
                    Err(err) => {
                        let reason = format!("model escalation failed: {}", err);
                        warn!(phase_id, error = %err, "Model escalation failed, skipping phase");
                        self.transition(phase_id, PhaseStatus::Skipped, Some(&reason))
                            .await?;
                        Ok(PhaseStatus::Skipped)
                    }
                }
            }
            StuckDecision::ReduceScope => {
                let phase = self.phase(phase_id)?;
                let reduced = self.scope_reducer.reduce(&phase);
                info!(phase_id, from = ?phase.scope, to = ?reduced, "Reducing phase scope");
                self.update_phase(phase_id, |phase| phase.scope = reduced)?;
                self.requeue(phase_id, &format!("scope reduced after {}", decision.reason))
                    .await
            }
            StuckDecision::Stop => {
                let reason = format!(
                    "stopped on {}: {}; {}",
                    decision.reason,
                    decision.rationale,
                    self.budget.snapshot()
                );
                self.transition(phase_id, PhaseStatus::Skipped, Some(&reason))
                    .await?;
                self.abort_run(reason, false);
                Ok(PhaseStatus::Skipped)
            }
        }
    }

    /// Put a phase back in the queue, or fail it once it used every attempt.
    async fn requeue(&self, phase_id: &str, reason: &str) -> OrchestratorResult<PhaseStatus> {
        let iterations = self.phase(phase_id)?.loop_state.iterations_used;
        let limit = self.config.max_iterations_per_phase;
        if iterations >= limit {
            let reason = format!("iteration limit reached ({}/{})", iterations, limit);
            self.transition(phase_id, PhaseStatus::Failed, Some(&reason))
                .await?;
            return Ok(PhaseStatus::Failed);
        }
        self.transition(phase_id, PhaseStatus::Queued, Some(reason))
            .await?;
        Ok(PhaseStatus::Queued)
    }
}

fn collaborator_failure(step: Step, err: &CollaboratorError) -> PhaseOutcome {
    let error_type = match err {
        CollaboratorError::Transient(_) => INFRA_ERROR_TYPE,
        CollaboratorError::Rejected(_) => "rejected",
        CollaboratorError::Other(_) => "collaborator_error",
    };
    PhaseOutcome::failure(
        PhaseStatus::Failed,
        error_type,
        format!("{} error: {}", step.as_str(), err),
    )
}
