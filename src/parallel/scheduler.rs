//! Parallel execution scheduler

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::error::OrchestratorResult;
use crate::evidence::EvidenceKind;
use crate::metrics::{format_metrics, RunMetrics, RunMetricsStore};
use crate::parallel::isolation::IsolationChecker;
use crate::phase::{Phase, PhaseExecution, PhaseStateMachine, PhaseStatus, RunAbort};

/// Configuration options for parallel phase dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Whether parallel dispatch may be used at all.
    pub enabled: bool,
    /// Maximum number of phases executing concurrently. Below 2 means sequential.
    pub max_parallel_phases: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_parallel_phases: 2,
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_max_parallel_phases(mut self, max: usize) -> Self {
        self.max_parallel_phases = max;
        self
    }

    /// Whether this config can ever produce a parallel batch.
    pub fn is_active(&self) -> bool {
        self.enabled && self.max_parallel_phases >= 2
    }
}

/// Phases chosen for one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPlan {
    /// Phases to run, in queue order.
    pub phase_ids: Vec<String>,
    /// Queued phases held back because they are not isolated from the batch.
    pub skipped: Vec<String>,
}

impl BatchPlan {
    pub fn is_parallel(&self) -> bool {
        self.phase_ids.len() >= 2
    }
}

/// What one call to [`ParallelExecutionScheduler::dispatch_next`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Nothing queued, or the run was aborted.
    Idle,
    Sequential(PhaseExecution),
    /// Results in submission order.
    Parallel(Vec<PhaseExecution>),
}

/// Running totals of parallel dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelStats {
    pub batches: usize,
    pub executed_in_parallel: usize,
    pub skipped_in_parallel: usize,
}

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub executions: Vec<PhaseExecution>,
    /// Archived phase table.
    pub phases: Vec<Phase>,
    pub metrics: RunMetrics,
    pub abort: Option<RunAbort>,
    pub parallel: ParallelStats,
}

impl RunReport {
    pub fn completed(&self) -> usize {
        self.count(PhaseStatus::Complete)
    }

    pub fn count(&self, status: PhaseStatus) -> usize {
        self.phases.iter().filter(|p| p.status == status).count()
    }
}

/// Pulls queued phases from the state machine and runs them, concurrently when
/// their scopes are isolated.
pub struct ParallelExecutionScheduler {
    config: SchedulerConfig,
    machine: Arc<PhaseStateMachine>,
    checker: Option<Arc<dyn IsolationChecker>>,
    metrics_store: Option<RunMetricsStore>,
    stats: Mutex<ParallelStats>,
}

impl ParallelExecutionScheduler {
    pub fn new(config: SchedulerConfig, machine: Arc<PhaseStateMachine>) -> Self {
        Self {
            config,
            machine,
            checker: None,
            metrics_store: None,
            stats: Mutex::new(ParallelStats::default()),
        }
    }

    /// Isolation checker required for any parallel batch.
    pub fn with_isolation_checker(mut self, checker: Arc<dyn IsolationChecker>) -> Self {
        self.checker = Some(checker);
        self
    }

    /// Persist run metrics here when the run finishes.
    pub fn with_metrics_store(mut self, store: RunMetricsStore) -> Self {
        self.metrics_store = Some(store);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn machine(&self) -> &Arc<PhaseStateMachine> {
        &self.machine
    }

    pub fn stats(&self) -> ParallelStats {
        *self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Choose the phases for the next dispatch.
    ///
    /// Greedy in queue order: a candidate joins if it is isolated from every
    /// phase already chosen. Falls back to the head of the queue alone when
    /// parallel dispatch is off, no checker is configured, or fewer than two
    /// phases are queued.
    pub fn plan_batch(&self, queued: &[Phase]) -> BatchPlan {
        let Some(head) = queued.first() else {
            return BatchPlan::default();
        };
        let sequential = BatchPlan {
            phase_ids: vec![head.phase_id.clone()],
            skipped: Vec::new(),
        };

        let checker = match &self.checker {
            Some(checker) if self.config.is_active() && queued.len() >= 2 => checker,
            _ => return sequential,
        };

        let concurrency = self.config.max_parallel_phases;
        let mut batch: Vec<&Phase> = Vec::new();
        let mut skipped = Vec::new();
        for candidate in queued {
            if batch
                .iter()
                .all(|member| checker.is_isolated(member, candidate, concurrency))
            {
                batch.push(candidate);
            } else {
                skipped.push(candidate.phase_id.clone());
            }
        }

        if batch.len() < 2 {
            return sequential;
        }
        BatchPlan {
            phase_ids: batch.iter().map(|p| p.phase_id.clone()).collect(),
            skipped,
        }
    }

    /// Run one dispatch: a parallel batch or a single phase.
    pub async fn dispatch_next(&self) -> OrchestratorResult<Dispatch> {
        if self.machine.is_aborted() {
            return Ok(Dispatch::Idle);
        }
        let queued = self.machine.queued_phases();
        let plan = self.plan_batch(&queued);

        if plan.is_parallel() {
            return self.run_batch(plan).await.map(Dispatch::Parallel);
        }
        match plan.phase_ids.first() {
            Some(phase_id) => {
                debug!(phase_id = %phase_id, "Dispatching phase sequentially");
                self.machine
                    .execute_phase(phase_id)
                    .await
                    .map(Dispatch::Sequential)
            }
            None => Ok(Dispatch::Idle),
        }
    }

    async fn run_batch(&self, plan: BatchPlan) -> OrchestratorResult<Vec<PhaseExecution>> {
        let workers = self.config.max_parallel_phases.min(plan.phase_ids.len());
        info!(
            phases = ?plan.phase_ids,
            held_back = ?plan.skipped,
            workers,
            "Dispatching parallel batch"
        );

        let semaphore = Arc::new(Semaphore::new(workers));
        let handles: Vec<_> = plan
            .phase_ids
            .iter()
            .map(|phase_id| {
                let machine = Arc::clone(&self.machine);
                let semaphore = Arc::clone(&semaphore);
                let phase_id = phase_id.clone();
                tokio::spawn(async move {
                    // Hold the permit until the phase attempt finishes
                    let _permit = semaphore.acquire_owned().await;
                    machine.execute_phase(&phase_id).await
                })
            })
            .collect();
        let joined = futures::future::join_all(handles).await;

        let mut executions = Vec::with_capacity(joined.len());
        let mut first_error = None;
        for (phase_id, result) in plan.phase_ids.iter().zip(joined) {
            match result {
                Ok(Ok(execution)) => executions.push(execution),
                Ok(Err(err)) => {
                    warn!(phase_id = %phase_id, error = %err, "Parallel phase returned an error");
                    first_error.get_or_insert(err);
                }
                Err(join_err) => {
                    error!(phase_id = %phase_id, error = %join_err, "Parallel phase worker panicked");
                    let reason = format!("worker panicked: {}", join_err);
                    if let Err(err) = self.machine.force_mark_failed(phase_id, &reason).await {
                        warn!(phase_id = %phase_id, error = %err, "Could not record worker failure");
                    }
                    executions.push(PhaseExecution {
                        phase_id: phase_id.clone(),
                        success: false,
                        status: PhaseStatus::Failed,
                        attempt_status: PhaseStatus::Failed,
                        failure_outcome: None,
                        decision: None,
                    });
                }
            }
        }

        {
            let mut stats = self
                .stats
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            stats.batches += 1;
            stats.executed_in_parallel += plan.phase_ids.len();
            stats.skipped_in_parallel += plan.skipped.len();
        }
        self.machine
            .metrics()
            .record_parallel_batch(plan.phase_ids.len(), plan.skipped.len());

        match first_error {
            Some(err) => Err(err),
            None => Ok(executions),
        }
    }

    async fn drain(&self, executions: &mut Vec<PhaseExecution>) -> OrchestratorResult<()> {
        loop {
            match self.dispatch_next().await? {
                Dispatch::Idle => return Ok(()),
                Dispatch::Sequential(execution) => executions.push(execution),
                Dispatch::Parallel(batch) => executions.extend(batch),
            }
        }
    }

    /// Dispatch until no phase is queued or the run is aborted, then archive
    /// the phase table and persist run metrics.
    pub async fn run_until_idle(&self) -> OrchestratorResult<RunReport> {
        let run_id = self.machine.run_id().to_string();
        let evidence = self.machine.evidence().cloned();
        if let Some(evidence) = &evidence {
            evidence.emit_run_start();
        }
        info!(
            run_id = %run_id,
            phases = self.machine.phases().len(),
            parallel = self.config.is_active() && self.checker.is_some(),
            max_parallel_phases = self.config.max_parallel_phases,
            "Starting run"
        );

        let mut executions = Vec::new();
        let drained = self.drain(&mut executions).await;

        let abort = self.machine.run_abort();
        let health = self.machine.health_snapshot();
        let budget = self.machine.budget().snapshot();
        let abort_reason = abort.as_ref().map(|a| a.reason.clone());
        let metrics = self.machine.metrics().finish(health, abort_reason.clone());
        if let Some(evidence) = &evidence {
            evidence.write_payload(EvidenceKind::Metrics, &metrics);
            evidence.emit_run_complete(abort_reason.as_deref(), health, Some(budget.clone()));
        }

        if let Some(store) = &self.metrics_store {
            match store.save(&metrics) {
                Ok(path) => debug!(path = %path.display(), "Saved run metrics"),
                Err(err) => warn!(error = %err, "Failed to save run metrics"),
            }
        }
        drained?;

        let phases = self.machine.archive();
        info!(
            run_id = %run_id,
            attempts = executions.len(),
            complete = phases.iter().filter(|p| p.status == PhaseStatus::Complete).count(),
            aborted = abort.is_some(),
            budget = %budget,
            "Run finished"
        );
        debug!("{}", format_metrics(&metrics));
        Ok(RunReport {
            run_id,
            executions,
            phases,
            metrics,
            abort,
            parallel: self.stats(),
        })
    }
}
