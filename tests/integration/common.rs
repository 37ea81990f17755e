//! Fake collaborators shared by the integration tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use phaseward::phase::{ModelEscalator, StatusReporter};
use phaseward::{
    CollaboratorError, ModelSelection, Phase, PhaseOutcome, PhaseRunner, PhaseStateMachine,
    PhaseStatus, RunBudgetConfig, StateMachineConfig,
};

type Script = HashMap<String, VecDeque<PhaseOutcome>>;

/// Runner that replays scripted build/audit outcomes and tracks which phases
/// are building at the same time.
#[derive(Default)]
pub struct TrackingRunner {
    builds: Mutex<Script>,
    audits: Mutex<Script>,
    always_fail: HashSet<String>,
    build_delay: Duration,
    active: Mutex<HashSet<String>>,
    overlaps: Mutex<Vec<(String, String)>>,
    max_active: AtomicUsize,
    calls: AtomicUsize,
}

impl TrackingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_build_delay(mut self, delay: Duration) -> Self {
        self.build_delay = delay;
        self
    }

    pub fn fail_build(self, phase_id: &str, outcome: PhaseOutcome) -> Self {
        self.builds
            .lock()
            .unwrap()
            .entry(phase_id.to_string())
            .or_default()
            .push_back(outcome);
        self
    }

    pub fn reject_audit(self, phase_id: &str) -> Self {
        self.audits
            .lock()
            .unwrap()
            .entry(phase_id.to_string())
            .or_default()
            .push_back(PhaseOutcome::failure(
                PhaseStatus::Blocked,
                "auditor_reject",
                "missing tests for the new parser entry point",
            ));
        self
    }

    pub fn always_fail(mut self, phase_id: &str) -> Self {
        self.always_fail.insert(phase_id.to_string());
        self
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Whether the two phases were ever building at the same time.
    pub fn overlapped(&self, a: &str, b: &str) -> bool {
        self.overlaps
            .lock()
            .unwrap()
            .iter()
            .any(|(x, y)| (x == a && y == b) || (x == b && y == a))
    }

    fn next(script: &Mutex<Script>, phase_id: &str) -> Option<PhaseOutcome> {
        script
            .lock()
            .unwrap()
            .get_mut(phase_id)
            .and_then(|queue| queue.pop_front())
    }
}

#[async_trait]
impl PhaseRunner for TrackingRunner {
    async fn build(&self, phase: &Phase) -> Result<PhaseOutcome, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut active = self.active.lock().unwrap();
            let mut overlaps = self.overlaps.lock().unwrap();
            for other in active.iter() {
                overlaps.push((other.clone(), phase.phase_id.clone()));
            }
            active.insert(phase.phase_id.clone());
            self.max_active.fetch_max(active.len(), Ordering::SeqCst);
        }

        if !self.build_delay.is_zero() {
            tokio::time::sleep(self.build_delay).await;
        }
        self.active.lock().unwrap().remove(&phase.phase_id);

        if self.always_fail.contains(&phase.phase_id) {
            return Ok(PhaseOutcome::failure(
                PhaseStatus::Failed,
                "test_failure",
                "assertion failed: expected 3 rows in orders table, found 2",
            )
            .with_tokens(100));
        }
        Ok(Self::next(&self.builds, &phase.phase_id)
            .unwrap_or_else(|| PhaseOutcome::success().with_tokens(100)))
    }

    async fn audit(&self, phase: &Phase) -> Result<PhaseOutcome, CollaboratorError> {
        Ok(Self::next(&self.audits, &phase.phase_id).unwrap_or_else(PhaseOutcome::success))
    }
}

/// Reporter recording every status it receives.
#[derive(Default)]
pub struct RecordingReporter {
    updates: Mutex<Vec<(String, PhaseStatus)>>,
}

impl RecordingReporter {
    pub fn statuses_for(&self, phase_id: &str) -> Vec<PhaseStatus> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == phase_id)
            .map(|(_, status)| *status)
            .collect()
    }

    pub fn all(&self) -> Vec<PhaseStatus> {
        self.updates.lock().unwrap().iter().map(|(_, s)| *s).collect()
    }
}

#[async_trait]
impl StatusReporter for RecordingReporter {
    async fn update_status(&self, _run_id: &str, phase_id: &str, status: PhaseStatus) -> bool {
        self.updates
            .lock()
            .unwrap()
            .push((phase_id.to_string(), status));
        true
    }
}

/// Escalator that always picks the same stronger model.
pub struct StrongerModel;

#[async_trait]
impl ModelEscalator for StrongerModel {
    async fn escalate(&self, _phase: &Phase) -> Result<ModelSelection, CollaboratorError> {
        Ok(ModelSelection {
            model: "large".to_string(),
            reason: Some("repeated failures".to_string()),
        })
    }
}

/// State machine config with no sleeps.
pub fn fast_config() -> StateMachineConfig {
    StateMachineConfig::new()
        .with_infra_retry_backoff(Duration::ZERO)
        .with_status_retry(3, Duration::ZERO)
}

pub fn register(machine: &PhaseStateMachine, phases: &[(&str, &[&str])]) {
    for (id, scope) in phases {
        machine
            .register_phase(Phase::new(*id, scope.iter().copied()))
            .unwrap();
    }
}

/// Machine over `runner` with an unlimited budget and fast retries.
pub fn machine(runner: Arc<TrackingRunner>) -> PhaseStateMachine {
    PhaseStateMachine::builder("run-it", runner)
        .config(fast_config())
        .budget_config(RunBudgetConfig::unlimited())
        .build()
}
