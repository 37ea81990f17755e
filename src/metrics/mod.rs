//! Run metrics.
//!
//! Per-phase attempt counts and durations, decision counts and parallel
//! dispatch counters for one run, persisted as a JSON snapshot under
//! `.phaseward/runs/<run_id>.json`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use crate::health::HealthBudget;
use crate::phase::PhaseStatus;
use crate::policy::StuckDecision;

/// Metrics for a single phase within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseMetrics {
    pub phase_id: String,
    /// Number of attempts started for this phase
    pub attempts: u32,
    /// Wall-clock time spent in attempts
    pub duration: Duration,
    /// Last status recorded for the phase
    pub status: PhaseStatus,
    /// Timestamp when the first attempt started
    pub started_at: SystemTime,
    /// Timestamp when the phase reached a terminal status
    pub completed_at: Option<SystemTime>,
    /// Reason attached to the terminal status
    pub reason: Option<String>,
}

impl PhaseMetrics {
    fn new(phase_id: impl Into<String>) -> Self {
        Self {
            phase_id: phase_id.into(),
            attempts: 0,
            duration: Duration::ZERO,
            status: PhaseStatus::Queued,
            started_at: SystemTime::now(),
            completed_at: None,
            reason: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == PhaseStatus::Complete
    }
}

/// Aggregated metrics for a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Unique run identifier
    pub run_id: String,
    /// Timestamp when run started
    pub started_at: SystemTime,
    /// Timestamp when metrics snapshot was recorded
    pub recorded_at: SystemTime,
    /// Total run duration
    pub run_duration: Duration,
    /// Number of phases registered for the run
    pub expected_phases: u32,
    /// Number of phases with at least one attempt
    pub phases_attempted: u32,
    /// Number of phases completed successfully
    pub phases_completed: u32,
    /// Number of phases that ended FAILED
    pub phases_failed: u32,
    /// Number of phases that ended SKIPPED
    pub phases_skipped: u32,
    /// Total retry count across phases
    pub retries: u32,
    /// Stuck-handling decisions keyed by label
    pub decisions: BTreeMap<String, u32>,
    /// Parallel batches dispatched
    pub parallel_batches: u32,
    /// Phases executed as part of a parallel batch
    pub parallel_executed: u32,
    /// Queued phases left out of a parallel batch due to scope overlap
    pub parallel_skipped: u32,
    /// Health counters at the time of the snapshot
    pub health: HealthBudget,
    /// Reason the run was aborted, if it was
    pub abort_reason: Option<String>,
    /// Detailed phase metrics
    pub phases: Vec<PhaseMetrics>,
}

impl RunMetrics {
    /// Fraction of attempted phases that completed.
    pub fn success_rate(&self) -> f64 {
        if self.phases_attempted == 0 {
            0.0
        } else {
            self.phases_completed as f64 / self.phases_attempted as f64
        }
    }

    /// Count of a given decision.
    pub fn decision_count(&self, decision: StuckDecision) -> u32 {
        self.decisions
            .get(decision.as_str())
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Debug)]
struct RunMetricsState {
    run_id: String,
    started_at: SystemTime,
    started_instant: Instant,
    expected_phases: usize,
    phases: HashMap<String, PhaseMetrics>,
    open_attempts: HashMap<String, Instant>,
    decisions: BTreeMap<String, u32>,
    parallel_batches: u32,
    parallel_executed: u32,
    parallel_skipped: u32,
}

/// Thread-safe run metrics collector.
#[derive(Debug, Clone)]
pub struct RunMetricsCollector {
    inner: Arc<Mutex<RunMetricsState>>,
}

impl RunMetricsCollector {
    /// Create a new run metrics collector.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RunMetricsState {
                run_id: run_id.into(),
                started_at: SystemTime::now(),
                started_instant: Instant::now(),
                expected_phases: 0,
                phases: HashMap::new(),
                open_attempts: HashMap::new(),
                decisions: BTreeMap::new(),
                parallel_batches: 0,
                parallel_executed: 0,
                parallel_skipped: 0,
            })),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut RunMetricsState) -> R) -> R {
        let mut state = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    pub fn run_id(&self) -> String {
        self.with_state(|state| state.run_id.clone())
    }

    /// Update the expected number of phases for the run.
    pub fn set_expected_phases(&self, expected_phases: usize) {
        self.with_state(|state| state.expected_phases = expected_phases);
    }

    /// Record the start of an attempt.
    pub fn start_attempt(&self, phase_id: &str) {
        self.with_state(|state| {
            let entry = state
                .phases
                .entry(phase_id.to_string())
                .or_insert_with(|| PhaseMetrics::new(phase_id));
            entry.attempts += 1;
            entry.status = PhaseStatus::Executing;
            state
                .open_attempts
                .insert(phase_id.to_string(), Instant::now());
        });
    }

    /// Record the status an attempt ended in.
    pub fn finish_attempt(&self, phase_id: &str, status: PhaseStatus) {
        self.with_state(|state| {
            let elapsed = state
                .open_attempts
                .remove(phase_id)
                .map(|started| started.elapsed())
                .unwrap_or_default();
            let entry = state
                .phases
                .entry(phase_id.to_string())
                .or_insert_with(|| PhaseMetrics::new(phase_id));
            entry.duration += elapsed;
            entry.status = status;
        });
    }

    /// Record a terminal status for a phase.
    pub fn complete_phase(&self, phase_id: &str, status: PhaseStatus, reason: Option<String>) {
        self.with_state(|state| {
            let entry = state
                .phases
                .entry(phase_id.to_string())
                .or_insert_with(|| PhaseMetrics::new(phase_id));
            entry.status = status;
            entry.completed_at = Some(SystemTime::now());
            entry.reason = reason;
        });
    }

    /// Return a phase to the queue, undoing any terminal status it recorded.
    pub fn requeue_phase(&self, phase_id: &str) {
        self.with_state(|state| {
            if let Some(entry) = state.phases.get_mut(phase_id) {
                entry.status = PhaseStatus::Queued;
                entry.completed_at = None;
                entry.reason = None;
            }
        });
    }

    /// Count a stuck-handling decision.
    pub fn record_decision(&self, decision: StuckDecision) {
        self.with_state(|state| {
            *state
                .decisions
                .entry(decision.as_str().to_string())
                .or_insert(0) += 1;
        });
    }

    /// Count a parallel batch.
    pub fn record_parallel_batch(&self, executed: usize, skipped: usize) {
        self.with_state(|state| {
            state.parallel_batches += 1;
            state.parallel_executed += executed as u32;
            state.parallel_skipped += skipped as u32;
        });
    }

    /// Build a run metrics snapshot.
    pub fn finish(&self, health: HealthBudget, abort_reason: Option<String>) -> RunMetrics {
        self.with_state(|state| {
            let mut phases: Vec<PhaseMetrics> = state.phases.values().cloned().collect();
            phases.sort_by(|a, b| a.phase_id.cmp(&b.phase_id));

            let count = |status: PhaseStatus| {
                phases.iter().filter(|p| p.status == status).count() as u32
            };

            RunMetrics {
                run_id: state.run_id.clone(),
                started_at: state.started_at,
                recorded_at: SystemTime::now(),
                run_duration: state.started_instant.elapsed(),
                expected_phases: state.expected_phases as u32,
                phases_attempted: phases.iter().filter(|p| p.attempts > 0).count() as u32,
                phases_completed: count(PhaseStatus::Complete),
                phases_failed: count(PhaseStatus::Failed),
                phases_skipped: count(PhaseStatus::Skipped),
                retries: phases.iter().map(|p| p.attempts.saturating_sub(1)).sum(),
                decisions: state.decisions.clone(),
                parallel_batches: state.parallel_batches,
                parallel_executed: state.parallel_executed,
                parallel_skipped: state.parallel_skipped,
                health,
                abort_reason,
                phases,
            }
        })
    }
}

/// Store run metrics snapshots on disk.
#[derive(Debug, Clone)]
pub struct RunMetricsStore {
    runs_dir: PathBuf,
}

impl RunMetricsStore {
    /// Create a new run metrics store rooted at the given base directory.
    pub fn new(base_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let base = base_dir.into();
        let runs_dir = base.join(".phaseward").join("runs");
        std::fs::create_dir_all(&runs_dir)?;
        Ok(Self { runs_dir })
    }

    /// Save run metrics to disk.
    pub fn save(&self, metrics: &RunMetrics) -> io::Result<PathBuf> {
        let file_name = format!("{}.json", metrics.run_id);
        let path = self.runs_dir.join(file_name);
        let temp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(metrics).map_err(io::Error::other)?;
        let mut file = std::fs::File::create(&temp_path)?;
        use std::io::Write;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&temp_path, &path)?;
        Ok(path)
    }

    /// Load run metrics from disk.
    pub fn load(&self, run_id: &str) -> io::Result<Option<RunMetrics>> {
        let file_name = format!("{}.json", run_id);
        let path = self.runs_dir.join(file_name);
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let metrics = serde_json::from_str(&contents).map_err(io::Error::other)?;
                Ok(Some(metrics))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Format run metrics as a human-readable summary.
pub fn format_metrics(metrics: &RunMetrics) -> String {
    let mut output = format!("## Run {}\n\n", metrics.run_id);

    output.push_str(&format!(
        "**Phases**: {} completed, {} failed, {} skipped of {} ({:.0}% success)\n",
        metrics.phases_completed,
        metrics.phases_failed,
        metrics.phases_skipped,
        metrics.expected_phases,
        metrics.success_rate() * 100.0
    ));
    output.push_str(&format!("**Retries**: {}\n", metrics.retries));
    output.push_str(&format!(
        "**Duration**: {:.1}s\n",
        metrics.run_duration.as_secs_f64()
    ));

    if !metrics.decisions.is_empty() {
        let decisions: Vec<String> = metrics
            .decisions
            .iter()
            .map(|(label, count)| format!("{} x{}", label, count))
            .collect();
        output.push_str(&format!("**Decisions**: {}\n", decisions.join(", ")));
    }

    if metrics.parallel_batches > 0 {
        output.push_str(&format!(
            "**Parallel**: {} batches, {} executed, {} skipped\n",
            metrics.parallel_batches, metrics.parallel_executed, metrics.parallel_skipped
        ));
    }

    output.push_str(&format!(
        "**Health**: {} total failures ({} infra, {} patch)\n",
        metrics.health.total_failures,
        metrics.health.infra_failure_count,
        metrics.health.patch_failure_count
    ));

    if let Some(reason) = &metrics.abort_reason {
        output.push_str(&format!("**Aborted**: {}\n", reason));
    }

    output
}
