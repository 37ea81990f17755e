use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::{debug, warn};

use crate::budget::BudgetSnapshot;
use crate::evidence::config::EvidenceStoreConfig;
use crate::evidence::lifecycle::{LifecycleEvent, LifecycleEventType};
use crate::evidence::record::{EvidenceKind, EvidenceRecord};
use crate::evidence::store::{EvidenceResult, EvidenceStore};
use crate::flaw::ErrorPattern;
use crate::health::HealthBudget;
use crate::phase::PhaseStatus;
use crate::policy::StuckResolutionDecision;

/// Evidence writer that records run events to durable storage.
///
/// Writes are best effort: failures are logged and never interrupt the run.
/// Shared by every worker of a run; appends are serialized internally.
#[derive(Debug)]
pub struct EvidenceWriter {
    run_id: String,
    store: EvidenceStore,
    write_lock: Mutex<()>,
}

impl EvidenceWriter {
    /// Open the store for `run_id`, pruning other runs past retention.
    pub fn try_new(
        base_dir: &Path,
        run_id: impl Into<String>,
        config: EvidenceStoreConfig,
    ) -> EvidenceResult<Self> {
        let run_id = run_id.into();
        let store = EvidenceStore::new(base_dir, config)?;
        match store.prune_expired(&run_id) {
            Ok(pruned) if !pruned.is_empty() => debug!(?pruned, "Pruned evidence before run"),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "Failed to prune expired evidence"),
        }
        Ok(Self {
            run_id,
            store,
            write_lock: Mutex::new(()),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn store(&self) -> &EvidenceStore {
        &self.store
    }

    pub fn emit_run_start(&self) {
        let event = LifecycleEvent::new(LifecycleEventType::RunStart, self.run_id.clone());
        self.write_event(EvidenceKind::Lifecycle, &event);
    }

    pub fn emit_transition(
        &self,
        phase_id: &str,
        from: PhaseStatus,
        to: PhaseStatus,
        reason: Option<&str>,
    ) {
        let mut event = LifecycleEvent::new(LifecycleEventType::PhaseTransition, self.run_id.clone())
            .with_phase(phase_id);
        event.from_status = Some(from);
        event.to_status = Some(to);
        event.reason = reason.map(str::to_string);
        self.write_event(EvidenceKind::Lifecycle, &event);
    }

    pub fn emit_decision(
        &self,
        phase_id: &str,
        decision: &StuckResolutionDecision,
        budget: Option<BudgetSnapshot>,
    ) {
        let mut event = LifecycleEvent::new(LifecycleEventType::Decision, self.run_id.clone())
            .with_phase(phase_id)
            .with_reason(decision.rationale.clone());
        event.decision = Some(decision.clone());
        event.budget = budget;
        self.write_event(EvidenceKind::Decision, &event);
    }

    pub fn emit_flaw(&self, phase_id: &str, pattern: &ErrorPattern) {
        let mut event = LifecycleEvent::new(LifecycleEventType::FlawDetected, self.run_id.clone())
            .with_phase(phase_id);
        event.pattern = Some(pattern.clone());
        self.write_event(EvidenceKind::Flaw, &event);
    }

    pub fn emit_run_complete(
        &self,
        reason: Option<&str>,
        health: HealthBudget,
        budget: Option<BudgetSnapshot>,
    ) {
        let mut event = LifecycleEvent::new(LifecycleEventType::RunComplete, self.run_id.clone());
        event.reason = reason.map(str::to_string);
        event.health = Some(health);
        event.budget = budget;
        self.write_event(EvidenceKind::Lifecycle, &event);

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(err) = self.store.complete_run(&self.run_id, reason) {
            warn!(run_id = %self.run_id, error = %err, "Failed to mark evidence run complete");
        }
    }

    /// Store an arbitrary serializable payload under `kind`.
    pub fn write_payload<T: serde::Serialize>(&self, kind: EvidenceKind, payload: &T) {
        self.write_event(kind, payload);
    }

    fn write_event<T: serde::Serialize>(&self, kind: EvidenceKind, event: &T) {
        let payload: Value = match serde_json::to_value(event) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "Failed to serialize evidence event");
                return;
            }
        };

        let record = EvidenceRecord::new(self.run_id.clone(), kind, payload);
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(err) = self.store.append_record(&record) {
            warn!(
                runs_dir = %self.store.runs_dir().display(),
                error = %err,
                "Failed to write evidence event"
            );
        }
    }
}

pub fn generate_run_id() -> String {
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let pid = std::process::id();
    format!("run-{}-{}", timestamp_ms, pid)
}
