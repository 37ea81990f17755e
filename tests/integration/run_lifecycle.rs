//! End-to-end run tests: evidence, metrics, stuck handling and health caps.

use std::sync::Arc;

use phaseward::evidence::{EvidenceKind, EvidenceStoreConfig, LifecycleEvent, LifecycleEventType};
use phaseward::health::HealthBudgetConfig;
use phaseward::{
    EvidenceWriter, OrchestratorConfig, ParallelExecutionScheduler, PhaseOutcome,
    PhaseStateMachine, PhaseStatus, RunBudgetConfig, RunMetricsStore, SchedulerConfig,
    StuckDecision,
};
use tempfile::TempDir;

use crate::common::{fast_config, register, RecordingReporter, StrongerModel, TrackingRunner};

fn lifecycle_events(writer: &EvidenceWriter) -> Vec<(EvidenceKind, LifecycleEvent)> {
    writer
        .store()
        .read_records(writer.run_id())
        .unwrap()
        .into_iter()
        .filter(|record| record.kind != EvidenceKind::Metrics)
        .map(|record| {
            let event: LifecycleEvent = serde_json::from_value(record.payload).unwrap();
            (record.kind, event)
        })
        .collect()
}

#[tokio::test]
async fn test_run_writes_evidence_and_metrics() {
    let temp_dir = TempDir::new().unwrap();
    let writer = Arc::new(
        EvidenceWriter::try_new(temp_dir.path(), "run-evidence", EvidenceStoreConfig::new(30))
            .unwrap(),
    );
    let runner = Arc::new(TrackingRunner::new().fail_build(
        "P2",
        PhaseOutcome::failure(PhaseStatus::Failed, "build_failure", "linker error").with_tokens(50),
    ));
    let machine = PhaseStateMachine::builder("run-evidence", runner)
        .config(fast_config())
        .budget_config(RunBudgetConfig::unlimited())
        .evidence(writer.clone())
        .build();
    register(&machine, &[("P1", &["src/a/"]), ("P2", &["src/b/"])]);

    let store = RunMetricsStore::new(temp_dir.path()).unwrap();
    let scheduler = ParallelExecutionScheduler::new(SchedulerConfig::default(), Arc::new(machine))
        .with_metrics_store(store.clone());
    let report = scheduler.run_until_idle().await.unwrap();

    assert_eq!(report.completed(), 2);
    assert!(report.abort.is_none());
    assert_eq!(report.executions.len(), 3);
    let p2 = report.phases.iter().find(|p| p.phase_id == "P2").unwrap();
    assert_eq!(p2.loop_state.iterations_used, 2);
    assert_eq!(p2.loop_state.consecutive_failures, 0);

    let events = lifecycle_events(&writer);
    assert_eq!(events.first().unwrap().1.event_type, LifecycleEventType::RunStart);
    assert_eq!(events.last().unwrap().1.event_type, LifecycleEventType::RunComplete);
    let p2_failed = events.iter().any(|(_, e)| {
        e.phase_id.as_deref() == Some("P2") && e.to_status == Some(PhaseStatus::Failed)
    });
    assert!(p2_failed);

    let metrics_records = writer
        .store()
        .read_kind("run-evidence", EvidenceKind::Metrics)
        .unwrap();
    assert_eq!(metrics_records.len(), 1);
    assert_eq!(metrics_records[0].payload["phases_completed"], 2);

    let manifest = writer.store().manifest("run-evidence").unwrap().unwrap();
    assert!(manifest.is_complete());
    assert_eq!(manifest.abort_reason, None);
    assert_eq!(manifest.count(EvidenceKind::Metrics), 1);

    let saved = store.load("run-evidence").unwrap().unwrap();
    assert_eq!(saved.phases_completed, 2);
    assert_eq!(saved.health.total_failures, 1);
    assert_eq!(saved.abort_reason, None);
    assert_eq!(report.metrics.run_id, "run-evidence");
}

#[tokio::test]
async fn test_persistent_failure_replans_escalates_then_stops() {
    let temp_dir = TempDir::new().unwrap();
    let writer = Arc::new(
        EvidenceWriter::try_new(temp_dir.path(), "run-stuck", EvidenceStoreConfig::new(30))
            .unwrap(),
    );
    let runner = Arc::new(TrackingRunner::new().always_fail("P1"));
    let machine = PhaseStateMachine::builder("run-stuck", runner)
        .config(fast_config().with_max_iterations(10))
        .budget_config(RunBudgetConfig::unlimited())
        .model_escalator(Arc::new(StrongerModel))
        .evidence(writer.clone())
        .build();
    register(&machine, &[("P1", &["src/a/"]), ("P2", &["src/b/"])]);

    let scheduler = ParallelExecutionScheduler::new(SchedulerConfig::default(), Arc::new(machine));
    let report = scheduler.run_until_idle().await.unwrap();

    let decisions: Vec<_> = report.executions.iter().filter_map(|e| e.decision).collect();
    assert_eq!(
        decisions,
        vec![
            StuckDecision::Replan,
            StuckDecision::EscalateModel,
            StuckDecision::Stop
        ]
    );

    let abort = report.abort.clone().unwrap();
    assert!(!abort.needs_review);
    assert!(abort.reason.contains("REPEATED_FAILURES"));
    assert!(abort.reason.contains("budget"));

    let p1 = report.phases.iter().find(|p| p.phase_id == "P1").unwrap();
    assert_eq!(p1.status, PhaseStatus::Skipped);
    assert_eq!(p1.loop_state.escalations_used, 1);
    assert!(p1.loop_state.replan_attempted);
    assert_eq!(p1.model_selection.as_ref().unwrap().model, "large");
    let p2 = report.phases.iter().find(|p| p.phase_id == "P2").unwrap();
    assert_eq!(p2.status, PhaseStatus::Queued);

    assert_eq!(report.metrics.decision_count(StuckDecision::Stop), 1);
    let decision_records = lifecycle_events(&writer)
        .into_iter()
        .filter(|(kind, _)| *kind == EvidenceKind::Decision)
        .count();
    assert_eq!(decision_records, 3);
    let manifest = writer.store().manifest("run-stuck").unwrap().unwrap();
    assert!(manifest.abort_reason.unwrap().contains("REPEATED_FAILURES"));
}

#[tokio::test]
async fn test_health_cap_aborts_and_flags_for_review() {
    let runner = Arc::new(TrackingRunner::new().always_fail("P1").always_fail("P2"));
    let machine = PhaseStateMachine::builder("run-health", runner)
        .config(fast_config())
        .health_config(HealthBudgetConfig::new().with_total_cap(2))
        .build();
    register(&machine, &[("P1", &["src/a/"]), ("P2", &["src/b/"])]);

    let scheduler = ParallelExecutionScheduler::new(SchedulerConfig::default(), Arc::new(machine));
    let report = scheduler.run_until_idle().await.unwrap();

    let abort = report.abort.unwrap();
    assert!(abort.needs_review);
    assert_eq!(report.metrics.health.total_failures, 2);
    let p1 = report.phases.iter().find(|p| p.phase_id == "P1").unwrap();
    assert_eq!(p1.status, PhaseStatus::Failed);
    assert!(p1.last_reason.as_ref().unwrap().contains("health budget"));
}

#[tokio::test]
async fn test_reporter_only_sees_external_statuses() {
    let reporter = Arc::new(RecordingReporter::default());
    let runner = Arc::new(TrackingRunner::new().reject_audit("P1"));
    let machine = PhaseStateMachine::builder("run-report", runner)
        .config(fast_config())
        .status_reporter(reporter.clone())
        .build();
    register(&machine, &[("P1", &["src/a/"])]);

    let scheduler = ParallelExecutionScheduler::new(SchedulerConfig::default(), Arc::new(machine));
    let report = scheduler.run_until_idle().await.unwrap();

    assert_eq!(report.completed(), 1);
    assert!(!reporter.all().contains(&PhaseStatus::Blocked));
    assert_eq!(
        reporter.statuses_for("P1"),
        vec![
            PhaseStatus::Executing,
            PhaseStatus::Gate,
            PhaseStatus::Failed,
            PhaseStatus::Queued,
            PhaseStatus::Executing,
            PhaseStatus::Gate,
            PhaseStatus::CiRunning,
            PhaseStatus::Complete
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_built_from_config() {
    let temp_dir = TempDir::new().unwrap();
    let config = OrchestratorConfig::from_toml_str(
        r#"
        [scheduler]
        enabled = true
        max_parallel_phases = 2

        [state_machine]
        infra_retry_backoff = 0
        status_retry_delay = 0

        [evidence]
        enabled = true
        retention_days = 7
        "#,
    )
    .unwrap();

    let runner = Arc::new(TrackingRunner::new());
    let mut builder = config.machine_builder("run-config", runner.clone());
    if let Some(writer) = config.evidence_writer(temp_dir.path(), "run-config").unwrap() {
        builder = builder.evidence(writer);
    }
    let machine = Arc::new(builder.build());
    register(&machine, &[("P1", &["src/a/"]), ("P2", &["src/b/"]), ("P3", &["docs/"])]);

    let scheduler = config.scheduler(machine.clone(), temp_dir.path()).unwrap();
    let report = scheduler.run_until_idle().await.unwrap();

    assert_eq!(report.completed(), 3);
    assert_eq!(report.parallel.executed_in_parallel, 3);
    assert!(machine.phases().is_empty());
    let saved = RunMetricsStore::new(temp_dir.path())
        .unwrap()
        .load("run-config")
        .unwrap();
    assert!(saved.is_some());
    let manifest = machine
        .evidence()
        .unwrap()
        .store()
        .manifest("run-config")
        .unwrap()
        .unwrap();
    assert!(manifest.is_complete());
}
