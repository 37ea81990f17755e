//! Integration tests for scope-isolated parallel dispatch.

use std::sync::Arc;
use std::time::Duration;

use phaseward::parallel::{IsolationLayer, ParallelStats};
use phaseward::{
    Dispatch, IsolationPolicy, ParallelExecutionScheduler, PhaseStatus, SchedulerConfig,
    ScopeIsolationChecker,
};

use crate::common::{machine, register, TrackingRunner};

fn scheduler(
    runner: Arc<TrackingRunner>,
    config: SchedulerConfig,
    phases: &[(&str, &[&str])],
) -> ParallelExecutionScheduler {
    let machine = machine(runner);
    register(&machine, phases);
    ParallelExecutionScheduler::new(config, Arc::new(machine))
        .with_isolation_checker(Arc::new(ScopeIsolationChecker::default()))
}

fn enabled(max: usize) -> SchedulerConfig {
    SchedulerConfig::new()
        .with_enabled(true)
        .with_max_parallel_phases(max)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disjoint_scopes_run_concurrently_in_submission_order() {
    let runner = Arc::new(TrackingRunner::new().with_build_delay(Duration::from_millis(100)));
    let scheduler = scheduler(
        runner.clone(),
        enabled(2),
        &[("P1", &["src/a/"]), ("P2", &["src/b/"])],
    );

    let dispatch = scheduler.dispatch_next().await.unwrap();
    let Dispatch::Parallel(results) = dispatch else {
        panic!("expected a parallel batch, got {:?}", dispatch);
    };

    let summary: Vec<_> = results
        .iter()
        .map(|r| (r.phase_id.as_str(), r.success, r.status))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("P1", true, PhaseStatus::Complete),
            ("P2", true, PhaseStatus::Complete)
        ]
    );
    assert_eq!(runner.max_active(), 2);
    assert!(runner.overlapped("P1", "P2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overlapping_scopes_never_run_together() {
    let runner = Arc::new(TrackingRunner::new().with_build_delay(Duration::from_millis(50)));
    let scheduler = scheduler(
        runner.clone(),
        enabled(3),
        &[("P1", &["src/a/"]), ("P2", &["src/b/"]), ("P3", &["src/a/"])],
    );

    let report = scheduler.run_until_idle().await.unwrap();
    assert_eq!(report.completed(), 3);
    assert!(!runner.overlapped("P1", "P3"));
    assert!(runner.overlapped("P1", "P2"));
    assert_eq!(
        report.parallel,
        ParallelStats {
            batches: 1,
            executed_in_parallel: 2,
            skipped_in_parallel: 1
        }
    );
    assert_eq!(report.metrics.parallel_batches, 1);
    assert_eq!(report.metrics.parallel_skipped, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_pool_bounds_concurrency() {
    let runner = Arc::new(TrackingRunner::new().with_build_delay(Duration::from_millis(50)));
    let scheduler = scheduler(
        runner.clone(),
        enabled(2),
        &[
            ("P1", &["src/a/"]),
            ("P2", &["src/b/"]),
            ("P3", &["src/c/"]),
            ("P4", &["src/d/"]),
        ],
    );

    let Dispatch::Parallel(results) = scheduler.dispatch_next().await.unwrap() else {
        panic!("expected a parallel batch");
    };
    let ids: Vec<_> = results.iter().map(|r| r.phase_id.as_str()).collect();
    assert_eq!(ids, vec!["P1", "P2", "P3", "P4"]);
    assert!(runner.max_active() <= 2);
    assert_eq!(runner.calls(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disabled_scheduler_runs_sequentially() {
    let runner = Arc::new(TrackingRunner::new().with_build_delay(Duration::from_millis(20)));
    let scheduler = scheduler(
        runner.clone(),
        SchedulerConfig::default(),
        &[("P1", &["src/a/"]), ("P2", &["src/b/"])],
    );

    let report = scheduler.run_until_idle().await.unwrap();
    assert_eq!(report.completed(), 2);
    assert_eq!(runner.max_active(), 1);
    assert_eq!(report.parallel, ParallelStats::default());
    let order: Vec<_> = report.executions.iter().map(|e| e.phase_id.as_str()).collect();
    assert_eq!(order, vec!["P1", "P2"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_isolation_policy_ceiling_forces_sequential() {
    let runner = Arc::new(TrackingRunner::new().with_build_delay(Duration::from_millis(20)));
    let machine = machine(runner.clone());
    register(&machine, &[("P1", &["src/a/"]), ("P2", &["src/b/"])]);
    let policy = IsolationPolicy::default().with_ceiling(IsolationLayer::Workspace, 1);
    let scheduler = ParallelExecutionScheduler::new(enabled(2), Arc::new(machine))
        .with_isolation_checker(Arc::new(ScopeIsolationChecker::new(policy)));

    let report = scheduler.run_until_idle().await.unwrap();
    assert_eq!(report.completed(), 2);
    assert_eq!(runner.max_active(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_empty_scope_runs_alone() {
    let runner = Arc::new(TrackingRunner::new().with_build_delay(Duration::from_millis(20)));
    let scheduler = scheduler(
        runner.clone(),
        enabled(2),
        &[("P1", &[]), ("P2", &["src/b/"])],
    );

    let report = scheduler.run_until_idle().await.unwrap();
    assert_eq!(report.completed(), 2);
    assert!(!runner.overlapped("P1", "P2"));
}
