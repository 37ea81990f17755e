//! Orchestrator configuration.
//!
//! One TOML document with a table per component. Every table and field is
//! optional; missing values take the component defaults. Environment
//! variables override file values, e.g.
//! `PHASEWARD__SCHEDULER__MAX_PARALLEL_PHASES=4`.
//!
//! ```toml
//! [breaker]
//! failure_threshold = 3
//! timeout = 30          # seconds
//!
//! [health]
//! total_cap = 25
//!
//! [scheduler]
//! enabled = true
//! max_parallel_phases = 3
//! ```

use std::path::Path;
use std::sync::Arc;

use ::config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::budget::RunBudgetConfig;
use crate::error::OrchestratorResult;
use crate::evidence::{EvidenceStoreConfig, EvidenceWriter};
use crate::flaw::FlawDetectorConfig;
use crate::health::HealthBudgetConfig;
use crate::logging::LoggingConfig;
use crate::metrics::RunMetricsStore;
use crate::parallel::{
    IsolationPolicy, ParallelExecutionScheduler, SchedulerConfig, ScopeIsolationChecker,
};
use crate::phase::{PhaseRunner, PhaseStateMachine, PhaseStateMachineBuilder, StateMachineConfig};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "PHASEWARD";

/// Separator between nested keys in environment overrides.
pub const ENV_SEPARATOR: &str = "__";

/// Serde adapter storing a `Duration` as fractional seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

/// Configuration for every component of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub breaker: CircuitBreakerConfig,
    pub health: HealthBudgetConfig,
    pub flaw: FlawDetectorConfig,
    pub scheduler: SchedulerConfig,
    pub isolation: IsolationPolicy,
    pub budget: RunBudgetConfig,
    pub state_machine: StateMachineConfig,
    pub evidence: EvidenceStoreConfig,
    pub logging: LoggingConfig,
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a TOML file layered under `PHASEWARD__*` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> OrchestratorResult<Self> {
        let path = path.as_ref();
        let settings = Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(true))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?;
        let config: Self = settings.try_deserialize()?;
        debug!(path = %path.display(), "Loaded orchestrator config");
        Ok(config)
    }

    /// Parse TOML text, without environment overrides.
    pub fn from_toml_str(text: &str) -> OrchestratorResult<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_health(mut self, health: HealthBudgetConfig) -> Self {
        self.health = health;
        self
    }

    pub fn with_flaw(mut self, flaw: FlawDetectorConfig) -> Self {
        self.flaw = flaw;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationPolicy) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_budget(mut self, budget: RunBudgetConfig) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_state_machine(mut self, state_machine: StateMachineConfig) -> Self {
        self.state_machine = state_machine;
        self
    }

    pub fn with_evidence(mut self, evidence: EvidenceStoreConfig) -> Self {
        self.evidence = evidence;
        self
    }

    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    /// State machine builder carrying every component config.
    pub fn machine_builder(
        &self,
        run_id: impl Into<String>,
        runner: Arc<dyn PhaseRunner>,
    ) -> PhaseStateMachineBuilder {
        PhaseStateMachine::builder(run_id, runner)
            .config(self.state_machine.clone())
            .health_config(self.health.clone())
            .flaw_config(self.flaw.clone())
            .budget_config(self.budget.clone())
            .breakers(Arc::new(CircuitBreakerRegistry::new(self.breaker.clone())))
    }

    /// Evidence writer under `base_dir`, or `None` when evidence is disabled.
    pub fn evidence_writer(
        &self,
        base_dir: &Path,
        run_id: &str,
    ) -> OrchestratorResult<Option<Arc<EvidenceWriter>>> {
        if !self.evidence.enabled {
            return Ok(None);
        }
        let writer = EvidenceWriter::try_new(base_dir, run_id, self.evidence.clone())?;
        Ok(Some(Arc::new(writer)))
    }

    /// Scheduler for `machine` with scope isolation and metrics under `base_dir`.
    pub fn scheduler(
        &self,
        machine: Arc<PhaseStateMachine>,
        base_dir: &Path,
    ) -> OrchestratorResult<ParallelExecutionScheduler> {
        Ok(
            ParallelExecutionScheduler::new(self.scheduler.clone(), machine)
                .with_isolation_checker(Arc::new(ScopeIsolationChecker::new(
                    self.isolation.clone(),
                )))
                .with_metrics_store(RunMetricsStore::new(base_dir)?),
        )
    }
}
