use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::budget::BudgetSnapshot;
use crate::flaw::ErrorPattern;
use crate::health::HealthBudget;
use crate::phase::PhaseStatus;
use crate::policy::StuckResolutionDecision;

const SCHEMA_VERSION: &str = "v1";

/// Lifecycle event types for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEventType {
    RunStart,
    PhaseTransition,
    Decision,
    FlawDetected,
    RunComplete,
}

/// Lifecycle event payload stored as evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub schema_version: String,
    pub event_type: LifecycleEventType,
    pub timestamp: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_status: Option<PhaseStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_status: Option<PhaseStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<StuckResolutionDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<ErrorPattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthBudget>,
}

impl LifecycleEvent {
    pub fn new(event_type: LifecycleEventType, run_id: impl Into<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            event_type,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            run_id: run_id.into(),
            phase_id: None,
            from_status: None,
            to_status: None,
            reason: None,
            decision: None,
            pattern: None,
            budget: None,
            health: None,
        }
    }

    pub fn with_phase(mut self, phase_id: impl Into<String>) -> Self {
        self.phase_id = Some(phase_id.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}
