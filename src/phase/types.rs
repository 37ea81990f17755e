//! Phase data model: statuses, loop counters and collaborator outcomes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseStatus {
    Queued,
    Executing,
    /// Auditor / quality gate review in progress.
    Gate,
    CiRunning,
    Complete,
    Failed,
    /// Quality gate rejection. Reported externally as `FAILED`.
    Blocked,
    Skipped,
    PatchFailed,
    CiFailed,
    DeliverablesValidationFailed,
}

impl PhaseStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [PhaseStatus; 11] = [
        PhaseStatus::Queued,
        PhaseStatus::Executing,
        PhaseStatus::Gate,
        PhaseStatus::CiRunning,
        PhaseStatus::Complete,
        PhaseStatus::Failed,
        PhaseStatus::Blocked,
        PhaseStatus::Skipped,
        PhaseStatus::PatchFailed,
        PhaseStatus::CiFailed,
        PhaseStatus::DeliverablesValidationFailed,
    ];

    /// Stable upper-case label.
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Queued => "QUEUED",
            PhaseStatus::Executing => "EXECUTING",
            PhaseStatus::Gate => "GATE",
            PhaseStatus::CiRunning => "CI_RUNNING",
            PhaseStatus::Complete => "COMPLETE",
            PhaseStatus::Failed => "FAILED",
            PhaseStatus::Blocked => "BLOCKED",
            PhaseStatus::Skipped => "SKIPPED",
            PhaseStatus::PatchFailed => "PATCH_FAILED",
            PhaseStatus::CiFailed => "CI_FAILED",
            PhaseStatus::DeliverablesValidationFailed => "DELIVERABLES_VALIDATION_FAILED",
        }
    }

    /// Status as seen by the persistence boundary. `BLOCKED` folds into `FAILED`.
    pub fn external(&self) -> PhaseStatus {
        match self {
            PhaseStatus::Blocked => PhaseStatus::Failed,
            other => *other,
        }
    }

    /// Terminal statuses trigger the run-summary refresh.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PhaseStatus::Complete | PhaseStatus::Failed | PhaseStatus::Skipped
        )
    }

    /// Statuses that record a failed attempt.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            PhaseStatus::Failed
                | PhaseStatus::Blocked
                | PhaseStatus::PatchFailed
                | PhaseStatus::CiFailed
                | PhaseStatus::DeliverablesValidationFailed
        )
    }

    /// Statuses during which collaborators are working on the phase.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PhaseStatus::Executing | PhaseStatus::Gate | PhaseStatus::CiRunning
        )
    }

    /// Statuses reachable from this one.
    pub fn allowed_transitions(&self) -> Vec<PhaseStatus> {
        use PhaseStatus::*;
        match self {
            Queued => vec![Executing, Skipped],
            Executing => vec![
                Gate,
                Complete,
                Failed,
                Blocked,
                PatchFailed,
                CiFailed,
                DeliverablesValidationFailed,
                Skipped,
            ],
            Gate => vec![
                CiRunning,
                Complete,
                Blocked,
                Failed,
                DeliverablesValidationFailed,
            ],
            CiRunning => vec![Complete, CiFailed, Failed],
            Failed | Blocked | PatchFailed | CiFailed | DeliverablesValidationFailed => {
                vec![Queued, Failed, Skipped]
            }
            Complete | Skipped => vec![],
        }
    }

    /// Whether `to` is a legal next status.
    pub fn can_transition_to(&self, to: PhaseStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        PhaseStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| format!("Unknown phase status: {}", s))
    }
}

/// Per-phase loop counters consulted by the stuck-handling policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopState {
    /// Attempts started for this phase.
    pub iterations_used: u32,
    /// Failed attempts since the last success, replan or escalation.
    pub consecutive_failures: u32,
    /// Whether a replan has been applied.
    pub replan_attempted: bool,
    /// Model escalations applied (capped at 1).
    pub escalations_used: u32,
}

/// Model choice returned by the external model router after an escalation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelection {
    /// Model identifier chosen by the router.
    pub model: String,
    /// Router-provided note on why this model was picked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ModelSelection {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            reason: None,
        }
    }
}

/// One unit of autonomous work with a declared file scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub phase_id: String,
    pub status: PhaseStatus,
    /// Ordered path prefixes the phase may modify.
    pub scope: Vec<String>,
    /// Opaque tag for the external model router.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_category: Option<String>,
    /// Opaque tag for the external model router.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<String>,
    #[serde(default)]
    pub loop_state: LoopState,
    /// Human-readable reason for the latest failure or terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reason: Option<String>,
    /// Model chosen by the last escalation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_selection: Option<ModelSelection>,
}

impl Phase {
    /// Create a queued phase with the given scope.
    pub fn new<I, S>(phase_id: impl Into<String>, scope: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            phase_id: phase_id.into(),
            status: PhaseStatus::Queued,
            scope: scope.into_iter().map(Into::into).collect(),
            task_category: None,
            complexity: None,
            loop_state: LoopState::default(),
            last_reason: None,
            model_selection: None,
        }
    }

    /// Set the task category tag.
    pub fn with_task_category(mut self, category: impl Into<String>) -> Self {
        self.task_category = Some(category.into());
        self
    }

    /// Set the complexity tag.
    pub fn with_complexity(mut self, complexity: impl Into<String>) -> Self {
        self.complexity = Some(complexity.into());
        self
    }

    pub fn is_queued(&self) -> bool {
        self.status == PhaseStatus::Queued
    }
}

/// Result reported by the builder, auditor or CI for one step of an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub success: bool,
    /// Status the collaborator assigns to the step.
    pub status: PhaseStatus,
    /// Error type / category used by the flaw detector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub tokens_used: u64,
    /// Signals that the work has drifted away from the phase goal.
    #[serde(default)]
    pub goal_drift: bool,
}

impl PhaseOutcome {
    /// A passing step.
    pub fn success() -> Self {
        Self {
            success: true,
            status: PhaseStatus::Complete,
            error_type: None,
            message: String::new(),
            tokens_used: 0,
            goal_drift: false,
        }
    }

    /// A failed step with the given status and error type.
    pub fn failure(
        status: PhaseStatus,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            status,
            error_type: Some(error_type.into()),
            message: message.into(),
            tokens_used: 0,
            goal_drift: false,
        }
    }

    /// Set the tokens consumed by the step.
    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }

    /// Mark the outcome as carrying a goal-drift warning.
    pub fn with_goal_drift(mut self) -> Self {
        self.goal_drift = true;
        self
    }

    /// Error type, falling back to the status label.
    pub fn error_type_or_status(&self) -> String {
        self.error_type
            .clone()
            .unwrap_or_else(|| self.status.as_str().to_ascii_lowercase())
    }
}
