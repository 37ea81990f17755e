//! Status to outcome classification for escalation bookkeeping.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::phase::PhaseStatus;

/// Failure outcome recorded against a phase for escalation bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureOutcome {
    AuditorReject,
    PatchApplyError,
    CiFail,
    DeliverablesValidationFailed,
}

impl FailureOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureOutcome::AuditorReject => "auditor_reject",
            FailureOutcome::PatchApplyError => "patch_apply_error",
            FailureOutcome::CiFail => "ci_fail",
            FailureOutcome::DeliverablesValidationFailed => "deliverables_validation_failed",
        }
    }

    /// Classify a typed status. Unmapped statuses count as auditor rejections.
    pub fn from_status(status: PhaseStatus) -> Self {
        match status {
            PhaseStatus::PatchFailed => FailureOutcome::PatchApplyError,
            PhaseStatus::CiFailed => FailureOutcome::CiFail,
            PhaseStatus::DeliverablesValidationFailed => {
                FailureOutcome::DeliverablesValidationFailed
            }
            _ => FailureOutcome::AuditorReject,
        }
    }
}

impl fmt::Display for FailureOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a status label to its outcome label.
///
/// `FAILED` and `BLOCKED` both map to `auditor_reject`, as does any label
/// that is not a known failure status.
pub fn status_to_outcome(status: &str) -> &'static str {
    status
        .parse::<PhaseStatus>()
        .map(FailureOutcome::from_status)
        .unwrap_or(FailureOutcome::AuditorReject)
        .as_str()
}
