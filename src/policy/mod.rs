//! Stuck-handling policy.
//!
//! When ordinary retry has not resolved a phase, [`StuckHandlingPolicy::decide`]
//! picks one remedy from a cost ladder: replan first, escalate the model only
//! with materially more headroom, narrow the scope when the budget is nearly
//! gone, and stop once the single escalation has been spent.
//!
//! The two floors are fixed. Between them only `STOP` is reachable, which
//! keeps the policy from alternating remedies near the margin.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::phase::LoopState;

/// At or below this remaining fraction only scope reduction is allowed.
pub const LOW_BUDGET_FLOOR: f64 = 0.15;

/// Escalation requires strictly more than this remaining fraction.
pub const ESCALATION_FLOOR: f64 = 0.30;

/// Maximum model escalations per phase.
pub const MAX_ESCALATIONS: u32 = 1;

/// Why a phase needs a policy decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StuckReason {
    RepeatedFailures,
    BudgetExceeded,
    GoalDriftWarning,
}

impl StuckReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StuckReason::RepeatedFailures => "REPEATED_FAILURES",
            StuckReason::BudgetExceeded => "BUDGET_EXCEEDED",
            StuckReason::GoalDriftWarning => "GOAL_DRIFT_WARNING",
        }
    }
}

impl fmt::Display for StuckReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remedy chosen for a stuck phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StuckDecision {
    Replan,
    EscalateModel,
    ReduceScope,
    Stop,
}

impl StuckDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            StuckDecision::Replan => "REPLAN",
            StuckDecision::EscalateModel => "ESCALATE_MODEL",
            StuckDecision::ReduceScope => "REDUCE_SCOPE",
            StuckDecision::Stop => "STOP",
        }
    }
}

impl fmt::Display for StuckDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A policy decision with the inputs that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StuckResolutionDecision {
    pub decision: StuckDecision,
    pub reason: StuckReason,
    /// Clamped remaining budget fraction the decision was made with.
    pub budget_remaining: f64,
    pub loop_state: LoopState,
    /// Which rule fired.
    pub rationale: String,
}

impl StuckResolutionDecision {
    fn new(
        decision: StuckDecision,
        reason: StuckReason,
        budget_remaining: f64,
        loop_state: LoopState,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            decision,
            reason,
            budget_remaining,
            loop_state,
            rationale: rationale.into(),
        }
    }
}

/// Clamp a budget fraction into [0.0, 1.0]; NaN counts as exhausted.
pub fn clamp_budget(budget_remaining: f64) -> f64 {
    if budget_remaining.is_nan() {
        0.0
    } else {
        budget_remaining.clamp(0.0, 1.0)
    }
}

/// Pure decision function for stuck phases.
#[derive(Debug, Clone, Copy, Default)]
pub struct StuckHandlingPolicy;

impl StuckHandlingPolicy {
    pub fn new() -> Self {
        Self
    }

    /// Decide the next remedy. First matching rule wins.
    pub fn decide(
        &self,
        reason: StuckReason,
        loop_state: &LoopState,
        budget_remaining: f64,
    ) -> StuckResolutionDecision {
        let budget = clamp_budget(budget_remaining);
        let decision = |d: StuckDecision, rationale: String| {
            StuckResolutionDecision::new(d, reason, budget, *loop_state, rationale)
        };

        if reason == StuckReason::GoalDriftWarning {
            return decision(
                StuckDecision::Replan,
                "goal drift detected, replanning regardless of prior attempts".to_string(),
            );
        }

        if budget <= LOW_BUDGET_FLOOR {
            return decision(
                StuckDecision::ReduceScope,
                format!(
                    "budget {:.2} at or below floor {:.2}, reducing scope",
                    budget, LOW_BUDGET_FLOOR
                ),
            );
        }

        if !loop_state.replan_attempted {
            return decision(
                StuckDecision::Replan,
                "no replan attempted yet".to_string(),
            );
        }

        if loop_state.escalations_used >= MAX_ESCALATIONS {
            return decision(
                StuckDecision::Stop,
                format!(
                    "escalation cap reached ({}/{})",
                    loop_state.escalations_used, MAX_ESCALATIONS
                ),
            );
        }

        if budget > ESCALATION_FLOOR {
            return decision(
                StuckDecision::EscalateModel,
                format!(
                    "replan exhausted, budget {:.2} above escalation floor {:.2}",
                    budget, ESCALATION_FLOOR
                ),
            );
        }

        decision(
            StuckDecision::Stop,
            format!(
                "replan exhausted, budget {:.2} not above escalation floor {:.2}",
                budget, ESCALATION_FLOOR
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REASONS: [StuckReason; 3] = [
        StuckReason::RepeatedFailures,
        StuckReason::BudgetExceeded,
        StuckReason::GoalDriftWarning,
    ];

    fn loop_state(replan_attempted: bool, escalations_used: u32) -> LoopState {
        LoopState {
            iterations_used: 4,
            consecutive_failures: 2,
            replan_attempted,
            escalations_used,
        }
    }

    fn decide(reason: StuckReason, state: LoopState, budget: f64) -> StuckDecision {
        StuckHandlingPolicy::new()
            .decide(reason, &state, budget)
            .decision
    }

    #[test]
    fn test_low_budget_reduces_scope_except_goal_drift() {
        for budget in [0.0, 0.05, 0.1, 0.15] {
            for reason in REASONS {
                for replan in [false, true] {
                    for escalations in [0, 1] {
                        let got = decide(reason, loop_state(replan, escalations), budget);
                        let want = if reason == StuckReason::GoalDriftWarning {
                            StuckDecision::Replan
                        } else {
                            StuckDecision::ReduceScope
                        };
                        assert_eq!(got, want, "{reason} budget={budget} replan={replan}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_goal_drift_overrides_prior_replan() {
        let got = decide(StuckReason::GoalDriftWarning, loop_state(true, 1), 0.9);
        assert_eq!(got, StuckDecision::Replan);
    }

    #[test]
    fn test_replan_first() {
        assert_eq!(
            decide(StuckReason::RepeatedFailures, loop_state(false, 0), 0.5),
            StuckDecision::Replan
        );
        // Even past the escalation cap, an unattempted replan comes first.
        assert_eq!(
            decide(StuckReason::BudgetExceeded, loop_state(false, 1), 0.2),
            StuckDecision::Replan
        );
    }

    #[test]
    fn test_escalation_cap_holds_with_ample_budget() {
        assert_eq!(
            decide(StuckReason::RepeatedFailures, loop_state(true, 1), 0.7),
            StuckDecision::Stop
        );
    }

    #[test]
    fn test_escalation_floor_is_strict() {
        assert_eq!(
            decide(StuckReason::RepeatedFailures, loop_state(true, 0), 0.30),
            StuckDecision::Stop
        );
        assert_eq!(
            decide(StuckReason::RepeatedFailures, loop_state(true, 0), 0.31),
            StuckDecision::EscalateModel
        );
    }

    #[test]
    fn test_dead_zone_only_stops() {
        for budget in [0.16, 0.2, 0.25, 0.3] {
            assert_eq!(
                decide(StuckReason::RepeatedFailures, loop_state(true, 0), budget),
                StuckDecision::Stop
            );
        }
    }

    #[test]
    fn test_budget_is_clamped() {
        let policy = StuckHandlingPolicy::new();
        let high = policy.decide(StuckReason::RepeatedFailures, &loop_state(true, 0), 7.5);
        assert_eq!(high.budget_remaining, 1.0);
        assert_eq!(high.decision, StuckDecision::EscalateModel);

        let nan = policy.decide(StuckReason::RepeatedFailures, &loop_state(true, 0), f64::NAN);
        assert_eq!(nan.budget_remaining, 0.0);
        assert_eq!(nan.decision, StuckDecision::ReduceScope);

        let negative = policy.decide(StuckReason::RepeatedFailures, &loop_state(true, 0), -2.0);
        assert_eq!(negative.budget_remaining, 0.0);
    }

    #[test]
    fn test_decision_carries_inputs() {
        let state = loop_state(true, 1);
        let result = StuckHandlingPolicy::new().decide(StuckReason::BudgetExceeded, &state, 0.5);
        assert_eq!(result.reason, StuckReason::BudgetExceeded);
        assert_eq!(result.loop_state, state);
        assert!(result.rationale.contains("escalation cap"));
    }

    #[test]
    fn test_labels() {
        assert_eq!(StuckDecision::EscalateModel.to_string(), "ESCALATE_MODEL");
        assert_eq!(
            serde_json::to_string(&StuckReason::GoalDriftWarning).unwrap(),
            "\"GOAL_DRIFT_WARNING\""
        );
    }
}
