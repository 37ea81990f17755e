//! Per-phase error history and approach-flaw detection.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::normalize::normalize_message;
use super::similarity::lcs_ratio;

/// Configuration for approach-flaw detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlawDetectorConfig {
    /// Same-type errors in a row needed before a pattern is reported
    pub trigger_threshold: usize,
    /// Minimum pairwise similarity of normalized messages (0.0 - 1.0)
    pub similarity_threshold: f64,
    /// Messages shorter than this carry no reliable signal
    pub min_message_length: usize,
    /// Error types that prove a flawed approach on first occurrence
    pub fatal_error_types: Vec<String>,
    /// Compare messages, or match on error type only
    pub similarity_enabled: bool,
    /// Records retained per phase
    pub history_limit: usize,
}

impl Default for FlawDetectorConfig {
    fn default() -> Self {
        Self {
            trigger_threshold: 3,
            similarity_threshold: 0.8,
            min_message_length: 30,
            fatal_error_types: Vec::new(),
            similarity_enabled: true,
            history_limit: 20,
        }
    }
}

impl FlawDetectorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the trigger threshold (at least 1).
    pub fn with_trigger_threshold(mut self, threshold: usize) -> Self {
        self.trigger_threshold = threshold.max(1);
        self
    }

    /// Set the similarity threshold.
    pub fn with_similarity_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Set the minimum message length for similarity checks.
    pub fn with_min_message_length(mut self, length: usize) -> Self {
        self.min_message_length = length;
        self
    }

    /// Set the fatal error types.
    pub fn with_fatal_error_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fatal_error_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Enable or disable message similarity checks.
    pub fn with_similarity_enabled(mut self, enabled: bool) -> Self {
        self.similarity_enabled = enabled;
        self
    }

    /// Set the per-phase history limit (never below the trigger threshold).
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    fn effective_history_limit(&self) -> usize {
        self.history_limit.max(self.trigger_threshold).max(1)
    }
}

/// One failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub attempt: u32,
    pub error_type: String,
    pub error_details: String,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(attempt: u32, error_type: impl Into<String>, error_details: impl Into<String>) -> Self {
        Self {
            attempt,
            error_type: error_type.into(),
            error_details: error_details.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A detected approach flaw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub error_type: String,
    pub consecutive_count: usize,
    pub similarity_score: f64,
    pub is_fatal: bool,
}

/// Tracks failures per phase and decides whether they share a root cause.
#[derive(Debug, Default)]
pub struct ApproachFlawDetector {
    config: FlawDetectorConfig,
    histories: Mutex<HashMap<String, VecDeque<ErrorRecord>>>,
}

impl ApproachFlawDetector {
    pub fn new(config: FlawDetectorConfig) -> Self {
        Self {
            config,
            histories: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &FlawDetectorConfig {
        &self.config
    }

    fn histories(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<ErrorRecord>>> {
        self.histories
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a record to the phase's history, dropping the oldest past the limit.
    pub fn record(&self, phase_id: &str, record: ErrorRecord) {
        let limit = self.config.effective_history_limit();
        let mut histories = self.histories();
        let history = histories.entry(phase_id.to_string()).or_default();
        history.push_back(record);
        while history.len() > limit {
            history.pop_front();
        }
    }

    /// Record a failed attempt.
    pub fn record_error(
        &self,
        phase_id: &str,
        attempt: u32,
        error_type: impl Into<String>,
        error_details: impl Into<String>,
    ) {
        self.record(phase_id, ErrorRecord::new(attempt, error_type, error_details));
    }

    /// Copy of the phase's history, oldest first.
    pub fn history(&self, phase_id: &str) -> Vec<ErrorRecord> {
        self.histories()
            .get(phase_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget a phase's history (after a replan).
    pub fn clear_history(&self, phase_id: &str) {
        if self.histories().remove(phase_id).is_some() {
            debug!(phase_id, "Cleared error history");
        }
    }

    /// Decide whether the phase's recent failures indicate a flawed approach.
    pub fn detect_approach_flaw(&self, phase_id: &str) -> Option<ErrorPattern> {
        let history = self.history(phase_id);
        let latest = history.last()?;

        if self
            .config
            .fatal_error_types
            .iter()
            .any(|t| t == &latest.error_type)
        {
            info!(phase_id, error_type = %latest.error_type, "Fatal error type detected");
            return Some(ErrorPattern {
                error_type: latest.error_type.clone(),
                consecutive_count: 1,
                similarity_score: 1.0,
                is_fatal: true,
            });
        }

        let threshold = self.config.trigger_threshold.max(1);
        if history.len() < threshold {
            return None;
        }
        let recent = &history[history.len() - threshold..];
        let error_type = &recent[0].error_type;
        if recent.iter().any(|r| &r.error_type != error_type) {
            return None;
        }

        let all_short = recent
            .iter()
            .all(|r| r.error_details.trim().chars().count() < self.config.min_message_length);
        if !self.config.similarity_enabled || all_short {
            debug!(phase_id, error_type = %error_type, "Type-only flaw match");
            return Some(ErrorPattern {
                error_type: error_type.clone(),
                consecutive_count: threshold,
                similarity_score: 1.0,
                is_fatal: false,
            });
        }

        let normalized: Vec<String> = recent
            .iter()
            .map(|r| normalize_message(&r.error_details))
            .collect();
        let mut min_similarity = 1.0_f64;
        for pair in normalized.windows(2) {
            let similarity = lcs_ratio(&pair[0], &pair[1]);
            if similarity < self.config.similarity_threshold {
                debug!(
                    phase_id,
                    similarity,
                    threshold = self.config.similarity_threshold,
                    "Consecutive errors diverge, no flaw pattern"
                );
                return None;
            }
            min_similarity = min_similarity.min(similarity);
        }

        info!(
            phase_id,
            error_type = %error_type,
            consecutive_count = threshold,
            similarity = min_similarity,
            "Approach flaw detected"
        );
        Some(ErrorPattern {
            error_type: error_type.clone(),
            consecutive_count: threshold,
            similarity_score: min_similarity,
            is_fatal: false,
        })
    }
}
