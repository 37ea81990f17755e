//! Error types for the orchestration core.

use std::io;

use thiserror::Error;

use crate::evidence::EvidenceError;
use crate::phase::PhaseStatus;

/// Errors raised by the state machine, scheduler and configuration layer.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// No phase with this id is registered for the run.
    #[error("Phase not found: {0}")]
    PhaseNotFound(String),

    /// A phase with this id is already registered.
    #[error("Phase already registered: {0}")]
    DuplicatePhase(String),

    /// The requested status change is not part of the lifecycle.
    #[error("Illegal transition for {phase_id}: {from} -> {to}")]
    IllegalTransition {
        phase_id: String,
        from: PhaseStatus,
        to: PhaseStatus,
    },

    /// The status API rejected every attempt to record a status.
    #[error("Status update for {phase_id} failed after {attempts} attempts")]
    StatusUpdateFailed { phase_id: String, attempts: u32 },

    /// Configuration could not be loaded or deserialized.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// TOML configuration text could not be parsed.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Evidence storage failed.
    #[error("Evidence error: {0}")]
    Evidence(#[from] EvidenceError),

    /// IO error while persisting run artifacts.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for orchestration operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors returned by external collaborators (builder, auditor, CI, model router).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    /// Infrastructure hiccup worth retrying locally (network, rate limit, 5xx).
    #[error("Transient infrastructure error: {0}")]
    Transient(String),

    /// The collaborator refused the request.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl CollaboratorError {
    /// Whether the error should be retried locally before counting it.
    pub fn is_transient(&self) -> bool {
        matches!(self, CollaboratorError::Transient(_))
    }
}
