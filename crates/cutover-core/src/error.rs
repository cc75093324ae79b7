//! Error taxonomy for the cutover orchestrator.

use thiserror::Error;

use crate::types::{LifecycleState, RollbackDiagnostics};

/// Result type alias for orchestrator operations.
pub type CutoverResult<T> = Result<T, CutoverError>;

/// Errors raised by the orchestrator and its collaborators.
///
/// Everything except `RollbackFailed` is handled inside the rollout
/// controller by driving the state machine to rollback.
#[derive(Debug, Error)]
pub enum CutoverError {
    #[error("health check against {endpoint} timed out after {attempts} attempts")]
    Timeout { endpoint: String, attempts: u32 },

    #[error("invalid weight {weight}: {reason}")]
    InvalidWeight { weight: u32, reason: String },

    #[error("invalid rollout plan: {0}")]
    InvalidPlan(String),

    #[error("rollout already in progress for service '{0}'")]
    RolloutInProgress(String),

    #[error("environment not found: {0}")]
    NotFound(String),

    #[error("rollback failed, manual intervention required: {diagnostics}")]
    RollbackFailed { diagnostics: Box<RollbackDiagnostics> },

    #[error("rollout aborted by operator")]
    Aborted,

    #[error("invalid lifecycle transition for {environment}: {from} -> {to}")]
    InvalidTransition {
        environment: String,
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("state store error: {0}")]
    State(String),
}

impl CutoverError {
    /// Configuration problems caught before any rollout work starts.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            CutoverError::InvalidPlan(_) | CutoverError::InvalidWeight { .. } | CutoverError::Config(_)
        )
    }
}
