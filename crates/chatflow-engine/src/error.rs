//! Engine error type

use uuid::Uuid;

use chatflow_storage::StoreError;

/// Errors surfaced by the orchestrator and scheduler
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Executions may only start from Active definitions
    #[error("definition {0} is not active")]
    DefinitionNotActive(Uuid),

    /// Trigger values must satisfy the declared variable types
    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// The execution is not waiting for the presented signal
    #[error("execution {0} is not waiting for this signal")]
    ExecutionNotWaiting(Uuid),

    /// The signal lost the optimistic-concurrency race; the execution
    /// already advanced past the step the signal addressed
    #[error("stale signal for execution {0}")]
    StaleSignal(Uuid),

    /// The chat identity is already bound to another execution
    #[error("user {0} already has an active session")]
    SessionBusy(String),

    /// No session maps the sender to a waiting execution
    #[error("no active session for sender {0}")]
    UnknownSender(String),

    /// No waiting execution matches the form instance / callback id
    #[error("no waiting execution for correlation {0}")]
    UnknownCorrelation(Uuid),

    /// Structural definition fault discovered at evaluation time; fatal
    /// for the execution
    #[error("definition error: {0}")]
    Definition(String),

    /// An external collaborator call failed
    #[error("collaborator error: {0}")]
    Collaborator(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Map a CAS conflict on this execution to `StaleSignal`; everything
    /// else passes through.
    pub(crate) fn from_cas(err: StoreError, execution_id: Uuid) -> Self {
        match err {
            StoreError::ConcurrencyConflict { .. } => Self::StaleSignal(execution_id),
            other => Self::Store(other),
        }
    }
}
