//! ExecutionStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::*;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Definition not found
    #[error("definition not found: {0}")]
    DefinitionNotFound(Uuid),

    /// Execution not found
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// Step execution not found
    #[error("step execution not found: {0}")]
    StepNotFound(Uuid),

    /// The chat identity already has an active session
    #[error("user {0} already has an active session")]
    SessionExists(String),

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict: expected lock version {expected}, got {actual}")]
    ConcurrencyConflict { expected: i32, actual: i32 },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Durable state behind the workflow engine.
///
/// Every execution update goes through [`ExecutionStore::update_execution`]
/// with the lock version the caller read; the store rejects stale writers
/// with [`StoreError::ConcurrencyConflict`], which is how exactly-once
/// advancement survives concurrent signals.
///
/// The `claim_*` methods are the sweep side: they select due rows with
/// `FOR UPDATE SKIP LOCKED` semantics and stamp a lease so overlapping
/// worker instances never process the same row twice within a lease window.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    // Definitions

    async fn insert_definition(&self, input: CreateDefinition)
        -> Result<DefinitionRow, StoreError>;

    async fn get_definition(&self, id: Uuid) -> Result<DefinitionRow, StoreError>;

    // Executions

    async fn create_execution(&self, input: CreateExecution) -> Result<ExecutionRow, StoreError>;

    async fn get_execution(&self, id: Uuid) -> Result<ExecutionRow, StoreError>;

    /// Compare-and-swap update. Succeeds only when the stored lock version
    /// equals `expected_version`; the returned row carries the new version.
    async fn update_execution(
        &self,
        id: Uuid,
        expected_version: i32,
        update: UpdateExecution,
    ) -> Result<ExecutionRow, StoreError>;

    /// Execution currently waiting on the given e-form instance, if any
    async fn find_by_form_instance(
        &self,
        form_instance_id: Uuid,
    ) -> Result<Option<ExecutionRow>, StoreError>;

    /// Execution currently waiting on the given callback correlation id
    async fn find_by_callback(
        &self,
        correlation_id: Uuid,
    ) -> Result<Option<ExecutionRow>, StoreError>;

    // Step executions

    /// Insert a step attempt; the store assigns the next attempt number
    /// for the (execution, step) pair.
    async fn create_step_execution(
        &self,
        input: CreateStepExecution,
    ) -> Result<StepExecutionRow, StoreError>;

    async fn close_step_execution(
        &self,
        id: Uuid,
        status: &str,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    /// The execution's single non-terminal step attempt, if any
    async fn get_open_step(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<StepExecutionRow>, StoreError>;

    async fn list_step_executions(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<StepExecutionRow>, StoreError>;

    // Message validations (write-once audit trail)

    async fn record_message_validation(
        &self,
        input: CreateMessageValidation,
    ) -> Result<MessageValidationRow, StoreError>;

    async fn list_message_validations(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<MessageValidationRow>, StoreError>;

    // User sessions

    /// Bind a chat identity to an execution. Fails with
    /// [`StoreError::SessionExists`] when the identity is already bound.
    async fn attach_session(&self, input: CreateSession) -> Result<UserSessionRow, StoreError>;

    async fn resolve_session(&self, user_id: &str) -> Result<Option<UserSessionRow>, StoreError>;

    /// Returns true when a session was removed
    async fn detach_session(&self, user_id: &str) -> Result<bool, StoreError>;

    /// Remove every session bound to the execution; returns the count
    async fn detach_sessions_for_execution(&self, execution_id: Uuid) -> Result<u64, StoreError>;

    async fn touch_session(&self, user_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    // Sweep claims

    /// Claim waiting executions whose deadline has passed, stamping a
    /// sweep lease of `lease` from `now`. Rows under an unexpired lease
    /// are skipped.
    async fn claim_due_waits(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<ExecutionRow>, StoreError>;

    /// Claim in-flight executions whose whole-execution overdue stamp has
    /// passed and that have not been notified yet.
    async fn claim_overdue_starts(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<ExecutionRow>, StoreError>;
}
