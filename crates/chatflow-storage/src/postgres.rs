//! PostgreSQL implementation of ExecutionStore
//!
//! Production persistence with:
//! - Optimistic concurrency control via a lock_version column
//! - Sweep claiming with FOR UPDATE SKIP LOCKED plus a lease stamp
//! - Write-once message validation audit rows

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::models::*;
use crate::store::{ExecutionStore, StoreError};

/// PostgreSQL implementation of ExecutionStore
///
/// Uses a connection pool for efficient database access.
///
/// # Example
///
/// ```ignore
/// use chatflow_storage::PostgresExecutionStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/chatflow").await?;
/// let store = PostgresExecutionStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresExecutionStore {
    pool: PgPool,
}

impl PostgresExecutionStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run the embedded migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    #[instrument(skip(self, input))]
    async fn insert_definition(
        &self,
        input: CreateDefinition,
    ) -> Result<DefinitionRow, StoreError> {
        let row = sqlx::query_as::<_, DefinitionRow>(
            r#"
            INSERT INTO chatflow_definitions (id, tenant_id, name, version, status, document)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(input.id)
        .bind(input.tenant_id)
        .bind(&input.name)
        .bind(input.version)
        .bind(&input.status)
        .bind(&input.document)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to insert definition: {}", e);
            db_err(e)
        })?;

        debug!(definition_id = %row.id, version = row.version, "inserted definition");
        Ok(row)
    }

    #[instrument(skip(self))]
    async fn get_definition(&self, id: Uuid) -> Result<DefinitionRow, StoreError> {
        sqlx::query_as::<_, DefinitionRow>(
            "SELECT * FROM chatflow_definitions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(StoreError::DefinitionNotFound(id))
    }

    #[instrument(skip(self, input))]
    async fn create_execution(&self, input: CreateExecution) -> Result<ExecutionRow, StoreError> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            INSERT INTO chatflow_executions
                (id, definition_id, definition_version, status, current_step,
                 variables, waiting_for_user_id, overdue_at)
            VALUES ($1, $2, $3, 'running', 0, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(input.id)
        .bind(input.definition_id)
        .bind(input.definition_version)
        .bind(&input.variables)
        .bind(&input.trigger_user_id)
        .bind(input.overdue_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create execution: {}", e);
            db_err(e)
        })?;

        debug!(execution_id = %row.id, "created execution");
        Ok(row)
    }

    #[instrument(skip(self))]
    async fn get_execution(&self, id: Uuid) -> Result<ExecutionRow, StoreError> {
        sqlx::query_as::<_, ExecutionRow>("SELECT * FROM chatflow_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::ExecutionNotFound(id))
    }

    #[instrument(skip(self, update))]
    async fn update_execution(
        &self,
        id: Uuid,
        expected_version: i32,
        update: UpdateExecution,
    ) -> Result<ExecutionRow, StoreError> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            r#"
            UPDATE chatflow_executions
            SET status = $3,
                current_step = $4,
                variables = $5,
                is_waiting = $6,
                waiting_since = $7,
                last_user_activity = $8,
                current_waiting_step = $9,
                waiting_for_user_id = $10,
                waiting_form_instance_id = $11,
                waiting_callback_id = $12,
                deadline_at = $13,
                retries_sent = $14,
                escalated = $15,
                overdue_notified = $16,
                error = $17,
                ended_at = $18,
                sweep_lease_until = NULL,
                lock_version = lock_version + 1
            WHERE id = $1 AND lock_version = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(expected_version)
        .bind(&update.status)
        .bind(update.current_step)
        .bind(&update.variables)
        .bind(update.is_waiting)
        .bind(update.waiting_since)
        .bind(update.last_user_activity)
        .bind(update.current_waiting_step)
        .bind(&update.waiting_for_user_id)
        .bind(update.waiting_form_instance_id)
        .bind(update.waiting_callback_id)
        .bind(update.deadline_at)
        .bind(update.retries_sent)
        .bind(update.escalated)
        .bind(update.overdue_notified)
        .bind(&update.error)
        .bind(update.ended_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update execution: {}", e);
            db_err(e)
        })?;

        match row {
            Some(row) => {
                debug!(execution_id = %id, lock_version = row.lock_version, "updated execution");
                Ok(row)
            }
            None => {
                // Distinguish a stale writer from a missing row
                let actual = sqlx::query(
                    "SELECT lock_version FROM chatflow_executions WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?
                .ok_or(StoreError::ExecutionNotFound(id))?;

                Err(StoreError::ConcurrencyConflict {
                    expected: expected_version,
                    actual: actual.get("lock_version"),
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn find_by_form_instance(
        &self,
        form_instance_id: Uuid,
    ) -> Result<Option<ExecutionRow>, StoreError> {
        sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT * FROM chatflow_executions
            WHERE waiting_form_instance_id = $1 AND is_waiting
            "#,
        )
        .bind(form_instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    #[instrument(skip(self))]
    async fn find_by_callback(
        &self,
        correlation_id: Uuid,
    ) -> Result<Option<ExecutionRow>, StoreError> {
        sqlx::query_as::<_, ExecutionRow>(
            r#"
            SELECT * FROM chatflow_executions
            WHERE waiting_callback_id = $1 AND is_waiting
            "#,
        )
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    #[instrument(skip(self, input))]
    async fn create_step_execution(
        &self,
        input: CreateStepExecution,
    ) -> Result<StepExecutionRow, StoreError> {
        let row = sqlx::query_as::<_, StepExecutionRow>(
            r#"
            INSERT INTO chatflow_step_executions
                (id, execution_id, step_index, attempt, step_type, status,
                 input, waiting_for_user_id)
            VALUES ($1, $2, $3,
                    (SELECT COALESCE(MAX(attempt), 0) + 1
                     FROM chatflow_step_executions
                     WHERE execution_id = $2 AND step_index = $3),
                    $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.execution_id)
        .bind(input.step_index)
        .bind(&input.step_type)
        .bind(&input.status)
        .bind(&input.input)
        .bind(&input.waiting_for_user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create step execution: {}", e);
            db_err(e)
        })?;

        debug!(
            execution_id = %row.execution_id,
            step_index = row.step_index,
            attempt = row.attempt,
            "created step execution"
        );
        Ok(row)
    }

    #[instrument(skip(self, output))]
    async fn close_step_execution(
        &self,
        id: Uuid,
        status: &str,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE chatflow_step_executions
            SET status = $2, output = $3, error = $4, ended_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(&output)
        .bind(&error)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::StepNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_open_step(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<StepExecutionRow>, StoreError> {
        sqlx::query_as::<_, StepExecutionRow>(
            r#"
            SELECT * FROM chatflow_step_executions
            WHERE execution_id = $1 AND ended_at IS NULL
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    #[instrument(skip(self))]
    async fn list_step_executions(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<StepExecutionRow>, StoreError> {
        sqlx::query_as::<_, StepExecutionRow>(
            r#"
            SELECT * FROM chatflow_step_executions
            WHERE execution_id = $1
            ORDER BY started_at, attempt
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    #[instrument(skip(self, input))]
    async fn record_message_validation(
        &self,
        input: CreateMessageValidation,
    ) -> Result<MessageValidationRow, StoreError> {
        sqlx::query_as::<_, MessageValidationRow>(
            r#"
            INSERT INTO chatflow_message_validations
                (id, execution_id, step_index, sender_id, raw_message,
                 message_type, is_valid, validator_type, processed_data, reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(input.execution_id)
        .bind(input.step_index)
        .bind(&input.sender_id)
        .bind(&input.raw_message)
        .bind(&input.message_type)
        .bind(input.is_valid)
        .bind(&input.validator_type)
        .bind(&input.processed_data)
        .bind(&input.reason)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    #[instrument(skip(self))]
    async fn list_message_validations(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<MessageValidationRow>, StoreError> {
        sqlx::query_as::<_, MessageValidationRow>(
            r#"
            SELECT * FROM chatflow_message_validations
            WHERE execution_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    #[instrument(skip(self, input))]
    async fn attach_session(&self, input: CreateSession) -> Result<UserSessionRow, StoreError> {
        let row = sqlx::query_as::<_, UserSessionRow>(
            r#"
            INSERT INTO chatflow_user_sessions (user_id, execution_id, step_index)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&input.user_id)
        .bind(input.execution_id)
        .bind(input.step_index)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.ok_or(StoreError::SessionExists(input.user_id))
    }

    #[instrument(skip(self))]
    async fn resolve_session(&self, user_id: &str) -> Result<Option<UserSessionRow>, StoreError> {
        sqlx::query_as::<_, UserSessionRow>(
            "SELECT * FROM chatflow_user_sessions WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    #[instrument(skip(self))]
    async fn detach_session(&self, user_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM chatflow_user_sessions WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn detach_sessions_for_execution(&self, execution_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM chatflow_user_sessions WHERE execution_id = $1")
            .bind(execution_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn touch_session(&self, user_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE chatflow_user_sessions SET last_activity_at = $2 WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn claim_due_waits(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<ExecutionRow>, StoreError> {
        let lease_until = now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);

        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            WITH due AS (
                SELECT id FROM chatflow_executions
                WHERE status = 'waiting'
                  AND is_waiting
                  AND deadline_at IS NOT NULL
                  AND deadline_at <= $1
                  AND (sweep_lease_until IS NULL OR sweep_lease_until <= $1)
                ORDER BY deadline_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE chatflow_executions e
            SET sweep_lease_until = $2
            FROM due
            WHERE e.id = due.id
            RETURNING e.*
            "#,
        )
        .bind(now)
        .bind(lease_until)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim due waits: {}", e);
            db_err(e)
        })?;

        if !rows.is_empty() {
            debug!(count = rows.len(), "claimed due waits");
        }
        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn claim_overdue_starts(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<ExecutionRow>, StoreError> {
        let lease_until = now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);

        let rows = sqlx::query_as::<_, ExecutionRow>(
            r#"
            WITH overdue AS (
                SELECT id FROM chatflow_executions
                WHERE status IN ('running', 'waiting')
                  AND overdue_at IS NOT NULL
                  AND overdue_at <= $1
                  AND NOT overdue_notified
                  AND (sweep_lease_until IS NULL OR sweep_lease_until <= $1)
                ORDER BY overdue_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            UPDATE chatflow_executions e
            SET sweep_lease_until = $2
            FROM overdue
            WHERE e.id = overdue.id
            RETURNING e.*
            "#,
        )
        .bind(now)
        .bind(lease_until)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim overdue executions: {}", e);
            db_err(e)
        })?;

        if !rows.is_empty() {
            debug!(count = rows.len(), "claimed overdue executions");
        }
        Ok(rows)
    }
}
