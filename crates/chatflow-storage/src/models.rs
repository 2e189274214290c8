//! Row and input models for the execution store
//!
//! Row structs mirror table shapes one-to-one and derive `sqlx::FromRow`;
//! `Create*`/`Update*` structs are the write-side inputs. Statuses are
//! persisted as their lowercase string form and parsed back through the
//! contracts enums at the edges.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// One immutable version of a workflow definition
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DefinitionRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub version: i32,
    pub status: String,
    /// The full step graph as a JSON document
    pub document: JsonValue,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateDefinition {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub version: i32,
    pub status: String,
    pub document: JsonValue,
}

/// One workflow execution.
///
/// `lock_version` is the optimistic-concurrency column: every update must
/// present the version it read, and a mismatch is a [`super::StoreError::ConcurrencyConflict`].
/// `sweep_lease_until` fences the escalation sweep so a claimed row is not
/// re-claimed by another worker instance until the lease expires.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub definition_version: i32,
    pub status: String,
    pub current_step: i32,
    pub variables: JsonValue,

    pub is_waiting: bool,
    pub waiting_since: Option<DateTime<Utc>>,
    pub last_user_activity: Option<DateTime<Utc>>,
    pub current_waiting_step: Option<i32>,
    pub waiting_for_user_id: Option<String>,
    pub waiting_form_instance_id: Option<Uuid>,
    pub waiting_callback_id: Option<Uuid>,

    pub deadline_at: Option<DateTime<Utc>>,
    pub retries_sent: i32,
    pub escalated: bool,

    pub overdue_at: Option<DateTime<Utc>>,
    pub overdue_notified: bool,
    pub sweep_lease_until: Option<DateTime<Utc>>,

    pub error: Option<String>,
    pub lock_version: i32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CreateExecution {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub definition_version: i32,
    pub variables: JsonValue,
    /// Chat identity the execution converses with, when user-triggered;
    /// lands in `waiting_for_user_id` and persists across waits
    pub trigger_user_id: Option<String>,
    /// Absolute whole-execution overdue stamp, when configured on Start
    pub overdue_at: Option<DateTime<Utc>>,
}

/// Full mutable state of an execution, written back atomically under CAS.
///
/// Built from the row that was read via [`UpdateExecution::from_row`], then
/// mutated field-by-field before the write.
#[derive(Debug, Clone)]
pub struct UpdateExecution {
    pub status: String,
    pub current_step: i32,
    pub variables: JsonValue,

    pub is_waiting: bool,
    pub waiting_since: Option<DateTime<Utc>>,
    pub last_user_activity: Option<DateTime<Utc>>,
    pub current_waiting_step: Option<i32>,
    pub waiting_for_user_id: Option<String>,
    pub waiting_form_instance_id: Option<Uuid>,
    pub waiting_callback_id: Option<Uuid>,

    pub deadline_at: Option<DateTime<Utc>>,
    pub retries_sent: i32,
    pub escalated: bool,
    pub overdue_notified: bool,

    pub error: Option<String>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl UpdateExecution {
    pub fn from_row(row: &ExecutionRow) -> Self {
        Self {
            status: row.status.clone(),
            current_step: row.current_step,
            variables: row.variables.clone(),
            is_waiting: row.is_waiting,
            waiting_since: row.waiting_since,
            last_user_activity: row.last_user_activity,
            current_waiting_step: row.current_waiting_step,
            waiting_for_user_id: row.waiting_for_user_id.clone(),
            waiting_form_instance_id: row.waiting_form_instance_id,
            waiting_callback_id: row.waiting_callback_id,
            deadline_at: row.deadline_at,
            retries_sent: row.retries_sent,
            escalated: row.escalated,
            overdue_notified: row.overdue_notified,
            error: row.error.clone(),
            ended_at: row.ended_at,
        }
    }

    /// Clear all waiting-related state in one go
    pub fn clear_waiting(&mut self) {
        self.is_waiting = false;
        self.waiting_since = None;
        self.current_waiting_step = None;
        self.waiting_form_instance_id = None;
        self.waiting_callback_id = None;
        self.deadline_at = None;
        self.retries_sent = 0;
        self.escalated = false;
    }
}

/// One attempt at one step of an execution
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StepExecutionRow {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_index: i32,
    /// 1-based attempt counter per (execution, step)
    pub attempt: i32,
    pub step_type: String,
    pub status: String,
    pub input: JsonValue,
    pub output: Option<JsonValue>,
    pub waiting_for_user_id: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CreateStepExecution {
    pub execution_id: Uuid,
    pub step_index: i32,
    pub step_type: String,
    pub status: String,
    pub input: JsonValue,
    pub waiting_for_user_id: Option<String>,
}

/// Write-once audit record of one inbound message evaluation
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageValidationRow {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub step_index: i32,
    pub sender_id: String,
    pub raw_message: String,
    pub message_type: String,
    pub is_valid: bool,
    pub validator_type: String,
    pub processed_data: Option<JsonValue>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateMessageValidation {
    pub execution_id: Uuid,
    pub step_index: i32,
    pub sender_id: String,
    pub raw_message: String,
    pub message_type: String,
    pub is_valid: bool,
    pub validator_type: String,
    pub processed_data: Option<JsonValue>,
    pub reason: Option<String>,
}

/// Routing entry mapping a chat identity to the execution waiting on it.
/// `user_id` is the primary key, which is what enforces the
/// one-active-session-per-user invariant.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserSessionRow {
    pub user_id: String,
    pub execution_id: Uuid,
    pub step_index: i32,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CreateSession {
    pub user_id: String,
    pub execution_id: Uuid,
    pub step_index: i32,
}
