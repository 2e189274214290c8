//! In-memory implementation of ExecutionStore
//!
//! Same observable semantics as the PostgreSQL store, including lock
//! version CAS and sweep leases, so engine tests run without a database.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::models::*;
use crate::store::{ExecutionStore, StoreError};

#[derive(Default)]
struct Inner {
    definitions: HashMap<Uuid, DefinitionRow>,
    executions: HashMap<Uuid, ExecutionRow>,
    steps: HashMap<Uuid, StepExecutionRow>,
    validations: Vec<MessageValidationRow>,
    sessions: HashMap<String, UserSessionRow>,
}

/// In-memory store for tests and local development
#[derive(Clone, Default)]
pub struct InMemoryExecutionStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_update(row: &mut ExecutionRow, update: UpdateExecution) {
    row.status = update.status;
    row.current_step = update.current_step;
    row.variables = update.variables;
    row.is_waiting = update.is_waiting;
    row.waiting_since = update.waiting_since;
    row.last_user_activity = update.last_user_activity;
    row.current_waiting_step = update.current_waiting_step;
    row.waiting_for_user_id = update.waiting_for_user_id;
    row.waiting_form_instance_id = update.waiting_form_instance_id;
    row.waiting_callback_id = update.waiting_callback_id;
    row.deadline_at = update.deadline_at;
    row.retries_sent = update.retries_sent;
    row.escalated = update.escalated;
    row.overdue_notified = update.overdue_notified;
    row.error = update.error;
    row.ended_at = update.ended_at;
    row.sweep_lease_until = None;
    row.lock_version += 1;
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn insert_definition(
        &self,
        input: CreateDefinition,
    ) -> Result<DefinitionRow, StoreError> {
        let row = DefinitionRow {
            id: input.id,
            tenant_id: input.tenant_id,
            name: input.name,
            version: input.version,
            status: input.status,
            document: input.document,
            created_at: Utc::now(),
        };
        self.inner.write().definitions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_definition(&self, id: Uuid) -> Result<DefinitionRow, StoreError> {
        self.inner
            .read()
            .definitions
            .get(&id)
            .cloned()
            .ok_or(StoreError::DefinitionNotFound(id))
    }

    async fn create_execution(&self, input: CreateExecution) -> Result<ExecutionRow, StoreError> {
        let row = ExecutionRow {
            id: input.id,
            definition_id: input.definition_id,
            definition_version: input.definition_version,
            status: "running".to_string(),
            current_step: 0,
            variables: input.variables,
            is_waiting: false,
            waiting_since: None,
            last_user_activity: None,
            current_waiting_step: None,
            waiting_for_user_id: input.trigger_user_id,
            waiting_form_instance_id: None,
            waiting_callback_id: None,
            deadline_at: None,
            retries_sent: 0,
            escalated: false,
            overdue_at: input.overdue_at,
            overdue_notified: false,
            sweep_lease_until: None,
            error: None,
            lock_version: 0,
            started_at: Utc::now(),
            ended_at: None,
        };
        self.inner.write().executions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_execution(&self, id: Uuid) -> Result<ExecutionRow, StoreError> {
        self.inner
            .read()
            .executions
            .get(&id)
            .cloned()
            .ok_or(StoreError::ExecutionNotFound(id))
    }

    async fn update_execution(
        &self,
        id: Uuid,
        expected_version: i32,
        update: UpdateExecution,
    ) -> Result<ExecutionRow, StoreError> {
        let mut inner = self.inner.write();
        let row = inner
            .executions
            .get_mut(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;

        if row.lock_version != expected_version {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_version,
                actual: row.lock_version,
            });
        }

        apply_update(row, update);
        Ok(row.clone())
    }

    async fn find_by_form_instance(
        &self,
        form_instance_id: Uuid,
    ) -> Result<Option<ExecutionRow>, StoreError> {
        Ok(self
            .inner
            .read()
            .executions
            .values()
            .find(|e| e.is_waiting && e.waiting_form_instance_id == Some(form_instance_id))
            .cloned())
    }

    async fn find_by_callback(
        &self,
        correlation_id: Uuid,
    ) -> Result<Option<ExecutionRow>, StoreError> {
        Ok(self
            .inner
            .read()
            .executions
            .values()
            .find(|e| e.is_waiting && e.waiting_callback_id == Some(correlation_id))
            .cloned())
    }

    async fn create_step_execution(
        &self,
        input: CreateStepExecution,
    ) -> Result<StepExecutionRow, StoreError> {
        let mut inner = self.inner.write();
        let attempt = inner
            .steps
            .values()
            .filter(|s| s.execution_id == input.execution_id && s.step_index == input.step_index)
            .map(|s| s.attempt)
            .max()
            .unwrap_or(0)
            + 1;

        let row = StepExecutionRow {
            id: Uuid::now_v7(),
            execution_id: input.execution_id,
            step_index: input.step_index,
            attempt,
            step_type: input.step_type,
            status: input.status,
            input: input.input,
            output: None,
            waiting_for_user_id: input.waiting_for_user_id,
            error: None,
            started_at: Utc::now(),
            ended_at: None,
        };
        inner.steps.insert(row.id, row.clone());
        Ok(row)
    }

    async fn close_step_execution(
        &self,
        id: Uuid,
        status: &str,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let row = inner.steps.get_mut(&id).ok_or(StoreError::StepNotFound(id))?;
        row.status = status.to_string();
        row.output = output;
        row.error = error;
        row.ended_at = Some(Utc::now());
        Ok(())
    }

    async fn get_open_step(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<StepExecutionRow>, StoreError> {
        Ok(self
            .inner
            .read()
            .steps
            .values()
            .filter(|s| s.execution_id == execution_id && s.ended_at.is_none())
            .max_by_key(|s| s.started_at)
            .cloned())
    }

    async fn list_step_executions(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<StepExecutionRow>, StoreError> {
        let mut rows: Vec<_> = self
            .inner
            .read()
            .steps
            .values()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect();
        rows.sort_by_key(|s| (s.started_at, s.attempt));
        Ok(rows)
    }

    async fn record_message_validation(
        &self,
        input: CreateMessageValidation,
    ) -> Result<MessageValidationRow, StoreError> {
        let row = MessageValidationRow {
            id: Uuid::now_v7(),
            execution_id: input.execution_id,
            step_index: input.step_index,
            sender_id: input.sender_id,
            raw_message: input.raw_message,
            message_type: input.message_type,
            is_valid: input.is_valid,
            validator_type: input.validator_type,
            processed_data: input.processed_data,
            reason: input.reason,
            created_at: Utc::now(),
        };
        self.inner.write().validations.push(row.clone());
        Ok(row)
    }

    async fn list_message_validations(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<MessageValidationRow>, StoreError> {
        Ok(self
            .inner
            .read()
            .validations
            .iter()
            .filter(|v| v.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn attach_session(&self, input: CreateSession) -> Result<UserSessionRow, StoreError> {
        let mut inner = self.inner.write();
        if inner.sessions.contains_key(&input.user_id) {
            return Err(StoreError::SessionExists(input.user_id));
        }
        let now = Utc::now();
        let row = UserSessionRow {
            user_id: input.user_id.clone(),
            execution_id: input.execution_id,
            step_index: input.step_index,
            created_at: now,
            last_activity_at: now,
        };
        inner.sessions.insert(input.user_id, row.clone());
        Ok(row)
    }

    async fn resolve_session(&self, user_id: &str) -> Result<Option<UserSessionRow>, StoreError> {
        Ok(self.inner.read().sessions.get(user_id).cloned())
    }

    async fn detach_session(&self, user_id: &str) -> Result<bool, StoreError> {
        Ok(self.inner.write().sessions.remove(user_id).is_some())
    }

    async fn detach_sessions_for_execution(&self, execution_id: Uuid) -> Result<u64, StoreError> {
        let mut inner = self.inner.write();
        let before = inner.sessions.len();
        inner.sessions.retain(|_, s| s.execution_id != execution_id);
        Ok((before - inner.sessions.len()) as u64)
    }

    async fn touch_session(&self, user_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(session) = self.inner.write().sessions.get_mut(user_id) {
            session.last_activity_at = at;
        }
        Ok(())
    }

    async fn claim_due_waits(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<ExecutionRow>, StoreError> {
        let lease_until = now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        let mut inner = self.inner.write();

        let mut due: Vec<Uuid> = inner
            .executions
            .values()
            .filter(|e| {
                e.status == "waiting"
                    && e.is_waiting
                    && e.deadline_at.is_some_and(|d| d <= now)
                    && e.sweep_lease_until.is_none_or(|l| l <= now)
            })
            .map(|e| e.id)
            .collect();
        due.sort_by_key(|id| inner.executions[id].deadline_at);
        due.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            let row = inner.executions.get_mut(&id).expect("row exists");
            row.sweep_lease_until = Some(lease_until);
            claimed.push(row.clone());
        }
        Ok(claimed)
    }

    async fn claim_overdue_starts(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        limit: i64,
    ) -> Result<Vec<ExecutionRow>, StoreError> {
        let lease_until = now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        let mut inner = self.inner.write();

        let mut overdue: Vec<Uuid> = inner
            .executions
            .values()
            .filter(|e| {
                matches!(e.status.as_str(), "running" | "waiting")
                    && !e.overdue_notified
                    && e.overdue_at.is_some_and(|d| d <= now)
                    && e.sweep_lease_until.is_none_or(|l| l <= now)
            })
            .map(|e| e.id)
            .collect();
        overdue.sort_by_key(|id| inner.executions[id].overdue_at);
        overdue.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(overdue.len());
        for id in overdue {
            let row = inner.executions.get_mut(&id).expect("row exists");
            row.sweep_lease_until = Some(lease_until);
            claimed.push(row.clone());
        }
        Ok(claimed)
    }
}
