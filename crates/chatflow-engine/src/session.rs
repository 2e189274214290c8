//! Session tracking
//!
//! Maps chat identities to the execution waiting on them. The store's
//! unique session row per user enforces the one-flow-per-user invariant;
//! the tracker decides what happens when a second flow wants the same
//! user, per [`SessionPolicy`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};
use uuid::Uuid;

use chatflow_storage::{CreateSession, ExecutionStore, StoreError, UserSessionRow};

use crate::error::EngineError;

/// What to do when attaching a user who already has an active session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPolicy {
    /// Surface [`EngineError::SessionBusy`]; the new flow does not start
    #[default]
    Reject,
    /// Detach the existing mapping; the old execution keeps waiting but
    /// no longer receives this user's messages
    Supersede,
}

/// Routes inbound chat identities to waiting executions
#[derive(Clone)]
pub struct SessionTracker {
    store: Arc<dyn ExecutionStore>,
    policy: SessionPolicy,
}

impl SessionTracker {
    pub fn new(store: Arc<dyn ExecutionStore>, policy: SessionPolicy) -> Self {
        Self { store, policy }
    }

    #[instrument(skip(self))]
    pub async fn attach(
        &self,
        user_id: &str,
        execution_id: Uuid,
        step_index: i32,
    ) -> Result<UserSessionRow, EngineError> {
        let input = CreateSession {
            user_id: user_id.to_string(),
            execution_id,
            step_index,
        };

        match self.store.attach_session(input.clone()).await {
            Ok(row) => Ok(row),
            Err(StoreError::SessionExists(user)) => match self.policy {
                SessionPolicy::Reject => Err(EngineError::SessionBusy(user)),
                SessionPolicy::Supersede => {
                    debug!(user_id = %user, "superseding existing session");
                    self.store.detach_session(&user).await?;
                    Ok(self.store.attach_session(input).await?)
                }
            },
            Err(e) => Err(e.into()),
        }
    }

    pub async fn resolve(&self, user_id: &str) -> Result<Option<UserSessionRow>, EngineError> {
        Ok(self.store.resolve_session(user_id).await?)
    }

    pub async fn detach(&self, user_id: &str) -> Result<bool, EngineError> {
        Ok(self.store.detach_session(user_id).await?)
    }

    pub async fn detach_for_execution(&self, execution_id: Uuid) -> Result<u64, EngineError> {
        Ok(self.store.detach_sessions_for_execution(execution_id).await?)
    }

    pub async fn touch(&self, user_id: &str, at: DateTime<Utc>) -> Result<(), EngineError> {
        Ok(self.store.touch_session(user_id, at).await?)
    }
}
