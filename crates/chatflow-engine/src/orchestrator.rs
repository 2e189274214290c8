//! The orchestrator
//!
//! Drives executions step by step: `start` creates an execution from an
//! Active definition and evaluates forward until the flow completes or
//! parks on a wait; `advance` consumes external signals against waiting
//! executions; `cancel` terminates from any non-terminal state.
//!
//! Exactly-once advancement: every transition out of a waiting state is
//! committed through the store's lock-version CAS before any further side
//! effects run. A signal that loses the race observes the conflict and is
//! reported as `StaleSignal`; it never advances the flow a second time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use chatflow_contracts::{
    ApiCallCommand, CreateFormCommand, DataSetQueryCommand, ExecutionStatus,
    ExternalCallbackResult, FormInstanceTerminal, FormOutcome, InboundMessage,
    SendMessageCommand, Signal, StepStatus, TimerElapsed,
};
use chatflow_core::{
    DeadlineConfig, EscalationOutcome, MessageContent, MessageValidator, StepDef, StepKind,
    SweepDecision, TimeValidator, VarType, VarValue, Variables, WorkflowDefinition,
};
use chatflow_storage::{
    CreateExecution, CreateMessageValidation, CreateStepExecution, ExecutionRow, ExecutionStore,
    StoreError, UpdateExecution,
};

use crate::collaborators::Collaborators;
use crate::error::EngineError;
use crate::session::{SessionPolicy, SessionTracker};

/// How an execution gets started
#[derive(Debug, Clone, Default)]
pub struct StartTrigger {
    /// Chat identity the flow converses with; required before the flow
    /// reaches its first wait step
    pub user_id: Option<String>,
    /// Initial process variables, validated against the declarations
    pub variables: std::collections::HashMap<String, serde_json::Value>,
}

/// Result of presenting a signal to a waiting execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceOutcome {
    /// Signal accepted; the execution moved forward
    Advanced,
    /// Message failed validation; the execution is still waiting
    Rejected,
}

pub struct Orchestrator {
    store: Arc<dyn ExecutionStore>,
    collaborators: Collaborators,
    sessions: SessionTracker,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn ExecutionStore>, collaborators: Collaborators) -> Self {
        Self::with_session_policy(store, collaborators, SessionPolicy::default())
    }

    pub fn with_session_policy(
        store: Arc<dyn ExecutionStore>,
        collaborators: Collaborators,
        policy: SessionPolicy,
    ) -> Self {
        let sessions = SessionTracker::new(store.clone(), policy);
        Self {
            store,
            collaborators,
            sessions,
        }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn sessions(&self) -> &SessionTracker {
        &self.sessions
    }

    /// Start an execution from an Active definition and evaluate forward.
    #[instrument(skip(self, trigger))]
    pub async fn start(
        &self,
        definition_id: Uuid,
        trigger: StartTrigger,
    ) -> Result<ExecutionRow, EngineError> {
        let def_row = self.store.get_definition(definition_id).await?;
        if def_row.status != "active" {
            return Err(EngineError::DefinitionNotActive(definition_id));
        }
        let def: WorkflowDefinition = serde_json::from_value(def_row.document.clone())?;
        def.validate()
            .map_err(|e| EngineError::Definition(e.to_string()))?;

        let mut vars = Variables::new();
        for (name, value) in trigger.variables {
            let decl = def.variable_decl(&name).ok_or_else(|| {
                EngineError::InvalidTrigger(format!("undeclared variable '{name}'"))
            })?;
            let value = coerce(decl.data_type, VarValue::from_json(value)).ok_or_else(|| {
                EngineError::InvalidTrigger(format!(
                    "value for '{name}' does not match declared type {:?}",
                    decl.data_type
                ))
            })?;
            vars.set_checked(decl, value)
                .map_err(|e| EngineError::InvalidTrigger(e.to_string()))?;
        }

        let now = Utc::now();
        let overdue_at = match def.step(0).map(|s| &s.kind) {
            Some(StepKind::Start(cfg)) => cfg
                .overdue
                .as_ref()
                .map(|o| now + chrono_duration(o.deadline)),
            _ => None,
        };

        let exec = self
            .store
            .create_execution(CreateExecution {
                id: Uuid::now_v7(),
                definition_id,
                definition_version: def_row.version,
                variables: serde_json::to_value(&vars)?,
                trigger_user_id: trigger.user_id,
                overdue_at,
            })
            .await?;

        info!(execution_id = %exec.id, definition_id = %definition_id, "started execution");
        self.evaluate(&def, exec).await
    }

    /// Present a signal to an execution.
    #[instrument(skip(self, signal), fields(signal_kind = signal.kind()))]
    pub async fn advance(
        &self,
        execution_id: Uuid,
        signal: Signal,
    ) -> Result<AdvanceOutcome, EngineError> {
        match signal {
            Signal::InboundMessage(msg) => self.on_message(execution_id, msg).await,
            Signal::FormInstanceTerminal(terminal) => self.on_form(execution_id, terminal).await,
            Signal::ExternalCallbackResult(result) => {
                self.on_callback(execution_id, result).await
            }
            Signal::TimerElapsed(timer) => self.on_timer(execution_id, timer).await,
        }
    }

    /// Route an inbound message to the sender's waiting execution.
    pub async fn signal_message(
        &self,
        message: InboundMessage,
    ) -> Result<AdvanceOutcome, EngineError> {
        let session = self
            .sessions
            .resolve(&message.sender_id)
            .await?
            .ok_or_else(|| EngineError::UnknownSender(message.sender_id.clone()))?;
        self.on_message(session.execution_id, message).await
    }

    /// Route an e-form terminal callback to the waiting execution.
    pub async fn signal_form(
        &self,
        terminal: FormInstanceTerminal,
    ) -> Result<AdvanceOutcome, EngineError> {
        let exec = self
            .store
            .find_by_form_instance(terminal.form_instance_id)
            .await?
            .ok_or(EngineError::UnknownCorrelation(terminal.form_instance_id))?;
        self.on_form(exec.id, terminal).await
    }

    /// Route an external API callback to the waiting execution.
    pub async fn signal_callback(
        &self,
        result: ExternalCallbackResult,
    ) -> Result<AdvanceOutcome, EngineError> {
        let exec = self
            .store
            .find_by_callback(result.correlation_id)
            .await?
            .ok_or(EngineError::UnknownCorrelation(result.correlation_id))?;
        self.on_callback(exec.id, result).await
    }

    /// Cancel from any non-terminal state. Idempotent: cancelling an
    /// already-terminal execution returns it unchanged.
    #[instrument(skip(self))]
    pub async fn cancel(&self, execution_id: Uuid) -> Result<ExecutionRow, EngineError> {
        let exec = self.store.get_execution(execution_id).await?;
        if exec_status(&exec)?.is_terminal() {
            return Ok(exec);
        }

        let mut update = UpdateExecution::from_row(&exec);
        update.clear_waiting();
        update.status = ExecutionStatus::Cancelled.to_string();
        update.ended_at = Some(Utc::now());
        let row = self.commit(&exec, update).await?;

        if let Some(open) = self.store.get_open_step(exec.id).await? {
            self.store
                .close_step_execution(open.id, &StepStatus::Skipped.to_string(), None, None)
                .await?;
        }
        self.sessions.detach_for_execution(exec.id).await?;

        info!(execution_id = %execution_id, "cancelled execution");
        Ok(row)
    }

    // -- signal handlers ---------------------------------------------------

    async fn on_message(
        &self,
        execution_id: Uuid,
        message: InboundMessage,
    ) -> Result<AdvanceOutcome, EngineError> {
        let exec = self.store.get_execution(execution_id).await?;
        let waiting_step = self.expect_waiting(&exec)?;
        if exec.waiting_for_user_id.as_deref() != Some(message.sender_id.as_str()) {
            return Err(EngineError::ExecutionNotWaiting(execution_id));
        }

        let def = self.load_definition(exec.definition_id).await?;
        let step = def
            .step(waiting_step)
            .ok_or_else(|| EngineError::Definition(format!("no step at index {waiting_step}")))?
            .clone();
        let cfg = match &step.kind {
            StepKind::WaitForReply(cfg) | StepKind::WaitForQrCode(cfg) => cfg,
            // Waiting on a form or callback, not on this user's messages
            _ => return Err(EngineError::ExecutionNotWaiting(execution_id)),
        };

        let mut outcome =
            MessageValidator::validate(&cfg.expect, message.message_type, &message.raw_content);

        // Apply write-time typing before anything is persisted, so a reply
        // that cannot satisfy the declared variable type counts as invalid.
        let mut vars: Variables = serde_json::from_value(exec.variables.clone())?;
        if outcome.is_valid {
            if let (Some(save_as), Some(extracted)) = (&cfg.save_as, outcome.extracted.clone()) {
                if let Err(reason) = save_var(&mut vars, &def, save_as, extracted) {
                    outcome.is_valid = false;
                    outcome.extracted = None;
                    outcome.reason = Some(reason);
                }
            }
        }

        let now = Utc::now();
        self.store
            .record_message_validation(CreateMessageValidation {
                execution_id,
                step_index: waiting_step,
                sender_id: message.sender_id.clone(),
                raw_message: message.raw_content.clone(),
                message_type: message.message_type.to_string(),
                is_valid: outcome.is_valid,
                validator_type: outcome.validator_type.to_string(),
                processed_data: outcome
                    .extracted
                    .as_ref()
                    .map(serde_json::to_value)
                    .transpose()?,
                reason: outcome.reason.clone(),
            })
            .await?;
        self.sessions.touch(&message.sender_id, now).await?;

        if !outcome.is_valid {
            debug!(
                execution_id = %execution_id,
                reason = outcome.reason.as_deref().unwrap_or(""),
                "message rejected"
            );
            let mut update = UpdateExecution::from_row(&exec);
            update.last_user_activity = Some(now);
            self.commit(&exec, update).await?;
            return Ok(AdvanceOutcome::Rejected);
        }

        // Leave the waiting state under CAS first; a concurrent duplicate
        // fails here and never re-runs the downstream steps.
        let mut update = UpdateExecution::from_row(&exec);
        update.clear_waiting();
        update.status = ExecutionStatus::Running.to_string();
        update.current_step = waiting_step + 1;
        update.last_user_activity = Some(now);
        update.variables = serde_json::to_value(&vars)?;
        let exec = self.commit(&exec, update).await?;

        if let Some(open) = self.store.get_open_step(execution_id).await? {
            let output = outcome.extracted.map(|v| serde_json::to_value(v)).transpose()?;
            self.store
                .close_step_execution(open.id, &StepStatus::Completed.to_string(), output, None)
                .await?;
        }
        self.sessions.detach(&message.sender_id).await?;

        self.evaluate(&def, exec).await?;
        Ok(AdvanceOutcome::Advanced)
    }

    async fn on_form(
        &self,
        execution_id: Uuid,
        terminal: FormInstanceTerminal,
    ) -> Result<AdvanceOutcome, EngineError> {
        let exec = self.store.get_execution(execution_id).await?;
        let waiting_step = self.expect_waiting(&exec)?;
        if exec.waiting_form_instance_id != Some(terminal.form_instance_id) {
            return Err(EngineError::ExecutionNotWaiting(execution_id));
        }

        let def = self.load_definition(exec.definition_id).await?;
        let mut vars: Variables = serde_json::from_value(exec.variables.clone())?;
        let outcome_str = match terminal.outcome {
            FormOutcome::Approved => "approved",
            FormOutcome::Rejected => "rejected",
        };
        save_var(
            &mut vars,
            &def,
            "form_outcome",
            VarValue::String(outcome_str.to_string()),
        )
        .map_err(EngineError::Definition)?;
        save_var(
            &mut vars,
            &def,
            "form_approver",
            VarValue::String(terminal.approver_id.clone()),
        )
        .map_err(EngineError::Definition)?;

        let mut update = UpdateExecution::from_row(&exec);
        update.clear_waiting();
        update.status = ExecutionStatus::Running.to_string();
        update.current_step = waiting_step + 1;
        update.variables = serde_json::to_value(&vars)?;
        let exec = self.commit(&exec, update).await?;

        if let Some(open) = self.store.get_open_step(execution_id).await? {
            let output = json!({
                "form_instance_id": terminal.form_instance_id,
                "outcome": outcome_str,
                "approver_id": terminal.approver_id,
            });
            self.store
                .close_step_execution(
                    open.id,
                    &StepStatus::Completed.to_string(),
                    Some(output),
                    None,
                )
                .await?;
        }

        self.evaluate(&def, exec).await?;
        Ok(AdvanceOutcome::Advanced)
    }

    async fn on_callback(
        &self,
        execution_id: Uuid,
        result: ExternalCallbackResult,
    ) -> Result<AdvanceOutcome, EngineError> {
        let exec = self.store.get_execution(execution_id).await?;
        let waiting_step = self.expect_waiting(&exec)?;
        if exec.waiting_callback_id != Some(result.correlation_id) {
            return Err(EngineError::ExecutionNotWaiting(execution_id));
        }

        let def = self.load_definition(exec.definition_id).await?;

        // Merge declared top-level payload fields into the variables;
        // everything else stays on the step output only.
        let mut vars: Variables = serde_json::from_value(exec.variables.clone())?;
        if let serde_json::Value::Object(fields) = &result.payload {
            for (name, value) in fields {
                if def.variable_decl(name).is_some() {
                    save_var(&mut vars, &def, name, VarValue::from_json(value.clone()))
                        .map_err(EngineError::Definition)?;
                }
            }
        }

        let mut update = UpdateExecution::from_row(&exec);
        update.clear_waiting();
        update.status = ExecutionStatus::Running.to_string();
        update.current_step = waiting_step + 1;
        update.variables = serde_json::to_value(&vars)?;
        let exec = self.commit(&exec, update).await?;

        if let Some(open) = self.store.get_open_step(execution_id).await? {
            self.store
                .close_step_execution(
                    open.id,
                    &StepStatus::Completed.to_string(),
                    Some(result.payload),
                    None,
                )
                .await?;
        }

        self.evaluate(&def, exec).await?;
        Ok(AdvanceOutcome::Advanced)
    }

    async fn on_timer(
        &self,
        execution_id: Uuid,
        timer: TimerElapsed,
    ) -> Result<AdvanceOutcome, EngineError> {
        let exec = self.store.get_execution(execution_id).await?;
        let waiting_step = self.expect_waiting(&exec)?;
        if waiting_step != timer.step_index {
            return Err(EngineError::ExecutionNotWaiting(execution_id));
        }
        self.handle_due_wait(exec, Utc::now()).await?;
        Ok(AdvanceOutcome::Advanced)
    }

    // -- sweep handlers (shared with the scheduler) ------------------------

    /// Apply the retry/escalation policy to one claimed due wait.
    ///
    /// Losing the CAS to a concurrently-arrived reply is not an error; the
    /// row is simply skipped.
    #[instrument(skip(self, exec), fields(execution_id = %exec.id))]
    pub async fn handle_due_wait(
        &self,
        exec: ExecutionRow,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if !exec.is_waiting || exec_status(&exec)? != ExecutionStatus::Waiting {
            return Ok(());
        }
        let Some(deadline_at) = exec.deadline_at else {
            return Ok(());
        };
        if !TimeValidator::has_elapsed(deadline_at, now) {
            return Ok(());
        }
        let Some(waiting_step) = exec.current_waiting_step else {
            return Ok(());
        };

        let def = self.load_definition(exec.definition_id).await?;
        let vars: Variables = serde_json::from_value(exec.variables.clone())?;
        let Some(cfg) = def.step(waiting_step).and_then(|s| s.kind.deadline()) else {
            // Stale deadline stamp on a step without a deadline policy
            let mut update = UpdateExecution::from_row(&exec);
            update.deadline_at = None;
            self.commit_sweep(&exec, update).await?;
            return Ok(());
        };
        let cfg = cfg.clone();

        // Commit the schedule change before any notification goes out: a
        // losing sweep then produces no duplicate sends.
        match cfg.decide(exec.retries_sent as u32) {
            SweepDecision::Retry { next_deadline_in } => {
                let mut update = UpdateExecution::from_row(&exec);
                update.retries_sent += 1;
                update.deadline_at = Some(now + chrono_duration(next_deadline_in));
                if self.commit_sweep(&exec, update).await? {
                    self.send_retry(&exec, &cfg, &vars).await;
                }
                Ok(())
            }
            SweepDecision::Escalate => {
                let outcome = cfg
                    .escalation
                    .as_ref()
                    .map(|e| e.on_exhausted)
                    .unwrap_or(EscalationOutcome::KeepWaiting);

                let committed = match outcome {
                    EscalationOutcome::KeepWaiting => {
                        let mut update = UpdateExecution::from_row(&exec);
                        update.escalated = true;
                        update.deadline_at = None;
                        self.commit_sweep(&exec, update).await?
                    }
                    EscalationOutcome::FailExecution => {
                        match self
                            .fail_execution(exec.clone(), "wait deadline exceeded".to_string())
                            .await
                        {
                            Ok(_) => true,
                            Err(EngineError::StaleSignal(_)) => false,
                            Err(e) => return Err(e),
                        }
                    }
                };
                if !committed {
                    return Ok(());
                }

                info!(execution_id = %exec.id, ?outcome, "wait escalated");
                if let Some(escalation) = &cfg.escalation {
                    let content = escalation.message.render(&vars);
                    for recipient in &escalation.recipients {
                        let command = SendMessageCommand {
                            recipient: recipient.clone(),
                            content: content.clone(),
                        };
                        if let Err(e) = self.collaborators.gateway.send(command).await {
                            warn!(
                                execution_id = %exec.id,
                                recipient = %recipient,
                                error = %e,
                                "escalation delivery failed"
                            );
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// Fire the whole-execution overdue notification once.
    #[instrument(skip(self, exec), fields(execution_id = %exec.id))]
    pub async fn handle_overdue(
        &self,
        exec: ExecutionRow,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if exec.overdue_notified || exec_status(&exec)?.is_terminal() {
            return Ok(());
        }
        if !exec.overdue_at.is_some_and(|at| at <= now) {
            return Ok(());
        }

        let mut update = UpdateExecution::from_row(&exec);
        update.overdue_notified = true;
        if !self.commit_sweep(&exec, update).await? {
            return Ok(());
        }

        let def = self.load_definition(exec.definition_id).await?;
        let vars: Variables = serde_json::from_value(exec.variables.clone())?;
        if let Some(StepKind::Start(cfg)) = def.step(0).map(|s| &s.kind) {
            if let Some(overdue) = &cfg.overdue {
                let content = overdue.message.render(&vars);
                for recipient in &overdue.recipients {
                    let command = SendMessageCommand {
                        recipient: recipient.clone(),
                        content: content.clone(),
                    };
                    if let Err(e) = self.collaborators.gateway.send(command).await {
                        warn!(
                            execution_id = %exec.id,
                            recipient = %recipient,
                            error = %e,
                            "overdue notification delivery failed"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    // -- evaluation --------------------------------------------------------

    /// Evaluate forward from `current_step` until the execution parks on a
    /// wait or reaches a terminal state.
    async fn evaluate(
        &self,
        def: &WorkflowDefinition,
        mut exec: ExecutionRow,
    ) -> Result<ExecutionRow, EngineError> {
        loop {
            let Some(step) = def.step(exec.current_step).cloned() else {
                let index = exec.current_step;
                return self
                    .fail_execution(exec, format!("no step at index {index}"))
                    .await;
            };
            let mut vars: Variables = serde_json::from_value(exec.variables.clone())?;
            debug!(
                execution_id = %exec.id,
                step_index = step.index,
                step_type = step.kind.type_name(),
                "evaluating step"
            );

            match &step.kind {
                StepKind::Start(_) => {
                    self.record_closed_step(&exec, &step, StepStatus::Completed, None, None)
                        .await?;
                    exec = self.advance_to(&exec, step.index + 1, &vars).await?;
                }

                StepKind::SendMessage(cfg) => {
                    let content = cfg.content.render(&vars);
                    let result = match resolve_recipient(cfg.recipient.as_deref(), &vars, &exec) {
                        Some(recipient) => {
                            self.collaborators
                                .gateway
                                .send(SendMessageCommand { recipient, content })
                                .await
                        }
                        None => Err(EngineError::Definition(
                            "send_message step has no resolvable recipient".to_string(),
                        )),
                    };

                    // Delivery failure is recorded on the step, not fatal
                    let (status, error) = match result {
                        Ok(()) => (StepStatus::Completed, None),
                        Err(e) => {
                            warn!(execution_id = %exec.id, error = %e, "message delivery failed");
                            (StepStatus::Failed, Some(e.to_string()))
                        }
                    };
                    self.record_closed_step(&exec, &step, status, None, error)
                        .await?;
                    exec = self.advance_to(&exec, step.index + 1, &vars).await?;
                }

                StepKind::WaitForReply(cfg) | StepKind::WaitForQrCode(cfg) => {
                    let Some(user) = exec.waiting_for_user_id.clone() else {
                        return self
                            .fail_execution(
                                exec,
                                format!("step {} waits for a reply but the execution has no user identity", step.index),
                            )
                            .await;
                    };

                    self.create_step(&exec, &step, StepStatus::Waiting, Some(user.clone()))
                        .await?;

                    // Commit the waiting state before binding the session. A
                    // concurrent cancel either wins the CAS (no session was
                    // ever attached) or loses it and detaches the session in
                    // its own pass.
                    let waiting = self
                        .enter_wait(&exec, &step, cfg.deadline.as_ref(), None, None)
                        .await?;
                    if let Err(err) = self.sessions.attach(&user, waiting.id, step.index).await {
                        // A busy user cannot receive this flow's prompts;
                        // the execution cannot make progress
                        if matches!(err, EngineError::SessionBusy(_)) {
                            self.fail_execution(waiting, err.to_string()).await?;
                        }
                        return Err(err);
                    }

                    // A cancel landing between the commit and the attach has
                    // already run its detach pass; remove our own binding.
                    let current = self.store.get_execution(waiting.id).await?;
                    if exec_status(&current)?.is_terminal() {
                        self.sessions.detach_for_execution(current.id).await?;
                        return Ok(current);
                    }
                    return Ok(waiting);
                }

                StepKind::Switch(cfg) => {
                    let target = cfg
                        .cases
                        .iter()
                        .find(|case| case.group.holds(&vars))
                        .map(|case| case.target)
                        .or(cfg.default_target);

                    match target {
                        Some(target) => {
                            self.record_closed_step(
                                &exec,
                                &step,
                                StepStatus::Completed,
                                Some(json!({ "target": target })),
                                None,
                            )
                            .await?;
                            exec = self.advance_to(&exec, target, &vars).await?;
                        }
                        None => {
                            self.record_closed_step(
                                &exec,
                                &step,
                                StepStatus::Failed,
                                None,
                                Some("no case matched and no default target".to_string()),
                            )
                            .await?;
                            return self
                                .fail_execution(
                                    exec,
                                    format!(
                                        "switch at step {} matched no case and has no default",
                                        step.index
                                    ),
                                )
                                .await;
                        }
                    }
                }

                StepKind::DataSetQuery(cfg) => {
                    let command = DataSetQueryCommand {
                        query: cfg.query.clone(),
                        parameters: cfg.parameters.clone(),
                    };
                    match self.collaborators.datasets.query(command).await {
                        Ok(result) => {
                            let row = result.rows.first().cloned().unwrap_or_default();
                            for binding in &cfg.bindings {
                                let Some(value) = row.get(&binding.column) else {
                                    continue;
                                };
                                if let Err(reason) = save_var(
                                    &mut vars,
                                    def,
                                    &binding.variable,
                                    VarValue::from_json(value.clone()),
                                ) {
                                    self.record_closed_step(
                                        &exec,
                                        &step,
                                        StepStatus::Failed,
                                        None,
                                        Some(reason.clone()),
                                    )
                                    .await?;
                                    return self.fail_execution(exec, reason).await;
                                }
                            }
                            self.record_closed_step(
                                &exec,
                                &step,
                                StepStatus::Completed,
                                Some(json!({ "rows": result.rows.len() })),
                                None,
                            )
                            .await?;
                            exec = self.advance_to(&exec, step.index + 1, &vars).await?;
                        }
                        Err(e) => {
                            let reason = format!("dataset query failed: {e}");
                            self.record_closed_step(
                                &exec,
                                &step,
                                StepStatus::Failed,
                                None,
                                Some(reason.clone()),
                            )
                            .await?;
                            return self.fail_execution(exec, reason).await;
                        }
                    }
                }

                StepKind::CallExternalApi(cfg) => {
                    let attempt = self
                        .create_step(&exec, &step, StepStatus::Running, None)
                        .await?;
                    let command = ApiCallCommand {
                        method: cfg.method.clone(),
                        url: render_placeholders(&cfg.url, &vars),
                        headers: cfg.headers.clone(),
                        body: cfg.body.clone(),
                        correlation_id: attempt.id,
                    };

                    match self.collaborators.api.call(command).await {
                        Ok(result) if result.is_accepted() => {
                            // Asynchronous API: park until the callback
                            return self
                                .enter_wait(
                                    &exec,
                                    &step,
                                    None,
                                    None,
                                    Some(attempt.id),
                                )
                                .await;
                        }
                        Ok(result) if result.is_success() => {
                            self.store
                                .close_step_execution(
                                    attempt.id,
                                    &StepStatus::Completed.to_string(),
                                    Some(result.body),
                                    None,
                                )
                                .await?;
                            exec = self.advance_to(&exec, step.index + 1, &vars).await?;
                        }
                        Ok(result) => {
                            let reason =
                                format!("external API returned status {}", result.status);
                            self.store
                                .close_step_execution(
                                    attempt.id,
                                    &StepStatus::Failed.to_string(),
                                    Some(result.body),
                                    Some(reason.clone()),
                                )
                                .await?;
                            return self.fail_execution(exec, reason).await;
                        }
                        Err(e) => {
                            let reason = format!("external API call failed: {e}");
                            self.store
                                .close_step_execution(
                                    attempt.id,
                                    &StepStatus::Failed.to_string(),
                                    None,
                                    Some(reason.clone()),
                                )
                                .await?;
                            return self.fail_execution(exec, reason).await;
                        }
                    }
                }

                StepKind::SendEForm(cfg) => {
                    let prefill = cfg
                        .prefill
                        .iter()
                        .filter_map(|binding| {
                            vars.get(&binding.variable).map(|value| {
                                (
                                    binding.column.clone(),
                                    serde_json::Value::String(value.render()),
                                )
                            })
                        })
                        .collect();
                    let command = CreateFormCommand {
                        form_definition_id: cfg.form_definition_id,
                        prefill,
                    };

                    match self.collaborators.forms.create_form(command).await {
                        Ok(form_instance_id) => {
                            if cfg.wait_for_approval {
                                self.create_step(&exec, &step, StepStatus::Waiting, None)
                                    .await?;
                                return self
                                    .enter_wait(
                                        &exec,
                                        &step,
                                        cfg.deadline.as_ref(),
                                        Some(form_instance_id),
                                        None,
                                    )
                                    .await;
                            }
                            self.record_closed_step(
                                &exec,
                                &step,
                                StepStatus::Completed,
                                Some(json!({ "form_instance_id": form_instance_id })),
                                None,
                            )
                            .await?;
                            exec = self.advance_to(&exec, step.index + 1, &vars).await?;
                        }
                        Err(e) => {
                            let reason = format!("e-form creation failed: {e}");
                            self.record_closed_step(
                                &exec,
                                &step,
                                StepStatus::Failed,
                                None,
                                Some(reason.clone()),
                            )
                            .await?;
                            return self.fail_execution(exec, reason).await;
                        }
                    }
                }

                StepKind::End => {
                    self.record_closed_step(&exec, &step, StepStatus::Completed, None, None)
                        .await?;
                    let mut update = UpdateExecution::from_row(&exec);
                    update.clear_waiting();
                    update.status = ExecutionStatus::Completed.to_string();
                    update.ended_at = Some(Utc::now());
                    let row = self.commit(&exec, update).await?;
                    self.sessions.detach_for_execution(exec.id).await?;
                    info!(execution_id = %exec.id, "execution completed");
                    return Ok(row);
                }
            }
        }
    }

    // -- internals ---------------------------------------------------------

    async fn load_definition(&self, id: Uuid) -> Result<WorkflowDefinition, EngineError> {
        let row = self.store.get_definition(id).await?;
        Ok(serde_json::from_value(row.document)?)
    }

    fn expect_waiting(&self, exec: &ExecutionRow) -> Result<i32, EngineError> {
        let status = exec_status(exec)?;
        if status != ExecutionStatus::Waiting || !exec.is_waiting {
            return Err(EngineError::ExecutionNotWaiting(exec.id));
        }
        exec.current_waiting_step
            .ok_or(EngineError::ExecutionNotWaiting(exec.id))
    }

    async fn commit(
        &self,
        exec: &ExecutionRow,
        update: UpdateExecution,
    ) -> Result<ExecutionRow, EngineError> {
        self.store
            .update_execution(exec.id, exec.lock_version, update)
            .await
            .map_err(|e| EngineError::from_cas(e, exec.id))
    }

    /// Sweep-side commit: a CAS conflict means a signal beat the sweep to
    /// this row, which is the intended outcome. Returns whether the write
    /// landed.
    async fn commit_sweep(
        &self,
        exec: &ExecutionRow,
        update: UpdateExecution,
    ) -> Result<bool, EngineError> {
        match self
            .store
            .update_execution(exec.id, exec.lock_version, update)
            .await
        {
            Ok(_) => Ok(true),
            Err(StoreError::ConcurrencyConflict { .. }) => {
                debug!(execution_id = %exec.id, "sweep lost the race, skipping");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn advance_to(
        &self,
        exec: &ExecutionRow,
        next_step: i32,
        vars: &Variables,
    ) -> Result<ExecutionRow, EngineError> {
        let mut update = UpdateExecution::from_row(exec);
        update.current_step = next_step;
        update.variables = serde_json::to_value(vars)?;
        self.commit(exec, update).await
    }

    /// Park the execution in the waiting state for the given step.
    async fn enter_wait(
        &self,
        exec: &ExecutionRow,
        step: &StepDef,
        deadline: Option<&DeadlineConfig>,
        form_instance_id: Option<Uuid>,
        callback_id: Option<Uuid>,
    ) -> Result<ExecutionRow, EngineError> {
        let now = Utc::now();
        let mut update = UpdateExecution::from_row(exec);
        update.status = ExecutionStatus::Waiting.to_string();
        update.is_waiting = true;
        update.waiting_since = Some(now);
        update.current_waiting_step = Some(step.index);
        update.waiting_form_instance_id = form_instance_id;
        update.waiting_callback_id = callback_id;
        update.deadline_at = deadline.map(|cfg| now + chrono_duration(cfg.initial_deadline()));
        update.retries_sent = 0;
        update.escalated = false;
        let row = self.commit(exec, update).await?;
        debug!(
            execution_id = %exec.id,
            step_index = step.index,
            deadline_at = ?row.deadline_at,
            "execution waiting"
        );
        Ok(row)
    }

    async fn create_step(
        &self,
        exec: &ExecutionRow,
        step: &StepDef,
        status: StepStatus,
        waiting_for_user_id: Option<String>,
    ) -> Result<chatflow_storage::StepExecutionRow, EngineError> {
        Ok(self
            .store
            .create_step_execution(CreateStepExecution {
                execution_id: exec.id,
                step_index: step.index,
                step_type: step.kind.type_name().to_string(),
                status: status.to_string(),
                input: serde_json::to_value(&step.kind)?,
                waiting_for_user_id,
            })
            .await?)
    }

    /// Create and immediately close a step attempt (non-waiting steps).
    async fn record_closed_step(
        &self,
        exec: &ExecutionRow,
        step: &StepDef,
        status: StepStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<(), EngineError> {
        let attempt = self.create_step(exec, step, StepStatus::Running, None).await?;
        self.store
            .close_step_execution(attempt.id, &status.to_string(), output, error)
            .await?;
        Ok(())
    }

    async fn fail_execution(
        &self,
        exec: ExecutionRow,
        message: String,
    ) -> Result<ExecutionRow, EngineError> {
        warn!(execution_id = %exec.id, error = %message, "execution failed");

        // CAS first; a stale caller must not touch step rows or sessions
        let mut update = UpdateExecution::from_row(&exec);
        update.clear_waiting();
        update.status = ExecutionStatus::Failed.to_string();
        update.error = Some(message.clone());
        update.ended_at = Some(Utc::now());
        let row = self.commit(&exec, update).await?;

        if let Some(open) = self.store.get_open_step(exec.id).await? {
            self.store
                .close_step_execution(
                    open.id,
                    &StepStatus::Failed.to_string(),
                    None,
                    Some(message),
                )
                .await?;
        }
        self.sessions.detach_for_execution(exec.id).await?;
        Ok(row)
    }

    async fn send_retry(&self, exec: &ExecutionRow, cfg: &DeadlineConfig, vars: &Variables) {
        let (Some(user), Some(message)) = (&exec.waiting_for_user_id, &cfg.retry_message) else {
            return;
        };
        let command = SendMessageCommand {
            recipient: user.clone(),
            content: message.render(vars),
        };
        if let Err(e) = self.collaborators.gateway.send(command).await {
            warn!(execution_id = %exec.id, error = %e, "retry delivery failed");
        }
    }
}

fn exec_status(exec: &ExecutionRow) -> Result<ExecutionStatus, EngineError> {
    exec.status
        .parse()
        .map_err(|e: String| EngineError::Store(StoreError::Serialization(e)))
}

fn chrono_duration(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Substitute `{{variable}}` placeholders in a free-form string
fn render_placeholders(text: &str, vars: &Variables) -> String {
    match (MessageContent::Text {
        text: text.to_string(),
    })
    .render(vars)
    {
        chatflow_contracts::OutboundContent::Text { text } => text,
        _ => text.to_string(),
    }
}

/// Explicit recipient (with placeholders) wins; otherwise the execution's
/// conversation identity.
fn resolve_recipient(
    configured: Option<&str>,
    vars: &Variables,
    exec: &ExecutionRow,
) -> Option<String> {
    match configured {
        Some(recipient) => Some(render_placeholders(recipient, vars)),
        None => exec.waiting_for_user_id.clone(),
    }
}

/// Write a variable, enforcing the declared type (with scalar coercions)
/// when a declaration exists.
fn save_var(
    vars: &mut Variables,
    def: &WorkflowDefinition,
    name: &str,
    value: VarValue,
) -> Result<(), String> {
    match def.variable_decl(name) {
        Some(decl) => {
            let coerced = coerce(decl.data_type, value).ok_or_else(|| {
                format!(
                    "value for '{name}' does not match declared type {:?}",
                    decl.data_type
                )
            })?;
            vars.set_checked(decl, coerced).map_err(|e| e.to_string())
        }
        None => {
            vars.set(name, value);
            Ok(())
        }
    }
}

/// Scalar coercions applied at write time: string replies parse into the
/// declared numeric/boolean/datetime kinds, and anything renders into a
/// declared string.
fn coerce(target: VarType, value: VarValue) -> Option<VarValue> {
    if value.kind() == target {
        return Some(value);
    }
    match (target, &value) {
        (VarType::Text, VarValue::String(s)) => Some(VarValue::Text(s.clone())),
        (VarType::Int, VarValue::String(s)) => s.trim().parse().ok().map(VarValue::Int),
        (VarType::Decimal, VarValue::String(s)) => s.trim().parse().ok().map(VarValue::Decimal),
        (VarType::Decimal, VarValue::Int(i)) => Some(VarValue::Decimal(*i as f64)),
        (VarType::Bool, VarValue::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(VarValue::Bool(true)),
            "false" | "no" | "0" => Some(VarValue::Bool(false)),
            _ => None,
        },
        (VarType::DateTime, VarValue::String(s)) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| VarValue::DateTime(dt.with_timezone(&Utc))),
        (VarType::String, other) => Some(VarValue::String(other.render())),
        _ => None,
    }
}
