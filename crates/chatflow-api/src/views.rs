// Row -> public view conversions

use chatflow_contracts::{ExecutionStatus, ExecutionView, StepExecutionView, StepStatus};
use chatflow_storage::{ExecutionRow, StepExecutionRow};

pub fn execution_view(row: &ExecutionRow) -> ExecutionView {
    ExecutionView {
        id: row.id,
        definition_id: row.definition_id,
        definition_version: row.definition_version,
        status: row.status.parse().unwrap_or(ExecutionStatus::Running),
        current_step: row.current_step,
        variables: row.variables.clone(),
        is_waiting: row.is_waiting,
        waiting_since: row.waiting_since,
        last_user_activity: row.last_user_activity,
        current_waiting_step: row.current_waiting_step,
        waiting_for_user_id: row.waiting_for_user_id.clone(),
        escalated: row.escalated,
        error: row.error.clone(),
        started_at: row.started_at,
        ended_at: row.ended_at,
    }
}

pub fn step_view(row: &StepExecutionRow) -> StepExecutionView {
    StepExecutionView {
        id: row.id,
        execution_id: row.execution_id,
        step_index: row.step_index,
        step_type: row.step_type.clone(),
        status: row.status.parse().unwrap_or(StepStatus::Pending),
        output: row.output.clone(),
        error: row.error.clone(),
        started_at: row.started_at,
        ended_at: row.ended_at,
    }
}
