// Execution control HTTP routes

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use chatflow_contracts::{ExecutionView, ListResponse, StepExecutionView};
use chatflow_engine::{Orchestrator, StartTrigger};

use crate::errors::{engine_error, ApiError};
use crate::views::{execution_view, step_view};

/// App state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Request to start an execution
#[derive(Debug, Deserialize, ToSchema)]
pub struct StartExecutionRequest {
    pub definition_id: Uuid,
    /// Chat identity the flow converses with
    pub user_id: Option<String>,
    /// Initial process variables, validated against the declarations
    #[serde(default)]
    #[schema(value_type = Object)]
    pub variables: HashMap<String, serde_json::Value>,
}

/// Execution view together with its step attempts
#[derive(Debug, serde::Serialize, ToSchema)]
pub struct ExecutionDetail {
    pub execution: ExecutionView,
    pub steps: Vec<StepExecutionView>,
}

/// Create execution routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/executions", post(start_execution))
        .route("/v1/executions/:execution_id", get(get_execution))
        .route("/v1/executions/:execution_id/steps", get(list_steps))
        .route("/v1/executions/:execution_id/cancel", post(cancel_execution))
        .with_state(state)
}

/// POST /v1/executions - Start an execution from an Active definition
#[utoipa::path(
    post,
    path = "/v1/executions",
    request_body = StartExecutionRequest,
    responses(
        (status = 201, description = "Execution started", body = ExecutionView),
        (status = 400, description = "Invalid trigger variables"),
        (status = 404, description = "Definition not found"),
        (status = 409, description = "Definition not active or user session busy"),
        (status = 500, description = "Internal server error")
    ),
    tag = "executions"
)]
pub async fn start_execution(
    State(state): State<AppState>,
    Json(req): Json<StartExecutionRequest>,
) -> Result<(StatusCode, Json<ExecutionView>), ApiError> {
    let trigger = StartTrigger {
        user_id: req.user_id,
        variables: req.variables,
    };
    let row = state
        .orchestrator
        .start(req.definition_id, trigger)
        .await
        .map_err(engine_error)?;

    tracing::info!(execution_id = %row.id, status = %row.status, "execution started");
    Ok((StatusCode::CREATED, Json(execution_view(&row))))
}

/// GET /v1/executions/:execution_id
#[utoipa::path(
    get,
    path = "/v1/executions/{execution_id}",
    params(
        ("execution_id" = Uuid, Path, description = "Execution ID")
    ),
    responses(
        (status = 200, description = "Execution found", body = ExecutionDetail),
        (status = 404, description = "Execution not found"),
        (status = 500, description = "Internal server error")
    ),
    tag = "executions"
)]
pub async fn get_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<ExecutionDetail>, ApiError> {
    let store = state.orchestrator.store();
    let row = store
        .get_execution(execution_id)
        .await
        .map_err(|e| engine_error(e.into()))?;
    let steps = store
        .list_step_executions(execution_id)
        .await
        .map_err(|e| engine_error(e.into()))?;

    Ok(Json(ExecutionDetail {
        execution: execution_view(&row),
        steps: steps.iter().map(step_view).collect(),
    }))
}

/// GET /v1/executions/:execution_id/steps
#[utoipa::path(
    get,
    path = "/v1/executions/{execution_id}/steps",
    params(
        ("execution_id" = Uuid, Path, description = "Execution ID")
    ),
    responses(
        (status = 200, description = "Step attempts in execution order", body = ListResponse<StepExecutionView>),
        (status = 404, description = "Execution not found"),
        (status = 500, description = "Internal server error")
    ),
    tag = "executions"
)]
pub async fn list_steps(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<ListResponse<StepExecutionView>>, ApiError> {
    let store = state.orchestrator.store();
    // Surface a 404 for unknown executions instead of an empty list
    store
        .get_execution(execution_id)
        .await
        .map_err(|e| engine_error(e.into()))?;
    let steps = store
        .list_step_executions(execution_id)
        .await
        .map_err(|e| engine_error(e.into()))?;

    Ok(Json(steps.iter().map(step_view).collect::<Vec<_>>().into()))
}

/// POST /v1/executions/:execution_id/cancel
#[utoipa::path(
    post,
    path = "/v1/executions/{execution_id}/cancel",
    params(
        ("execution_id" = Uuid, Path, description = "Execution ID")
    ),
    responses(
        (status = 200, description = "Execution cancelled", body = ExecutionView),
        (status = 404, description = "Execution not found"),
        (status = 500, description = "Internal server error")
    ),
    tag = "executions"
)]
pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<ExecutionView>, ApiError> {
    let row = state
        .orchestrator
        .cancel(execution_id)
        .await
        .map_err(engine_error)?;

    tracing::info!(execution_id = %execution_id, "execution cancelled");
    Ok(Json(execution_view(&row)))
}
