// Signal intake HTTP routes
//
// Inbound chat messages, e-form terminal callbacks and asynchronous API
// callbacks all land here and are handed to the orchestrator. Conflict
// responses (409) mean the execution advanced concurrently; the caller
// should not retry.

use std::sync::Arc;

use axum::{extract::State, routing::post, Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use chatflow_contracts::{ExternalCallbackResult, FormInstanceTerminal, InboundMessage};
use chatflow_engine::{AdvanceOutcome, Orchestrator};

use crate::errors::{engine_error, ApiError};

/// App state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Outcome of delivering a signal
#[derive(Debug, Serialize, ToSchema)]
pub struct SignalResponse {
    /// "advanced" when the execution moved forward, "rejected" when the
    /// message failed validation and the execution keeps waiting
    pub outcome: &'static str,
}

impl From<AdvanceOutcome> for SignalResponse {
    fn from(outcome: AdvanceOutcome) -> Self {
        Self {
            outcome: match outcome {
                AdvanceOutcome::Advanced => "advanced",
                AdvanceOutcome::Rejected => "rejected",
            },
        }
    }
}

/// Create signal routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/signals/messages", post(inbound_message))
        .route("/v1/signals/forms", post(form_terminal))
        .route("/v1/signals/callbacks", post(api_callback))
        .with_state(state)
}

/// POST /v1/signals/messages - Inbound chat message
#[utoipa::path(
    post,
    path = "/v1/signals/messages",
    request_body = InboundMessage,
    responses(
        (status = 200, description = "Signal delivered", body = SignalResponse),
        (status = 404, description = "No waiting execution for this sender"),
        (status = 409, description = "Execution advanced concurrently"),
        (status = 500, description = "Internal server error")
    ),
    tag = "signals"
)]
pub async fn inbound_message(
    State(state): State<AppState>,
    Json(message): Json<InboundMessage>,
) -> Result<Json<SignalResponse>, ApiError> {
    let outcome = state
        .orchestrator
        .signal_message(message)
        .await
        .map_err(engine_error)?;
    Ok(Json(outcome.into()))
}

/// POST /v1/signals/forms - E-form terminal callback
#[utoipa::path(
    post,
    path = "/v1/signals/forms",
    request_body = FormInstanceTerminal,
    responses(
        (status = 200, description = "Signal delivered", body = SignalResponse),
        (status = 404, description = "No execution waiting on this form instance"),
        (status = 409, description = "Execution advanced concurrently"),
        (status = 500, description = "Internal server error")
    ),
    tag = "signals"
)]
pub async fn form_terminal(
    State(state): State<AppState>,
    Json(terminal): Json<FormInstanceTerminal>,
) -> Result<Json<SignalResponse>, ApiError> {
    let outcome = state
        .orchestrator
        .signal_form(terminal)
        .await
        .map_err(engine_error)?;
    Ok(Json(outcome.into()))
}

/// POST /v1/signals/callbacks - Asynchronous external API result
#[utoipa::path(
    post,
    path = "/v1/signals/callbacks",
    request_body = ExternalCallbackResult,
    responses(
        (status = 200, description = "Signal delivered", body = SignalResponse),
        (status = 404, description = "No execution waiting on this correlation id"),
        (status = 409, description = "Execution advanced concurrently"),
        (status = 500, description = "Internal server error")
    ),
    tag = "signals"
)]
pub async fn api_callback(
    State(state): State<AppState>,
    Json(result): Json<ExternalCallbackResult>,
) -> Result<Json<SignalResponse>, ApiError> {
    let outcome = state
        .orchestrator
        .signal_callback(result)
        .await
        .map_err(engine_error)?;
    Ok(Json(outcome.into()))
}
