// Chatflow API server
//
// Signal intake and execution control over the workflow engine. Chat
// messages, e-form callbacks and external API callbacks arrive here; the
// escalation sweep runs in the separate worker binary.

mod errors;
mod executions;
mod signals;
mod views;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Json, Router};
use serde::Serialize;
use sqlx::PgPool;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use chatflow_contracts::*;
use chatflow_engine::{CollaboratorConfig, Collaborators, Orchestrator};
use chatflow_storage::{ExecutionStore, PostgresExecutionStore};

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        executions::start_execution,
        executions::get_execution,
        executions::list_steps,
        executions::cancel_execution,
        signals::inbound_message,
        signals::form_terminal,
        signals::api_callback,
    ),
    components(
        schemas(
            ExecutionView, ExecutionStatus,
            StepExecutionView, StepStatus,
            InboundMessage, MessageType,
            FormInstanceTerminal, FormOutcome,
            ExternalCallbackResult,
            ErrorResponse,
            ListResponse<StepExecutionView>,
            executions::StartExecutionRequest,
            executions::ExecutionDetail,
            signals::SignalResponse,
        )
    ),
    tags(
        (name = "executions", description = "Execution control endpoints"),
        (name = "signals", description = "Signal intake endpoints")
    ),
    info(
        title = "Chatflow API",
        version = "0.2.0",
        description = "Signal intake and execution control for the Chatflow workflow engine",
        license(name = "MIT", url = "https://opensource.org/licenses/MIT")
    )
)]
struct ApiDoc;

/// Build the application router around a shared orchestrator
fn app(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(executions::routes(executions::AppState {
            orchestrator: orchestrator.clone(),
        }))
        .merge(signals::routes(signals::AppState { orchestrator }))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatflow_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("chatflow-api starting...");

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;
    let pool = PgPool::connect(&database_url)
        .await
        .context("Failed to connect to database")?;
    let store = PostgresExecutionStore::new(pool);
    store.migrate().await.context("Failed to run migrations")?;
    tracing::info!("Connected to database");

    let collaborator_config = CollaboratorConfig::from_env();
    let collaborators = Collaborators::http(&collaborator_config);
    let store: Arc<dyn ExecutionStore> = Arc::new(store);
    let orchestrator = Arc::new(Orchestrator::new(store, collaborators));

    let app = app(orchestrator);

    let addr = "0.0.0.0:9100";
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use uuid::Uuid;

    use chatflow_core::{
        DefinitionStatus, ExpectedReply, StartConfig, StepDef, StepKind, VarType, VariableDecl,
        WaitConfig, WorkflowDefinition,
    };
    use chatflow_storage::{CreateDefinition, InMemoryExecutionStore};

    fn test_app() -> (Router, Arc<InMemoryExecutionStore>) {
        let store = Arc::new(InMemoryExecutionStore::new());
        let store_dyn: Arc<dyn ExecutionStore> = store.clone();
        let collaborators = Collaborators::http(&CollaboratorConfig::from_env());
        let orchestrator = Arc::new(Orchestrator::new(store_dyn, collaborators));
        (app(orchestrator), store)
    }

    async fn seed_definition(store: &InMemoryExecutionStore) -> Uuid {
        let def = WorkflowDefinition {
            id: Uuid::now_v7(),
            tenant_id: Uuid::now_v7(),
            name: "intake".to_string(),
            version: 1,
            status: DefinitionStatus::Active,
            variables: vec![VariableDecl {
                name: "reply".to_string(),
                data_type: VarType::String,
            }],
            steps: vec![
                StepDef {
                    index: 0,
                    name: "start".to_string(),
                    kind: StepKind::Start(StartConfig::default()),
                },
                StepDef {
                    index: 1,
                    name: "ask".to_string(),
                    kind: StepKind::WaitForReply(WaitConfig {
                        expect: ExpectedReply::FreeText,
                        save_as: Some("reply".to_string()),
                        deadline: None,
                    }),
                },
                StepDef {
                    index: 2,
                    name: "done".to_string(),
                    kind: StepKind::End,
                },
            ],
        };
        store
            .insert_definition(CreateDefinition {
                id: def.id,
                tenant_id: def.tenant_id,
                name: def.name.clone(),
                version: 1,
                status: "active".to_string(),
                document: serde_json::to_value(&def).unwrap(),
            })
            .await
            .unwrap();
        def.id
    }

    fn json_request(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint_responds() {
        let (app, _store) = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn start_get_signal_cancel_round_trip() {
        let (app, store) = test_app();
        let def_id = seed_definition(&store).await;

        // Start: parks on the wait step
        let response = app
            .clone()
            .oneshot(json_request(
                "/v1/executions",
                serde_json::json!({"definition_id": def_id, "user_id": "u1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = body_json(response).await;
        assert_eq!(body["status"], "waiting");
        let execution_id = body["id"].as_str().unwrap().to_string();

        // Get: view plus step attempts
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/executions/{execution_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["execution"]["current_waiting_step"], 1);
        assert_eq!(body["steps"].as_array().unwrap().len(), 2);

        // Message signal advances the execution to completion
        let response = app
            .clone()
            .oneshot(json_request(
                "/v1/signals/messages",
                serde_json::json!({
                    "sender_id": "u1",
                    "raw_content": "hello",
                    "message_type": "text",
                    "timestamp": chrono::Utc::now(),
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["outcome"], "advanced");

        // Cancel after completion is an idempotent 200
        let response = app
            .oneshot(json_request(
                &format!("/v1/executions/{execution_id}/cancel"),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "completed");
    }

    #[tokio::test]
    async fn step_list_endpoint_returns_attempts_in_order() {
        let (app, store) = test_app();
        let def_id = seed_definition(&store).await;

        let response = app
            .clone()
            .oneshot(json_request(
                "/v1/executions",
                serde_json::json!({"definition_id": def_id, "user_id": "u1"}),
            ))
            .await
            .unwrap();
        let execution_id = body_json(response).await["id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/executions/{execution_id}/steps"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let steps = body["data"].as_array().unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0]["step_type"], "start");
        assert_eq!(steps[1]["step_type"], "wait_for_reply");
        assert_eq!(steps[1]["status"], "waiting");

        // Unknown executions are a 404, not an empty list
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/executions/{}/steps", Uuid::now_v7()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_execution_is_404() {
        let (app, _store) = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/executions/{}", Uuid::now_v7()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_sender_is_404() {
        let (app, _store) = test_app();
        let response = app
            .oneshot(json_request(
                "/v1/signals/messages",
                serde_json::json!({
                    "sender_id": "nobody",
                    "raw_content": "hi",
                    "message_type": "text",
                    "timestamp": chrono::Utc::now(),
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("nobody"));
    }

    #[tokio::test]
    async fn busy_session_is_409() {
        let (app, store) = test_app();
        let def_id = seed_definition(&store).await;

        let first = app
            .clone()
            .oneshot(json_request(
                "/v1/executions",
                serde_json::json!({"definition_id": def_id, "user_id": "u1"}),
            ))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = app
            .oneshot(json_request(
                "/v1/executions",
                serde_json::json!({"definition_id": def_id, "user_id": "u1"}),
            ))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn undeclared_trigger_variable_is_400() {
        let (app, store) = test_app();
        let def_id = seed_definition(&store).await;

        let response = app
            .oneshot(json_request(
                "/v1/executions",
                serde_json::json!({
                    "definition_id": def_id,
                    "user_id": "u1",
                    "variables": {"bogus": 1},
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_form_instance_is_404() {
        let (app, _store) = test_app();
        let response = app
            .oneshot(json_request(
                "/v1/signals/forms",
                serde_json::json!({
                    "form_instance_id": Uuid::now_v7(),
                    "outcome": "approved",
                    "approver_id": "mgr-1",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
