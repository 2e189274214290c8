//! Collaborator seams
//!
//! The orchestrator drives its external systems through these traits:
//! the chat gateway, the dataset service, arbitrary external APIs and the
//! e-form service. Production wiring uses the HTTP implementations in
//! [`crate::http`]; tests substitute recording fakes.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use chatflow_contracts::{
    ApiCallCommand, ApiCallResult, CreateFormCommand, DataSetQueryCommand, QueryResult,
    SendMessageCommand,
};

use crate::error::EngineError;

/// Delivers messages to chat identities
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    async fn send(&self, command: SendMessageCommand) -> Result<(), EngineError>;
}

/// Runs queries against the external dataset service
#[async_trait]
pub trait DataSetService: Send + Sync {
    async fn query(&self, command: DataSetQueryCommand) -> Result<QueryResult, EngineError>;
}

/// Invokes external HTTP APIs on behalf of CallExternalApi steps
#[async_trait]
pub trait ExternalApiClient: Send + Sync {
    async fn call(&self, command: ApiCallCommand) -> Result<ApiCallResult, EngineError>;
}

/// Creates e-form instances and returns their ids
#[async_trait]
pub trait EFormService: Send + Sync {
    async fn create_form(&self, command: CreateFormCommand) -> Result<Uuid, EngineError>;
}

/// The full set of collaborators handed to the orchestrator
#[derive(Clone)]
pub struct Collaborators {
    pub gateway: Arc<dyn MessagingGateway>,
    pub datasets: Arc<dyn DataSetService>,
    pub api: Arc<dyn ExternalApiClient>,
    pub forms: Arc<dyn EFormService>,
}
