//! HTTP implementations of the collaborator traits
//!
//! Each collaborator is a plain JSON-over-HTTP service; base URLs come
//! from the environment. Transport errors and non-2xx responses surface
//! as [`EngineError::Collaborator`] except for the external API client,
//! which reports the status to the orchestrator and lets it decide.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use chatflow_contracts::{
    ApiCallCommand, ApiCallResult, CreateFormCommand, DataSetQueryCommand, QueryResult,
    SendMessageCommand,
};

use crate::collaborators::{
    Collaborators, DataSetService, EFormService, ExternalApiClient, MessagingGateway,
};
use crate::error::EngineError;

/// Base URLs of the collaborator services
#[derive(Debug, Clone)]
pub struct CollaboratorConfig {
    env: HashMap<String, String>,
}

impl CollaboratorConfig {
    pub fn from_env() -> Self {
        let mut env = HashMap::new();
        for key in ["GATEWAY_URL", "DATASET_URL", "EFORM_URL"] {
            if let Ok(value) = std::env::var(key) {
                env.insert(key.to_string(), value);
            }
        }
        Self { env }
    }

    pub fn gateway_url(&self) -> String {
        self.get_or("GATEWAY_URL", "http://localhost:9201")
    }

    pub fn dataset_url(&self) -> String {
        self.get_or("DATASET_URL", "http://localhost:9202")
    }

    pub fn eform_url(&self) -> String {
        self.get_or("EFORM_URL", "http://localhost:9203")
    }

    fn get_or(&self, key: &str, default: &str) -> String {
        self.env
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_default()
}

fn transport_err(e: reqwest::Error) -> EngineError {
    EngineError::Collaborator(e.to_string())
}

/// Chat gateway client: `POST {base}/messages`
pub struct HttpMessagingGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMessagingGateway {
    pub fn new(base_url: String) -> Self {
        Self {
            client: client(),
            base_url,
        }
    }
}

#[async_trait]
impl MessagingGateway for HttpMessagingGateway {
    async fn send(&self, command: SendMessageCommand) -> Result<(), EngineError> {
        debug!(recipient = %command.recipient, "dispatching message");
        self.client
            .post(format!("{}/messages", self.base_url))
            .json(&command)
            .send()
            .await
            .map_err(transport_err)?
            .error_for_status()
            .map_err(transport_err)?;
        Ok(())
    }
}

/// Dataset service client: `POST {base}/queries`
pub struct HttpDataSetService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDataSetService {
    pub fn new(base_url: String) -> Self {
        Self {
            client: client(),
            base_url,
        }
    }
}

#[async_trait]
impl DataSetService for HttpDataSetService {
    async fn query(&self, command: DataSetQueryCommand) -> Result<QueryResult, EngineError> {
        let response = self
            .client
            .post(format!("{}/queries", self.base_url))
            .json(&command)
            .send()
            .await
            .map_err(transport_err)?
            .error_for_status()
            .map_err(transport_err)?;

        response.json().await.map_err(transport_err)
    }
}

/// Issues the configured request directly against the target API
pub struct HttpExternalApiClient {
    client: reqwest::Client,
}

impl HttpExternalApiClient {
    pub fn new() -> Self {
        Self { client: client() }
    }
}

impl Default for HttpExternalApiClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExternalApiClient for HttpExternalApiClient {
    async fn call(&self, command: ApiCallCommand) -> Result<ApiCallResult, EngineError> {
        let method = reqwest::Method::from_bytes(command.method.to_uppercase().as_bytes())
            .map_err(|_| {
                EngineError::Collaborator(format!("invalid HTTP method: {}", command.method))
            })?;

        let mut request = self
            .client
            .request(method, &command.url)
            .header("x-correlation-id", command.correlation_id.to_string());
        for (name, value) in &command.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &command.body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(transport_err)?;
        let status = response.status().as_u16();
        let body = response
            .json()
            .await
            .unwrap_or(serde_json::Value::Null);

        Ok(ApiCallResult { status, body })
    }
}

/// E-form service client: `POST {base}/forms`
pub struct HttpEFormService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEFormService {
    pub fn new(base_url: String) -> Self {
        Self {
            client: client(),
            base_url,
        }
    }
}

#[derive(Deserialize)]
struct CreateFormResponse {
    form_instance_id: Uuid,
}

#[async_trait]
impl EFormService for HttpEFormService {
    async fn create_form(&self, command: CreateFormCommand) -> Result<Uuid, EngineError> {
        let response: CreateFormResponse = self
            .client
            .post(format!("{}/forms", self.base_url))
            .json(&command)
            .send()
            .await
            .map_err(transport_err)?
            .error_for_status()
            .map_err(transport_err)?
            .json()
            .await
            .map_err(transport_err)?;

        Ok(response.form_instance_id)
    }
}

impl Collaborators {
    /// Production wiring: HTTP clients from [`CollaboratorConfig`]
    pub fn http(config: &CollaboratorConfig) -> Self {
        Self {
            gateway: Arc::new(HttpMessagingGateway::new(config.gateway_url())),
            datasets: Arc::new(HttpDataSetService::new(config.dataset_url())),
            api: Arc::new(HttpExternalApiClient::new()),
            forms: Arc::new(HttpEFormService::new(config.eform_url())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_apply() {
        let config = CollaboratorConfig {
            env: HashMap::new(),
        };
        assert_eq!(config.gateway_url(), "http://localhost:9201");
        assert_eq!(config.dataset_url(), "http://localhost:9202");
        assert_eq!(config.eform_url(), "http://localhost:9203");
    }

    #[test]
    fn config_env_overrides() {
        let config = CollaboratorConfig {
            env: [("GATEWAY_URL".to_string(), "http://gw:1".to_string())].into(),
        };
        assert_eq!(config.gateway_url(), "http://gw:1");
        assert_eq!(config.dataset_url(), "http://localhost:9202");
    }
}
