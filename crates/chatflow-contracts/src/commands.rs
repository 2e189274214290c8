// Commands emitted by the orchestrator
//
// These are the narrow interfaces through which the engine drives its
// external collaborators. The engine never blocks on delivery; command
// failures are recorded on the step that issued them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Rendered message content handed to the messaging gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundContent {
    /// Literal text
    Text { text: String },
    /// Gateway-side template with substitution variables
    Template {
        template_ref: String,
        variables: HashMap<String, String>,
    },
}

/// Send a message to a chat identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageCommand {
    pub recipient: String,
    pub content: OutboundContent,
}

/// Run a query against the external dataset service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSetQueryCommand {
    pub query: String,
    pub parameters: HashMap<String, serde_json::Value>,
}

/// One result set returned by the dataset service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    /// Rows as column-name -> value maps
    pub rows: Vec<HashMap<String, serde_json::Value>>,
}

/// Invoke an external HTTP API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCallCommand {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<serde_json::Value>,
    /// Echoed back by asynchronous APIs through the callback route
    pub correlation_id: Uuid,
}

/// Response of an external HTTP API call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCallResult {
    pub status: u16,
    pub body: serde_json::Value,
}

impl ApiCallResult {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 202 means the API accepted the call and will deliver the result
    /// through the callback route, correlated by `correlation_id`.
    pub fn is_accepted(&self) -> bool {
        self.status == 202
    }
}

/// Create an e-form instance for approval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFormCommand {
    pub form_definition_id: Uuid,
    pub prefill: HashMap<String, serde_json::Value>,
}
