// Signals consumed by the orchestrator
//
// Inbound messages and form callbacks arrive from external collaborators
// through the API; timer signals are produced internally by the escalation
// scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Shape of an inbound chat message payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    QrCode,
    Selection,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::QrCode => write!(f, "qr_code"),
            Self::Selection => write!(f, "selection"),
        }
    }
}

/// A message received from an end user over the chat channel
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InboundMessage {
    /// Chat identity of the sender (gateway-scoped, not a Chatflow id)
    pub sender_id: String,
    pub raw_content: String,
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
}

/// Terminal outcome of an e-form instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FormOutcome {
    Approved,
    Rejected,
}

/// Callback fired by the e-form collaborator when a form instance reaches
/// a terminal approval state
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FormInstanceTerminal {
    pub form_instance_id: Uuid,
    pub outcome: FormOutcome,
    pub approver_id: String,
}

/// Result of an asynchronous external API call
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ExternalCallbackResult {
    pub correlation_id: Uuid,
    pub payload: serde_json::Value,
}

/// Internal signal emitted when a waiting step's deadline elapses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerElapsed {
    pub execution_id: Uuid,
    pub step_index: i32,
}

/// Any signal the orchestrator can consume
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    InboundMessage(InboundMessage),
    FormInstanceTerminal(FormInstanceTerminal),
    ExternalCallbackResult(ExternalCallbackResult),
    TimerElapsed(TimerElapsed),
}

impl Signal {
    /// Short tag for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InboundMessage(_) => "inbound_message",
            Self::FormInstanceTerminal(_) => "form_instance_terminal",
            Self::ExternalCallbackResult(_) => "external_callback_result",
            Self::TimerElapsed(_) => "timer_elapsed",
        }
    }
}
