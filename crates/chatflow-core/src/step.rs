//! The step vocabulary
//!
//! Steps are a closed, serde-tagged sum type. The orchestrator dispatches
//! over [`StepKind`] with an exhaustive match, so adding a step type is a
//! compile-time-checked change rather than a stringly-typed one.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use chatflow_contracts::OutboundContent;

use crate::condition::ConditionGroup;
use crate::escalation::{DeadlineConfig, OverdueConfig};
use crate::variables::Variables;

/// Message content as authored in a definition.
///
/// Literal text supports `{{variable}}` placeholders substituted from the
/// execution's process variables at send time; templates resolve their
/// variable references the same way and are rendered by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: String },
    Template {
        template_ref: String,
        /// template slot -> process variable name
        variables: HashMap<String, String>,
    },
}

impl MessageContent {
    /// Resolve placeholders/variable references against the current
    /// process variables, producing gateway-ready content.
    pub fn render(&self, variables: &Variables) -> OutboundContent {
        match self {
            Self::Text { text } => {
                let mut rendered = text.clone();
                for (name, value) in variables.iter() {
                    let placeholder = format!("{{{{{name}}}}}");
                    if rendered.contains(&placeholder) {
                        rendered = rendered.replace(&placeholder, &value.render());
                    }
                }
                OutboundContent::Text { text: rendered }
            }
            Self::Template {
                template_ref,
                variables: refs,
            } => {
                let resolved = refs
                    .iter()
                    .map(|(slot, var_name)| {
                        let value = variables
                            .get(var_name)
                            .map(|v| v.render())
                            .unwrap_or_default();
                        (slot.clone(), value)
                    })
                    .collect();
                OutboundContent::Template {
                    template_ref: template_ref.clone(),
                    variables: resolved,
                }
            }
        }
    }
}

/// Shape of the user reply a waiting step accepts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExpectedReply {
    FreeText,
    QrCode,
    Selection { options: Vec<String> },
}

/// Maps an external column/field to a process variable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldBinding {
    pub column: String,
    pub variable: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overdue: Option<OverdueConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageConfig {
    pub content: MessageContent,
    /// Defaults to the execution's waiting/trigger user when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitConfig {
    pub expect: ExpectedReply,
    /// Process variable that receives the extracted reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_as: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DeadlineConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchCase {
    pub group: ConditionGroup,
    /// Step index to jump to when the group holds
    pub target: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchConfig {
    pub cases: Vec<SwitchCase>,
    /// Followed when no case matches; its absence is a definition error
    /// surfaced at evaluation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_target: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    pub query: String,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    /// Result columns of the first row mapped into process variables
    pub bindings: Vec<FieldBinding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCallConfig {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EFormConfig {
    pub form_definition_id: Uuid,
    /// process variable -> form field prefill
    #[serde(default)]
    pub prefill: Vec<FieldBinding>,
    /// When set, behaves like a wait keyed on the form's terminal state
    #[serde(default)]
    pub wait_for_approval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DeadlineConfig>,
}

/// The closed set of step types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Start(StartConfig),
    SendMessage(SendMessageConfig),
    WaitForReply(WaitConfig),
    WaitForQrCode(WaitConfig),
    Switch(SwitchConfig),
    DataSetQuery(QueryConfig),
    CallExternalApi(ApiCallConfig),
    SendEForm(EFormConfig),
    End,
}

impl StepKind {
    /// Stable type tag persisted on step-execution rows
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::SendMessage(_) => "send_message",
            Self::WaitForReply(_) => "wait_for_reply",
            Self::WaitForQrCode(_) => "wait_for_qr_code",
            Self::Switch(_) => "switch",
            Self::DataSetQuery(_) => "data_set_query",
            Self::CallExternalApi(_) => "call_external_api",
            Self::SendEForm(_) => "send_e_form",
            Self::End => "end",
        }
    }

    /// Deadline configuration for steps that can wait
    pub fn deadline(&self) -> Option<&DeadlineConfig> {
        match self {
            Self::WaitForReply(cfg) | Self::WaitForQrCode(cfg) => cfg.deadline.as_ref(),
            Self::SendEForm(cfg) if cfg.wait_for_approval => cfg.deadline.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::VarValue;

    #[test]
    fn step_kind_serializes_with_type_tag() {
        let step = StepKind::SendMessage(SendMessageConfig {
            content: MessageContent::Text {
                text: "hi".to_string(),
            },
            recipient: None,
        });
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["type"], "send_message");

        let back: StepKind = serde_json::from_value(json).unwrap();
        assert_eq!(back.type_name(), "send_message");
    }

    #[test]
    fn text_render_substitutes_placeholders() {
        let mut vars = Variables::new();
        vars.set("name", VarValue::String("Ada".to_string()));
        vars.set("count", VarValue::Int(2));

        let content = MessageContent::Text {
            text: "Hello {{name}}, you have {{count}} items".to_string(),
        };
        match content.render(&vars) {
            OutboundContent::Text { text } => {
                assert_eq!(text, "Hello Ada, you have 2 items");
            }
            _ => panic!("expected text"),
        }
    }

    #[test]
    fn template_render_resolves_variable_refs() {
        let mut vars = Variables::new();
        vars.set("order_id", VarValue::String("A-17".to_string()));

        let content = MessageContent::Template {
            template_ref: "order_update".to_string(),
            variables: [("1".to_string(), "order_id".to_string())].into(),
        };
        match content.render(&vars) {
            OutboundContent::Template { variables, .. } => {
                assert_eq!(variables.get("1").map(String::as_str), Some("A-17"));
            }
            _ => panic!("expected template"),
        }
    }

    #[test]
    fn deadline_only_on_waiting_steps() {
        let wait = StepKind::WaitForReply(WaitConfig {
            expect: ExpectedReply::FreeText,
            save_as: None,
            deadline: Some(DeadlineConfig {
                deadline: std::time::Duration::from_secs(60),
                retry_count: 0,
                retry_interval: std::time::Duration::from_secs(30),
                retry_message: None,
                escalation: None,
            }),
        });
        assert!(wait.deadline().is_some());
        assert!(StepKind::End.deadline().is_none());
    }
}
