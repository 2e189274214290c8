//! Chatflow domain model
//!
//! Pure types and policies for the workflow execution engine:
//!
//! - **Definitions**: versioned, immutable step graphs ([`WorkflowDefinition`])
//! - **Steps**: a closed sum type over the step vocabulary ([`StepKind`]),
//!   dispatched exhaustively by the orchestrator
//! - **Process variables**: typed named values carried through an execution
//!   ([`Variables`]), validated at write time
//! - **Validators**: message-shape and deadline predicates
//! - **Retry/escalation**: deadline configuration and the sweep decision policy
//!
//! Nothing here touches storage or the network; the engine crate drives
//! these types against an `ExecutionStore` and the external collaborators.

pub mod condition;
pub mod definition;
pub mod escalation;
pub mod step;
pub mod validators;
pub mod variables;

pub use condition::{Comparator, Condition, ConditionGroup, GroupLogic};
pub use definition::{DefinitionError, DefinitionStatus, StepDef, WorkflowDefinition};
pub use escalation::{
    DeadlineConfig, EscalationConfig, EscalationOutcome, OverdueConfig, SweepDecision,
};
pub use step::{
    ApiCallConfig, EFormConfig, ExpectedReply, FieldBinding, MessageContent, QueryConfig,
    SendMessageConfig, StartConfig, StepKind, SwitchCase, SwitchConfig, WaitConfig,
};
pub use validators::{MessageValidator, TimeValidator, ValidationOutcome};
pub use variables::{VarType, VarValue, VariableDecl, VariableTypeError, Variables};
