//! The chatflow execution engine
//!
//! Ties the domain model to durable storage and the external
//! collaborators:
//!
//! - [`Orchestrator`] — starts, advances and cancels executions with
//!   exactly-once transitions under optimistic concurrency
//! - [`SessionTracker`] — routes chat identities to waiting executions
//! - [`EscalationScheduler`] — the periodic deadline sweep
//! - collaborator traits plus their HTTP implementations

pub mod collaborators;
pub mod error;
pub mod http;
pub mod orchestrator;
pub mod scheduler;
pub mod session;

pub use collaborators::{
    Collaborators, DataSetService, EFormService, ExternalApiClient, MessagingGateway,
};
pub use error::EngineError;
pub use http::CollaboratorConfig;
pub use orchestrator::{AdvanceOutcome, Orchestrator, StartTrigger};
pub use scheduler::{EscalationScheduler, SchedulerConfig, SweepStats};
pub use session::{SessionPolicy, SessionTracker};
