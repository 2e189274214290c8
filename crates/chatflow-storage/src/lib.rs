//! Durable persistence for the chatflow engine
//!
//! Exposes the [`ExecutionStore`] trait with two implementations: a
//! PostgreSQL store for production and an in-memory twin with the same
//! concurrency semantics for tests.

pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use memory::InMemoryExecutionStore;
pub use models::{
    CreateDefinition, CreateExecution, CreateMessageValidation, CreateSession,
    CreateStepExecution, DefinitionRow, ExecutionRow, MessageValidationRow, StepExecutionRow,
    UpdateExecution, UserSessionRow,
};
pub use postgres::PostgresExecutionStore;
pub use store::{ExecutionStore, StoreError};
