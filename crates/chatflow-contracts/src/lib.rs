// Public contracts for the Chatflow engine
// This crate defines the signal/command DTOs exchanged with external
// collaborators (messaging gateway, dataset service, e-form service) and
// the execution views served by the HTTP API.

pub mod commands;
pub mod common;
pub mod execution;
pub mod signals;

pub use commands::*;
pub use common::*;
pub use execution::*;
pub use signals::*;
