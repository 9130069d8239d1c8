//! Deployment agent: executes dispatched scripts and reports status over a
//! secure channel, in either polling or listening topology.

pub mod config;
pub mod executor;
pub mod handler;
pub mod registry;
pub mod service;

pub use executor::{ProcessExecutor, ScriptExecutor};
pub use handler::AgentService;
pub use registry::{RunLog, RunOutcome, ScriptRunRegistry};
