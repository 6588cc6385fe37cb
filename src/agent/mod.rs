//! Agent layer: everything that talks to the external coding agent.
//!
//! This module provides:
//! - `types`: catalog, selection, result and error types
//! - `protocol`: classification of the CLI's JSON stdout records
//! - `heuristics`: best-effort adapters for free-form agent output
//! - `client`: the agent's HTTP API
//! - `runner`: the CLI subprocess driver
//! - `sink`: receivers for streamed thinking blocks
//! - `proxy`: the `AgentService` used by the relay

pub mod client;
pub mod heuristics;
pub mod protocol;
pub mod proxy;
pub mod runner;
pub mod sink;
pub mod types;
pub mod utils;

pub use proxy::{AgentProxy, AgentService};
pub use sink::{ChannelSink, NoopSink, ThinkingSink};
pub use types::{
    AgentError, CodingTask, InvocationResult, ModelSelection, ProviderCatalog, ProviderInfo,
    SelectionError, TaskOutcome,
};
