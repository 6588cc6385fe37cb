//! Chat relay for an external coding agent.
//!
//! - `relay`: chat-facing orchestration and the transport boundary
//! - `agent`: the agent's HTTP API and CLI behind one proxy
//! - `sessions`: per-user session state, session folders, publishing
//! - `tracker` / `archive`: change detection and file packaging
//! - `config` / `logging`: ambient setup for the binary

pub mod agent;
pub mod archive;
pub mod config;
pub mod logging;
pub mod relay;
pub mod sessions;
pub mod tracker;
