//! Coding-agent CLI sessions for the `/claude/ws` endpoint.

pub mod handler;
pub mod ndjson;
pub mod turn;

pub use handler::{AgentEvent, AgentSessionHandler, AgentSettings};
