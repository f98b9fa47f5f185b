//! Allowlisted shell command execution for the `/terminal/ws` endpoint.

pub mod argv;
pub mod process;
pub mod session;

pub use session::{ExecEvent, ExecSession, ExecSettings};
