//! Error types
//!
//! The `Display` text of [`ExecError`] and [`AgentError`] is what the client
//! sees in an outbound `error` frame, so keep it short and human readable.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures of the command-execution endpoint. None of them end the connection.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("A command is already running. Cancel it first.")]
    AlreadyRunning,

    #[error("No command running")]
    NotRunning,

    #[error("{0}")]
    Denied(String),

    #[error("No command provided")]
    EmptyCommand,

    #[error("Failed to execute command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Command timed out after {0:?}")]
    TimedOut(Duration),
}

/// Failures of the agent endpoint. None of them end the connection.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Missing sessionId or prompt for send_prompt")]
    MissingPromptFields,

    #[error("Failed to start agent: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Invalid sessionId returned from agent")]
    InvalidSessionId,

    #[error("Agent exited with code {0}")]
    Exited(i32),

    #[error("Agent was terminated by a signal")]
    Terminated,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("project root {} is not usable: {source}", .path.display())]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Transport-level failures. These are the only errors that end a connection.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
