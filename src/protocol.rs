//! WebSocket protocol messages
//!
//! Two protocols share one transport and are told apart by endpoint path:
//! `/terminal/ws` speaks the execution protocol and `/claude/ws` the agent
//! protocol. Every frame is one JSON object tagged by `type`.

use serde::{Deserialize, Serialize};

/// Messages sent from client to the execution endpoint
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecClientMessage {
    Execute {
        #[serde(default)]
        command: Option<String>,
    },
    Cancel,
}

/// Messages sent from the execution endpoint to client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecServerMessage {
    Stdout { data: String },
    Stderr { data: String },
    Exit { code: i32 },
    Error { message: String },
}

impl ExecServerMessage {
    pub fn error(message: impl ToString) -> Self {
        ExecServerMessage::Error {
            message: message.to_string(),
        }
    }
}

/// Messages sent from client to the agent endpoint
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentClientMessage {
    StartSession,
    /// Both fields are required; they are optional here so a missing field is
    /// reported as an `error` frame instead of a parse failure.
    SendPrompt {
        #[serde(rename = "sessionId", default)]
        session_id: Option<String>,
        #[serde(default)]
        prompt: Option<String>,
    },
}

/// Messages sent from the agent endpoint to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentServerMessage {
    /// One event from the agent's stream-json output, forwarded uninterpreted
    OutputChunk {
        output: serde_json::Value,
        #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Error {
        message: String,
    },
}

impl AgentServerMessage {
    pub fn error(message: impl ToString) -> Self {
        AgentServerMessage::Error {
            message: message.to_string(),
        }
    }
}
