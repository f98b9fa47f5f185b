//! Output of one agent CLI invocation.
//!
//! A turn decodes the process's stream-json stdout into `output_chunk`
//! messages. A turn that starts a conversation discovers the session id from
//! the first event carrying a `session_id` field; a resumed turn already knows
//! it. Once known, the id is attached to every chunk the turn forwards.

use crate::agent::ndjson::{DecodedLine, NdjsonDecoder};
use crate::error::AgentError;
use crate::exec::process::ExitOutcome;
use crate::protocol::AgentServerMessage;
use serde_json::Value;

#[derive(Debug)]
pub struct TurnStream {
    decoder: NdjsonDecoder,
    session_id: Option<String>,
    discovering: bool,
}

impl TurnStream {
    /// A turn that opens a new conversation.
    pub fn start() -> Self {
        Self {
            decoder: NdjsonDecoder::new(),
            session_id: None,
            discovering: true,
        }
    }

    /// A turn that continues `session_id`.
    pub fn resume(session_id: String) -> Self {
        Self {
            decoder: NdjsonDecoder::new(),
            session_id: Some(session_id),
            discovering: false,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<AgentServerMessage> {
        let mut out = Vec::new();
        for line in self.decoder.push(chunk) {
            match line {
                DecodedLine::Event(event) => self.forward(event, &mut out),
                DecodedLine::Malformed { line, error } => {
                    tracing::warn!("Skipping malformed agent output {:?}: {}", line, error);
                }
            }
        }
        out
    }

    /// Stream ended with `outcome`: flush the final fragment and report a
    /// non-zero exit.
    pub fn finish(&mut self, outcome: ExitOutcome) -> Vec<AgentServerMessage> {
        let mut out = Vec::new();
        if let Some(event) = self.decoder.finish() {
            self.forward(event, &mut out);
        }
        if !outcome.success() {
            let error = match outcome.code {
                Some(code) => AgentError::Exited(code),
                None => AgentError::Terminated,
            };
            out.push(AgentServerMessage::error(error));
        }
        out
    }

    fn forward(&mut self, event: Value, out: &mut Vec<AgentServerMessage>) {
        if self.discovering {
            if let Some(field) = event.get("session_id").filter(|v| !v.is_null()) {
                // Only the first event carrying the field counts.
                self.discovering = false;
                match field.as_str().filter(|id| !id.is_empty()) {
                    Some(id) => {
                        tracing::info!("Agent session started: {}", id);
                        self.session_id = Some(id.to_string());
                    }
                    None => {
                        out.push(AgentServerMessage::error(AgentError::InvalidSessionId));
                        return;
                    }
                }
            }
        }

        out.push(AgentServerMessage::OutputChunk {
            output: event,
            session_id: self.session_id.clone(),
        });
    }
}
