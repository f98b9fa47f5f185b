//! Agent session handler
//!
//! One per `/claude/ws` connection. There is no long-lived agent process: each
//! `start_session` or `send_prompt` spawns a fresh CLI invocation that runs to
//! completion, and conversations are stitched together with `--resume`.

use crate::agent::turn::TurnStream;
use crate::error::AgentError;
use crate::exec::process::{ExitOutcome, OutputStream, ProcessEvent, ProcessHandle};
use crate::protocol::AgentServerMessage;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::mpsc;

/// How to invoke the agent CLI
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub command: String,
    /// Placed before the generated flags (e.g. a wrapper script)
    pub base_args: Vec<String>,
    pub allowed_tools: String,
    pub init_prompt: String,
    pub working_dir: PathBuf,
}

impl AgentSettings {
    fn turn_args(&self, prompt: &str, resume: Option<&str>) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.extend([
            "-p".to_string(),
            prompt.to_string(),
            "--allowedTools".to_string(),
            self.allowed_tools.clone(),
        ]);
        if let Some(session_id) = resume {
            args.extend(["--resume".to_string(), session_id.to_string()]);
        }
        args.extend([
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ]);
        args
    }
}

#[derive(Debug)]
pub enum AgentEvent {
    TurnFinished { turn: u64, outcome: ExitOutcome },
}

pub struct AgentSessionHandler {
    settings: Arc<AgentSettings>,
    next_turn: u64,
    active_turns: HashSet<u64>,
    outbox: mpsc::UnboundedSender<AgentServerMessage>,
    events: mpsc::Sender<AgentEvent>,
}

impl AgentSessionHandler {
    pub fn new(
        settings: Arc<AgentSettings>,
        outbox: mpsc::UnboundedSender<AgentServerMessage>,
        events: mpsc::Sender<AgentEvent>,
    ) -> Self {
        Self {
            settings,
            next_turn: 0,
            active_turns: HashSet::new(),
            outbox,
            events,
        }
    }

    pub fn active_turns(&self) -> usize {
        self.active_turns.len()
    }

    pub fn start_session(&mut self) {
        tracing::info!("Starting agent session");
        let args = self.settings.turn_args(&self.settings.init_prompt, None);
        self.spawn_turn(args, TurnStream::start());
    }

    /// Continue a conversation. Turns for the same session id are not
    /// serialized here; whether the CLI tolerates overlap is up to the CLI.
    pub fn send_prompt(&mut self, session_id: Option<String>, prompt: Option<String>) {
        let (session_id, prompt) = match (session_id, prompt) {
            (Some(id), Some(prompt)) if !id.is_empty() && !prompt.is_empty() => (id, prompt),
            _ => {
                self.send(AgentServerMessage::error(AgentError::MissingPromptFields));
                return;
            }
        };

        tracing::info!("Sending prompt to agent session {}", session_id);
        let args = self.settings.turn_args(&prompt, Some(&session_id));
        self.spawn_turn(args, TurnStream::resume(session_id));
    }

    pub fn handle_event(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::TurnFinished { turn, outcome } => {
                self.active_turns.remove(&turn);
                tracing::info!(
                    "Agent turn {} finished with code {} ({} still running)",
                    turn,
                    outcome.exit_code(),
                    self.active_turns.len()
                );
            }
        }
    }

    /// Turns are short-lived and finish on their own; nothing to tear down.
    pub fn cleanup(&mut self) {
        if self.active_turns() > 0 {
            tracing::debug!(
                "Connection closed with {} agent turn(s) still running",
                self.active_turns()
            );
        }
    }

    fn spawn_turn(&mut self, args: Vec<String>, stream: TurnStream) {
        let mut command = Command::new(&self.settings.command);
        command.args(&args).current_dir(&self.settings.working_dir);

        let (process, process_events) = match ProcessHandle::spawn(command) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::warn!("Failed to spawn {}: {}", self.settings.command, e);
                self.send(AgentServerMessage::error(AgentError::Spawn(e)));
                return;
            }
        };

        let turn = self.next_turn;
        self.next_turn += 1;
        self.active_turns.insert(turn);
        tracing::debug!("Agent turn {} running as pid {:?}", turn, process.pid());

        tokio::spawn(run_turn(
            turn,
            stream,
            process_events,
            self.outbox.clone(),
            self.events.clone(),
        ));
    }

    fn send(&self, message: AgentServerMessage) {
        let _ = self.outbox.send(message);
    }
}

/// Decode loop for one invocation. Owns the turn's NDJSON buffer.
async fn run_turn(
    turn: u64,
    mut stream: TurnStream,
    mut process_events: mpsc::Receiver<ProcessEvent>,
    outbox: mpsc::UnboundedSender<AgentServerMessage>,
    events: mpsc::Sender<AgentEvent>,
) {
    while let Some(event) = process_events.recv().await {
        match event {
            ProcessEvent::Output {
                stream: OutputStream::Stdout,
                data,
            } => {
                for message in stream.push(&data) {
                    let _ = outbox.send(message);
                }
            }
            ProcessEvent::Output {
                stream: OutputStream::Stderr,
                data,
            } => {
                for line in String::from_utf8_lossy(&data).lines() {
                    if !line.trim().is_empty() {
                        tracing::warn!("agent turn {} stderr: {}", turn, line);
                    }
                }
            }
            ProcessEvent::Reaped => {}
            ProcessEvent::Exited(outcome) => {
                for message in stream.finish(outcome) {
                    let _ = outbox.send(message);
                }
                tracing::debug!("Agent turn {} ended (session {:?})", turn, stream.session_id());
                let _ = events.send(AgentEvent::TurnFinished { turn, outcome }).await;
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Stand-in for the agent CLI: emits a session id on fresh turns and echoes
    /// the prompt and resume id in a final line with no trailing newline.
    const FAKE_AGENT: &str = r#"
prompt="$2"
resume=""
while [ $# -gt 0 ]; do
  if [ "$1" = "--resume" ]; then resume="$2"; fi
  shift
done
if [ -z "$resume" ]; then
  printf '{"type":"system","session_id":"sess-1"}\n'
fi
echo "working" >&2
printf '{"type":"result","prompt":"%s","resume":"%s"}' "$prompt" "$resume"
if [ "$prompt" = "fail" ]; then exit 2; fi
exit 0
"#;

    struct Harness {
        handler: AgentSessionHandler,
        outbox: mpsc::UnboundedReceiver<AgentServerMessage>,
        events: mpsc::Receiver<AgentEvent>,
        _dir: TempDir,
    }

    impl Harness {
        fn new(command: &str) -> Self {
            let dir = TempDir::new().unwrap();
            let script = dir.path().join("fake-agent.sh");
            std::fs::write(&script, FAKE_AGENT).unwrap();
            let settings = Arc::new(AgentSettings {
                command: command.to_string(),
                base_args: vec![script.to_string_lossy().into_owned()],
                allowed_tools: "Read".to_string(),
                init_prompt: "hello".to_string(),
                working_dir: dir.path().to_path_buf(),
            });
            let (out_tx, outbox) = mpsc::unbounded_channel();
            let (ev_tx, events) = mpsc::channel(16);
            Self {
                handler: AgentSessionHandler::new(settings, out_tx, ev_tx),
                outbox,
                events,
                _dir: dir,
            }
        }

        /// Wait for one turn to finish and return everything it sent.
        async fn finish_turn(&mut self) -> Vec<AgentServerMessage> {
            let event = tokio::time::timeout(Duration::from_secs(10), self.events.recv())
                .await
                .expect("turn did not finish")
                .expect("events closed");
            self.handler.handle_event(event);
            let mut sent = Vec::new();
            while let Ok(msg) = self.outbox.try_recv() {
                sent.push(msg);
            }
            sent
        }
    }

    #[tokio::test]
    async fn start_session_discovers_session_id() {
        let mut h = Harness::new("sh");
        h.handler.start_session();
        assert_eq!(h.handler.active_turns(), 1);

        let sent = h.finish_turn().await;
        assert_eq!(
            sent,
            vec![
                AgentServerMessage::OutputChunk {
                    output: json!({"type": "system", "session_id": "sess-1"}),
                    session_id: Some("sess-1".to_string()),
                },
                AgentServerMessage::OutputChunk {
                    output: json!({"type": "result", "prompt": "hello", "resume": ""}),
                    session_id: Some("sess-1".to_string()),
                },
            ]
        );
        assert_eq!(h.handler.active_turns(), 0);
    }

    #[tokio::test]
    async fn send_prompt_resumes_the_session() {
        let mut h = Harness::new("sh");
        h.handler
            .send_prompt(Some("sess-1".to_string()), Some("list files".to_string()));
        let sent = h.finish_turn().await;
        assert_eq!(
            sent,
            vec![AgentServerMessage::OutputChunk {
                output: json!({"type": "result", "prompt": "list files", "resume": "sess-1"}),
                session_id: Some("sess-1".to_string()),
            }]
        );
    }

    #[tokio::test]
    async fn failed_turn_reports_exit_and_next_prompt_still_works() {
        let mut h = Harness::new("sh");
        h.handler
            .send_prompt(Some("sess-1".to_string()), Some("fail".to_string()));
        let sent = h.finish_turn().await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1], AgentServerMessage::error(AgentError::Exited(2)));

        h.handler
            .send_prompt(Some("sess-1".to_string()), Some("again".to_string()));
        let sent = h.finish_turn().await;
        assert_eq!(sent.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_prompts_are_not_serialized() {
        let mut h = Harness::new("sh");
        h.handler.send_prompt(Some("s".to_string()), Some("one".to_string()));
        h.handler.send_prompt(Some("s".to_string()), Some("two".to_string()));
        assert_eq!(h.handler.active_turns(), 2);
        let mut sent = h.finish_turn().await;
        sent.extend(h.finish_turn().await);
        assert_eq!(sent.len(), 2);
        assert_eq!(h.handler.active_turns(), 0);
    }

    #[tokio::test]
    async fn missing_fields_are_rejected_without_spawning() {
        let mut h = Harness::new("sh");
        h.handler.send_prompt(None, Some("hi".to_string()));
        h.handler.send_prompt(Some("s".to_string()), Some(String::new()));
        assert_eq!(h.handler.active_turns(), 0);
        let expected = AgentServerMessage::error(AgentError::MissingPromptFields);
        assert_eq!(h.outbox.try_recv().unwrap(), expected);
        assert_eq!(h.outbox.try_recv().unwrap(), expected);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let mut h = Harness::new("/nonexistent/agent-cli");
        h.handler.start_session();
        match h.outbox.try_recv().unwrap() {
            AgentServerMessage::Error { message } => {
                assert!(message.starts_with("Failed to start agent"))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.handler.active_turns(), 0);
        h.handler.cleanup();
    }
}
