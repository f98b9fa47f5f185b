//! Command-execution session
//!
//! One per `/terminal/ws` connection. Runs at most one allowlisted command at a
//! time, streams its output, enforces a wall-clock timeout and handles
//! cancellation. Process output, process exit and the timeout all come back as
//! [`ExecEvent`]s on the connection's own event loop, so the session state is
//! only ever touched from one task.

use crate::allowlist::{self, Allowlist};
use crate::error::ExecError;
use crate::exec::argv::split_args;
use crate::exec::process::{OutputStream, ProcessEvent, ProcessHandle, Utf8Chunker};
use crate::protocol::ExecServerMessage;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const CANCELLED_NOTICE: &str = "\n[Command cancelled by user]\n";

/// Limits and environment for executed commands
#[derive(Debug, Clone)]
pub struct ExecSettings {
    pub working_dir: PathBuf,
    pub timeout: Duration,
    pub kill_grace: Duration,
    /// Only these variables are passed through to the child.
    pub forwarded_env: Vec<String>,
}

/// Notifications delivered back to the session
#[derive(Debug)]
pub enum ExecEvent {
    Process { run: u64, event: ProcessEvent },
    TimedOut { run: u64 },
}

struct RunningCommand {
    run: u64,
    command: String,
    process: ProcessHandle,
    timeout: JoinHandle<()>,
    stdout: Utf8Chunker,
    stderr: Utf8Chunker,
}

enum SessionState {
    Idle,
    Running(RunningCommand),
}

pub struct ExecSession {
    allowlist: &'static Allowlist,
    settings: Arc<ExecSettings>,
    state: SessionState,
    next_run: u64,
    outbox: mpsc::UnboundedSender<ExecServerMessage>,
    events: mpsc::Sender<ExecEvent>,
}

impl ExecSession {
    pub fn new(
        allowlist: &'static Allowlist,
        settings: Arc<ExecSettings>,
        outbox: mpsc::UnboundedSender<ExecServerMessage>,
        events: mpsc::Sender<ExecEvent>,
    ) -> Self {
        Self {
            allowlist,
            settings,
            state: SessionState::Idle,
            next_run: 0,
            outbox,
            events,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, SessionState::Running(_))
    }

    pub fn execute(&mut self, command_line: &str) {
        if let Err(e) = self.try_execute(command_line) {
            tracing::debug!("Execute rejected: {}", e);
            self.send(ExecServerMessage::error(e));
        }
    }

    fn try_execute(&mut self, command_line: &str) -> Result<(), ExecError> {
        if self.is_running() {
            return Err(ExecError::AlreadyRunning);
        }
        if command_line.trim().is_empty() {
            return Err(ExecError::EmptyCommand);
        }
        // The tokenizer splits on spaces only; keep it in step with validation.
        if command_line
            .trim()
            .contains(|c: char| c.is_whitespace() && c != ' ')
        {
            return Err(ExecError::Denied(
                "Arguments must be separated by spaces".to_string(),
            ));
        }

        let verdict = self.allowlist.validate(command_line);
        if !verdict.allowed {
            let reason = verdict
                .reason
                .unwrap_or_else(|| "Command not allowed".to_string());
            return Err(ExecError::Denied(reason));
        }

        let argv = split_args(command_line);
        let (program, args) = argv.split_first().ok_or(ExecError::EmptyCommand)?;
        // The program must be exactly the name the allowlist approved.
        if program != allowlist::command_name(command_line) {
            return Err(ExecError::Denied("Invalid command".to_string()));
        }

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&self.settings.working_dir)
            .env_clear();
        for key in &self.settings.forwarded_env {
            if let Some(value) = std::env::var_os(key) {
                command.env(key, value);
            }
        }

        let (process, mut process_events) = ProcessHandle::spawn(command).map_err(ExecError::Spawn)?;

        let run = self.next_run;
        self.next_run += 1;

        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(event) = process_events.recv().await {
                if events.send(ExecEvent::Process { run, event }).await.is_err() {
                    break;
                }
            }
        });

        let events = self.events.clone();
        let limit = self.settings.timeout;
        let timeout = tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            let _ = events.send(ExecEvent::TimedOut { run }).await;
        });

        tracing::info!(
            "Running '{}' (run {}, pid {:?})",
            command_line.trim(),
            run,
            process.pid()
        );
        self.state = SessionState::Running(RunningCommand {
            run,
            command: command_line.trim().to_string(),
            process,
            timeout,
            stdout: Utf8Chunker::default(),
            stderr: Utf8Chunker::default(),
        });
        Ok(())
    }

    pub fn cancel(&mut self) {
        let running = match &self.state {
            SessionState::Running(running) => running,
            SessionState::Idle => {
                self.send(ExecServerMessage::error(ExecError::NotRunning));
                return;
            }
        };

        tracing::info!("Cancelling '{}' (run {})", running.command, running.run);
        running.process.terminate();
        // Bound to this instance; a no-op once it has been reaped.
        running.process.kill_after(self.settings.kill_grace);
        self.send(ExecServerMessage::Stderr {
            data: CANCELLED_NOTICE.to_string(),
        });
    }

    pub fn handle_event(&mut self, event: ExecEvent) {
        let current = match &mut self.state {
            SessionState::Running(running) => running,
            SessionState::Idle => {
                tracing::debug!("Dropping event for finished run: {:?}", event);
                return;
            }
        };

        match event {
            ExecEvent::TimedOut { run } if run == current.run => {
                // A reaped process only has output left to drain.
                if !current.process.terminate() {
                    tracing::debug!("'{}' timed out after exiting", current.command);
                    return;
                }
                tracing::warn!("'{}' timed out", current.command);
                let message = ExecServerMessage::error(ExecError::TimedOut(self.settings.timeout));
                self.send(message);
            }
            ExecEvent::Process {
                run,
                event: ProcessEvent::Reaped,
            } if run == current.run => {
                current.timeout.abort();
            }
            ExecEvent::Process {
                run,
                event: ProcessEvent::Output { stream, data },
            } if run == current.run => {
                let message = match stream {
                    OutputStream::Stdout => ExecServerMessage::Stdout {
                        data: current.stdout.push(&data),
                    },
                    OutputStream::Stderr => ExecServerMessage::Stderr {
                        data: current.stderr.push(&data),
                    },
                };
                self.send_output(message);
            }
            ExecEvent::Process {
                run,
                event: ProcessEvent::Exited(outcome),
            } if run == current.run => {
                if let SessionState::Running(mut finished) =
                    std::mem::replace(&mut self.state, SessionState::Idle)
                {
                    finished.timeout.abort();
                    let tail_out = finished.stdout.finish();
                    let tail_err = finished.stderr.finish();
                    self.send_output(ExecServerMessage::Stdout { data: tail_out });
                    self.send_output(ExecServerMessage::Stderr { data: tail_err });

                    let code = outcome.exit_code();
                    tracing::info!("'{}' exited with code {}", finished.command, code);
                    self.send(ExecServerMessage::Exit { code });
                }
            }
            stale => tracing::debug!("Dropping stale event: {:?}", stale),
        }
    }

    /// Connection is gone: stop the live process and send nothing further.
    pub fn cleanup(&mut self) {
        if let SessionState::Running(running) =
            std::mem::replace(&mut self.state, SessionState::Idle)
        {
            tracing::info!("Connection closed, terminating '{}'", running.command);
            running.timeout.abort();
            running.process.terminate();
            running.process.kill_after(self.settings.kill_grace);
        }
    }

    fn send_output(&self, message: ExecServerMessage) {
        let empty = match &message {
            ExecServerMessage::Stdout { data } | ExecServerMessage::Stderr { data } => {
                data.is_empty()
            }
            _ => false,
        };
        if !empty {
            self.send(message);
        }
    }

    fn send(&self, message: ExecServerMessage) {
        let _ = self.outbox.send(message);
    }
}
