//! Supervised child processes
//!
//! A spawned process is owned by a supervisor task that waits on it and
//! delivers termination requests. Everything else talks to the process through
//! a [`ProcessHandle`], whose signal channel closes the moment the child is
//! reaped. A request sent after that point goes nowhere, which is what makes a
//! delayed kill safe: it can only ever reach the instance it was created for.

use crate::platform;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long to keep reading output after the child exits. A grandchild that
/// inherited the pipes could otherwise hold the exit notification forever.
const DRAIN_WINDOW: Duration = Duration::from_secs(2);

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Chunks in flight per process. A full queue stalls the pumps, so a fast
/// producer is paced by whoever consumes the events.
const EVENT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGTERM
    Graceful,
    /// SIGKILL
    Forced,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signaled: bool,
}

impl ExitOutcome {
    /// The process's own code, else 128 for a signal death, else 1.
    pub fn exit_code(&self) -> i32 {
        match self.code {
            Some(code) => code,
            None if self.signaled => 128,
            None => 1,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug)]
pub enum ProcessEvent {
    Output { stream: OutputStream, data: Vec<u8> },
    /// The child has been waited on; output may still be draining.
    Reaped,
    Exited(ExitOutcome),
}

/// Handle to one live process instance.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    signals: mpsc::UnboundedSender<Termination>,
}

impl ProcessHandle {
    /// Spawn `command` with piped stdout/stderr and a null stdin.
    ///
    /// Output chunks arrive on the returned receiver in read order per stream.
    /// [`ProcessEvent::Reaped`] is sent as soon as the child is waited on and
    /// exactly one [`ProcessEvent::Exited`] comes last.
    pub fn spawn(
        mut command: Command,
    ) -> std::io::Result<(ProcessHandle, mpsc::Receiver<ProcessEvent>)> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn()?;
        let pid = child.id();

        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(stdout, OutputStream::Stdout, event_tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(stderr, OutputStream::Stderr, event_tx.clone())));
        }

        tokio::spawn(supervise(child, signal_rx, pumps, event_tx));

        Ok((
            ProcessHandle {
                pid,
                signals: signal_tx,
            },
            event_rx,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Send SIGTERM. Returns false if the process has already been reaped.
    pub fn terminate(&self) -> bool {
        self.signals.send(Termination::Graceful).is_ok()
    }

    /// Send SIGKILL after `grace` unless this instance has exited by then.
    pub fn kill_after(&self, grace: Duration) -> JoinHandle<()> {
        let signals = self.signals.clone();
        let pid = self.pid;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if signals.send(Termination::Forced).is_ok() {
                tracing::debug!("Escalated to SIGKILL for pid {:?}", pid);
            }
        })
    }
}

async fn pump<R>(mut reader: R, stream: OutputStream, events: mpsc::Sender<ProcessEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let event = ProcessEvent::Output {
                    stream,
                    data: buf[..n].to_vec(),
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("{:?} read error: {}", stream, e);
                break;
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    mut signals: mpsc::UnboundedReceiver<Termination>,
    pumps: Vec<JoinHandle<()>>,
    events: mpsc::Sender<ProcessEvent>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(request) = signals.recv() => {
                let result = match request {
                    Termination::Graceful => platform::request_terminate(&mut child),
                    Termination::Forced => platform::force_kill(&mut child),
                };
                if let Err(e) = result {
                    tracing::debug!("Failed to deliver {:?}: {}", request, e);
                }
            }
        }
    };
    // Reaped: from here on, termination requests fail at the sender.
    drop(signals);
    let _ = events.send(ProcessEvent::Reaped).await;

    let outcome = match status {
        Ok(status) => ExitOutcome {
            code: status.code(),
            signaled: platform::killed_by_signal(&status),
        },
        Err(e) => {
            tracing::warn!("Failed to wait for child: {}", e);
            ExitOutcome {
                code: None,
                signaled: false,
            }
        }
    };

    for pump in pumps {
        let abort = pump.abort_handle();
        if tokio::time::timeout(DRAIN_WINDOW, pump).await.is_err() {
            abort.abort();
        }
    }

    let _ = events.send(ProcessEvent::Exited(outcome)).await;
}

/// Turns a byte stream into text without splitting multi-byte characters
/// across chunks. Invalid sequences are replaced.
#[derive(Debug, Default)]
pub struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    pub fn push(&mut self, data: &[u8]) -> String {
        self.pending.extend_from_slice(data);
        let keep = incomplete_tail_len(&self.pending);
        let split = self.pending.len() - keep;
        let text = String::from_utf8_lossy(&self.pending[..split]).into_owned();
        self.pending.drain(..split);
        text
    }

    /// Whatever is left once the stream ends.
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of a trailing, possibly-valid but incomplete UTF-8 sequence.
fn incomplete_tail_len(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => 0,
        // error_len() == None means the input ended mid-character.
        Err(e) if e.error_len().is_none() => bytes.len() - e.valid_up_to(),
        Err(_) => {
            // An invalid sequence earlier on; only hold back a short tail that
            // could still become a character.
            let start = bytes.len().saturating_sub(3);
            (start..bytes.len())
                .find(|&i| {
                    let lead = bytes[i];
                    lead >= 0xC0 && utf8_width(lead) > bytes.len() - i
                })
                .map(|i| bytes.len() - i)
                .unwrap_or(0)
        }
    }
}

fn utf8_width(lead: u8) -> usize {
    match lead {
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF7 => 4,
        _ => 1,
    }
}
