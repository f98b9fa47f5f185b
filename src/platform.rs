//! Platform-specific helpers.

use std::path::PathBuf;
use tokio::process::Child;

/// Get the config directory (`~/.mobiledev`), falling back to the current
/// directory when no home directory is known.
pub fn config_dir() -> PathBuf {
    dirs_next::home_dir()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mobiledev")
}

/// Ask a child to exit (SIGTERM on Unix).
///
/// The child must not have been reaped yet; callers hold the `Child` until
/// `wait` resolves, so the pid cannot belong to another process.
#[cfg(unix)]
pub fn request_terminate(child: &mut Child) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(std::io::Error::from),
        None => Ok(()),
    }
}

/// Windows has no soft termination for arbitrary processes.
#[cfg(not(unix))]
pub fn request_terminate(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

/// Hard kill (SIGKILL on Unix).
pub fn force_kill(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

/// Whether the status says the process died from a signal.
#[cfg(unix)]
pub fn killed_by_signal(status: &std::process::ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal().is_some()
}

#[cfg(not(unix))]
pub fn killed_by_signal(_status: &std::process::ExitStatus) -> bool {
    false
}
