//! Small process-related helpers shared across the workspace.
//!
//! Child processes spawned by the download manager are long-running media
//! tools. They must never pop up a console window on Windows, must die with
//! their owner, and their exit status has to be reduced to the handful of
//! cases the scheduler cares about.

use std::ffi::OsStr;
use std::process::{ExitStatus, Stdio};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `std::process::Command` for short-lived probes (`-version` and the like).
///
/// Output is captured by the caller; stdin is detached.
pub fn probe_command(program: impl AsRef<OsStr>) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.no_window();
    cmd.stdin(Stdio::null());
    cmd
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` for a managed worker process.
///
/// The child gets no stdin, discards stdout, and is killed when its
/// `Child` handle is dropped. Stderr is left to the caller.
#[cfg(feature = "tokio")]
pub fn worker_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .kill_on_drop(true);
    cmd
}

/// How a child process ended, as far as a supervisor is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Exit code 0.
    Success,
    /// Non-zero exit code.
    Failed(i32),
    /// Terminated by a signal (unix) or without an exit code.
    Terminated,
}

impl ExitKind {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Reduce an [`ExitStatus`] to an [`ExitKind`].
pub fn classify_exit(status: &ExitStatus) -> ExitKind {
    match status.code() {
        Some(0) => ExitKind::Success,
        Some(code) => ExitKind::Failed(code),
        None => ExitKind::Terminated,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn classifies_exit_codes() {
        assert_eq!(classify_exit(&ExitStatus::from_raw(0)), ExitKind::Success);
        // Raw wait status: exit code lives in the high byte.
        assert_eq!(
            classify_exit(&ExitStatus::from_raw(1 << 8)),
            ExitKind::Failed(1)
        );
        // SIGKILL
        assert_eq!(classify_exit(&ExitStatus::from_raw(9)), ExitKind::Terminated);
    }

    #[test]
    fn success_helper() {
        assert!(ExitKind::Success.is_success());
        assert!(!ExitKind::Failed(2).is_success());
        assert!(!ExitKind::Terminated.is_success());
    }
}
