//! Process supervision for transcode engines.
//!
//! Waits for a child to exit or for cancellation, whichever comes first.

use process_utils::{ExitKind, classify_exit};
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Result of waiting on a child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitResult {
    /// The process exited on its own.
    Exited(ExitKind),
    /// Cancellation was requested; the process was killed.
    Cancelled,
    /// Waiting failed at the OS level.
    WaitFailed(String),
}

/// Spawn a task that waits for a process to exit and sends the result
/// through a oneshot channel.
///
/// If the cancellation token is triggered first, the process is killed and
/// [`WaitResult::Cancelled`] is sent. A token that is already cancelled
/// takes priority over an exit that raced with it.
pub fn spawn_process_waiter(
    mut child: Child,
    cancellation_token: CancellationToken,
) -> oneshot::Receiver<WaitResult> {
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let result = tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill cancelled process");
                }
                WaitResult::Cancelled
            }
            status = child.wait() => match status {
                Ok(status) => {
                    let kind = classify_exit(&status);
                    if !kind.is_success() {
                        warn!("Process exited with status: {}", status);
                    }
                    if cancellation_token.is_cancelled() {
                        WaitResult::Cancelled
                    } else {
                        WaitResult::Exited(kind)
                    }
                }
                Err(e) => {
                    error!("Error waiting for process: {}", e);
                    WaitResult::WaitFailed(e.to_string())
                }
            },
        };
        let _ = tx.send(result);
    });

    rx
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> Child {
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(script)
            .kill_on_drop(true)
            .spawn()
            .expect("sh must be available")
    }

    #[tokio::test]
    async fn test_reports_exit_codes() {
        let ok = spawn_process_waiter(sh("exit 0"), CancellationToken::new());
        assert_eq!(ok.await.unwrap(), WaitResult::Exited(ExitKind::Success));

        let failed = spawn_process_waiter(sh("exit 3"), CancellationToken::new());
        assert_eq!(failed.await.unwrap(), WaitResult::Exited(ExitKind::Failed(3)));
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let token = CancellationToken::new();
        let rx = spawn_process_waiter(sh("sleep 30"), token.clone());
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("waiter must finish after cancellation")
            .unwrap();
        assert_eq!(result, WaitResult::Cancelled);
    }
}
