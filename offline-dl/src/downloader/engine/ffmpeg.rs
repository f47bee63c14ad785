//! FFmpeg transcode engine implementation.
//!
//! Repackages an HLS stream into a single MP4 without re-encoding:
//!
//! ```text
//! ffmpeg -i "<source_url>" -c copy -bsf:a aac_adtstoasc "<destination_path>"
//! ```

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::traits::{ExitOutcome, TranscodeEngine, TranscodeJob, TranscodeProcess, TranscodeProgress};
use super::utils::{WaitResult, drain_stderr, spawn_process_waiter, summarize_failure};
use crate::store::ProcessHandle;
use crate::{Error, Result};
use process_utils::ExitKind;

/// How long to wait for stderr to drain after the process exited.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// FFmpeg-based transcode engine.
pub struct FfmpegEngine {
    binary_path: String,
    /// Cached version string.
    version: Option<String>,
}

impl FfmpegEngine {
    /// Create an engine using the `ffmpeg` found on `PATH`.
    pub fn new() -> Self {
        Self::with_binary("ffmpeg")
    }

    /// Create an engine for a specific ffmpeg binary.
    pub fn with_binary(binary_path: impl Into<String>) -> Self {
        let binary_path = binary_path.into();
        let version = Self::detect_version(&binary_path);
        Self {
            binary_path,
            version,
        }
    }

    /// Detect ffmpeg version.
    fn detect_version(path: &str) -> Option<String> {
        process_utils::probe_command(path)
            .arg("-version")
            .output()
            .ok()
            .filter(|output| output.status.success())
            .and_then(|output| {
                String::from_utf8(output.stdout)
                    .ok()
                    .and_then(|s| s.lines().next().map(|l| l.to_string()))
            })
    }

    /// Build ffmpeg command arguments.
    pub fn build_args(job: &TranscodeJob) -> Vec<String> {
        vec![
            "-i".to_string(),
            job.source_url.clone(),
            "-c".to_string(),
            "copy".to_string(),
            "-bsf:a".to_string(),
            "aac_adtstoasc".to_string(),
            job.destination_path.to_string_lossy().to_string(),
        ]
    }
}

impl Default for FfmpegEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// User-facing message for a failed transcode.
fn failure_message(code: Option<i32>, tail: &[String]) -> String {
    let head = match code {
        Some(code) => format!("transcode failed (exit code {})", code),
        None => "transcode process was terminated".to_string(),
    };
    match summarize_failure(tail) {
        Some(detail) => format!("{}: {}", head, detail),
        None => head,
    }
}

#[async_trait]
impl TranscodeEngine for FfmpegEngine {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn is_available(&self) -> bool {
        self.version.is_some()
    }

    fn version(&self) -> Option<String> {
        self.version.clone()
    }

    async fn start(
        &self,
        job: TranscodeJob,
        progress_tx: mpsc::Sender<TranscodeProgress>,
    ) -> Result<TranscodeProcess> {
        let args = Self::build_args(&job);

        info!(
            task_id = %job.task_id,
            "Starting ffmpeg transcode with args: {:?}", args
        );

        let mut child = process_utils::worker_command(&self.binary_path)
            .args(&args)
            .env("LC_ALL", "C") // Force consistent output
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::ProcessStart(format!("failed to spawn {}: {}", self.binary_path, e))
            })?;

        let pid = child.id();
        let stderr = child.stderr.take();
        let cancellation_token = CancellationToken::new();
        let handle = ProcessHandle::new(pid, cancellation_token.clone());
        let waiter = spawn_process_waiter(child, cancellation_token);

        let (exit_tx, exit_rx) = oneshot::channel();
        let task_id = job.task_id;

        tokio::spawn(async move {
            let stderr_task = stderr.map(|stderr| {
                let task_id = task_id.clone();
                tokio::spawn(async move { drain_stderr(stderr, progress_tx, &task_id).await })
            });

            let wait_result = waiter
                .await
                .unwrap_or_else(|_| WaitResult::WaitFailed("process waiter dropped".to_string()));

            let tail = match (&wait_result, stderr_task) {
                (WaitResult::Cancelled, Some(stderr_task)) => {
                    stderr_task.abort();
                    Vec::new()
                }
                (_, Some(stderr_task)) => {
                    match tokio::time::timeout(STDERR_DRAIN_TIMEOUT, stderr_task).await {
                        Ok(Ok(tail)) => tail,
                        Ok(Err(e)) => {
                            warn!(task_id = %task_id, error = %e, "ffmpeg stderr reader failed");
                            Vec::new()
                        }
                        Err(_) => {
                            debug!(task_id = %task_id, "ffmpeg stderr still open after exit");
                            Vec::new()
                        }
                    }
                }
                (_, None) => Vec::new(),
            };

            let outcome = match wait_result {
                WaitResult::Exited(ExitKind::Success) => ExitOutcome::Success,
                WaitResult::Exited(ExitKind::Failed(code)) => {
                    ExitOutcome::failed(Some(code), failure_message(Some(code), &tail))
                }
                WaitResult::Exited(ExitKind::Terminated) => {
                    ExitOutcome::failed(None, failure_message(None, &tail))
                }
                WaitResult::Cancelled => ExitOutcome::Cancelled,
                WaitResult::WaitFailed(e) => {
                    ExitOutcome::failed(None, format!("lost track of transcode process: {}", e))
                }
            };

            debug!(task_id = %task_id, ?outcome, "ffmpeg finished");
            let _ = exit_tx.send(outcome);
        });

        Ok(TranscodeProcess {
            handle,
            exit: exit_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn job(dest: PathBuf) -> TranscodeJob {
        TranscodeJob {
            task_id: "task-1".to_string(),
            source_url: "https://cdn.example.com/show/master.m3u8".to_string(),
            destination_path: dest,
        }
    }

    #[test]
    fn test_build_args_matches_invocation_contract() {
        let args = FfmpegEngine::build_args(&job(PathBuf::from("/dl/My Show.mp4")));
        assert_eq!(
            args,
            vec![
                "-i",
                "https://cdn.example.com/show/master.m3u8",
                "-c",
                "copy",
                "-bsf:a",
                "aac_adtstoasc",
                "/dl/My Show.mp4",
            ]
        );
    }

    #[test]
    fn test_failure_message() {
        assert_eq!(
            failure_message(Some(1), &["Server returned 403 Forbidden (access denied)".into()]),
            "transcode failed (exit code 1): Server returned 403 Forbidden (access denied)"
        );
        assert_eq!(failure_message(Some(8), &[]), "transcode failed (exit code 8)");
        assert_eq!(failure_message(None, &[]), "transcode process was terminated");
    }

    #[test]
    fn test_missing_binary_is_unavailable() {
        let engine = FfmpegEngine::with_binary("/definitely/not/ffmpeg");
        assert!(!engine.is_available());
        assert!(engine.version().is_none());
        assert_eq!(engine.name(), "ffmpeg");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_process_start_error() {
        let engine = FfmpegEngine::with_binary("/definitely/not/ffmpeg");
        let (tx, _rx) = mpsc::channel(1);
        let result = engine.start(job(PathBuf::from("/tmp/x.mp4")), tx).await;
        assert!(matches!(result, Err(Error::ProcessStart(_))));
    }

    #[cfg(unix)]
    mod scripted {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        /// Install a shell script standing in for ffmpeg.
        fn fake_ffmpeg(dir: &TempDir, body: &str) -> String {
            let path = dir.path().join("ffmpeg");
            let script = format!(
                "#!/bin/sh\nif [ \"$1\" = \"-version\" ]; then echo 'ffmpeg version 7.1-test'; exit 0; fi\n{}\n",
                body
            );
            std::fs::write(&path, script).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.to_string_lossy().to_string()
        }

        #[tokio::test]
        async fn test_success_writes_destination() {
            let dir = TempDir::new().unwrap();
            // $7 is the destination path.
            let engine = FfmpegEngine::with_binary(fake_ffmpeg(
                &dir,
                "echo 'size=1kB time=00:00:01.00 bitrate=8.0kbits/s' >&2\nprintf '%s ' \"$@\" > \"$7\"",
            ));
            let dest = dir.path().join("out.mp4");
            let (tx, mut progress_rx) = mpsc::channel(8);

            assert_eq!(engine.version().as_deref(), Some("ffmpeg version 7.1-test"));

            let process = engine.start(job(dest.clone()), tx).await.unwrap();
            assert!(process.handle.pid.is_some());
            assert_eq!(process.exit.await.unwrap(), ExitOutcome::Success);

            let written = std::fs::read_to_string(&dest).unwrap();
            assert!(written.contains("-c copy -bsf:a aac_adtstoasc"));
            assert_eq!(progress_rx.recv().await.unwrap().bytes_written, 1024);
        }

        #[tokio::test]
        async fn test_failure_carries_stderr_detail() {
            let dir = TempDir::new().unwrap();
            let engine = FfmpegEngine::with_binary(fake_ffmpeg(
                &dir,
                "echo 'https://cdn/seg1.ts: Server returned 404 Not Found' >&2\nexit 1",
            ));
            let (tx, _rx) = mpsc::channel(8);

            let process = engine.start(job(dir.path().join("out.mp4")), tx).await.unwrap();
            match process.exit.await.unwrap() {
                ExitOutcome::Failed { code, message } => {
                    assert_eq!(code, Some(1));
                    assert!(message.contains("404 Not Found"), "{message}");
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_cancel_reports_cancelled() {
            let dir = TempDir::new().unwrap();
            let engine = FfmpegEngine::with_binary(fake_ffmpeg(&dir, "exec sleep 30"));
            let (tx, _rx) = mpsc::channel(8);

            let process = engine.start(job(dir.path().join("out.mp4")), tx).await.unwrap();
            process.handle.cancel();

            let outcome = tokio::time::timeout(Duration::from_secs(5), process.exit)
                .await
                .expect("cancelled process must finish")
                .unwrap();
            assert_eq!(outcome, ExitOutcome::Cancelled);
        }
    }
}
