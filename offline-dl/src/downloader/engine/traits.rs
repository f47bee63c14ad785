//! Transcode engine trait and related types.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::Result;
use crate::store::{DownloadTask, ProcessHandle};

/// What to fetch and where to put it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeJob {
    pub task_id: String,
    /// HLS manifest URL.
    pub source_url: String,
    pub destination_path: PathBuf,
}

impl TranscodeJob {
    pub fn from_task(task: &DownloadTask) -> Self {
        Self {
            task_id: task.id.clone(),
            source_url: task.source_url.clone(),
            destination_path: task.destination_path.clone(),
        }
    }
}

/// Progress reported by a running transcode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscodeProgress {
    /// Bytes written to the output so far.
    pub bytes_written: u64,
    /// Media time processed, in seconds.
    pub media_time_secs: f64,
    /// Output bitrate in kbit/s, if reported.
    pub bitrate_kbps: Option<f64>,
    /// Processing speed relative to real time, if reported.
    pub speed: Option<f64>,
}

/// How a transcode process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited cleanly; the output file is complete.
    Success,
    /// Stopped because cancellation was requested through its handle.
    Cancelled,
    /// Any other ending. `message` is meant for users.
    Failed { code: Option<i32>, message: String },
}

impl ExitOutcome {
    pub fn failed(code: Option<i32>, message: impl Into<String>) -> Self {
        Self::Failed {
            code,
            message: message.into(),
        }
    }
}

/// A started transcode: its handle plus the eventual outcome.
pub struct TranscodeProcess {
    pub handle: ProcessHandle,
    pub exit: oneshot::Receiver<ExitOutcome>,
}

/// Trait for transcode backends.
#[async_trait]
pub trait TranscodeEngine: Send + Sync {
    /// Engine name for logs.
    fn name(&self) -> &'static str;

    /// Check if the engine can run (e.g., binary exists).
    fn is_available(&self) -> bool;

    /// Get the engine version string.
    fn version(&self) -> Option<String>;

    /// Start a transcode.
    ///
    /// Returns once the process is running. The outcome is delivered on
    /// [`TranscodeProcess::exit`]; cancelling the returned handle must end
    /// the process and yield [`ExitOutcome::Cancelled`]. Progress is sent on
    /// `progress_tx` on a best-effort basis.
    async fn start(
        &self,
        job: TranscodeJob,
        progress_tx: mpsc::Sender<TranscodeProgress>,
    ) -> Result<TranscodeProcess>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TaskStatus;

    #[test]
    fn test_job_from_task() {
        let task = DownloadTask::new(
            "ep",
            "u",
            "https://cdn.example.com/ep.m3u8",
            "Episode",
            "/dl/Episode.mp4",
        )
        .with_status(TaskStatus::Downloading);
        let job = TranscodeJob::from_task(&task);
        assert_eq!(job.task_id, task.id);
        assert_eq!(job.source_url, "https://cdn.example.com/ep.m3u8");
        assert_eq!(job.destination_path, PathBuf::from("/dl/Episode.mp4"));
    }

    #[test]
    fn test_progress_default() {
        let progress = TranscodeProgress::default();
        assert_eq!(progress.bytes_written, 0);
        assert!(progress.bitrate_kbps.is_none());
    }
}
