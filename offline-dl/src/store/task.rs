//! The persisted download task record.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle state of a download task.
///
/// `Pending` and `Downloading` are active; `Completed` and `Cancelled` are
/// terminal. Failures are recorded as `Cancelled` with an error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Downloading => "DOWNLOADING",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Downloading)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Runtime handle to the child process working on a task.
///
/// Never persisted. The `id` distinguishes one spawn from another so that a
/// completion arriving after the task was already written off can be ignored.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub id: Uuid,
    /// OS process id, when the engine knows it.
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    cancellation_token: CancellationToken,
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>, cancellation_token: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            pid,
            started_at: Utc::now(),
            cancellation_token,
        }
    }

    /// Ask the process to stop. Completion is reported asynchronously.
    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }
}

/// One user-requested offline download.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadTask {
    pub id: String,
    /// Source identifier used for de-duplication (episode/server reference).
    pub reference: String,
    pub user_id: String,
    pub source_url: String,
    pub title: String,
    pub destination_path: PathBuf,
    pub status: TaskStatus,
    #[serde(skip)]
    pub process_handle: Option<ProcessHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Opaque caller data, carried through unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl DownloadTask {
    /// Create a new `Pending` task. The id is derived from `(reference, user_id)`.
    pub fn new(
        reference: impl Into<String>,
        user_id: impl Into<String>,
        source_url: impl Into<String>,
        title: impl Into<String>,
        destination_path: impl Into<PathBuf>,
    ) -> Self {
        let reference = reference.into();
        let user_id = user_id.into();
        Self {
            id: task_id_for(&reference, &user_id),
            reference,
            user_id,
            source_url: source_url.into(),
            title: title.into(),
            destination_path: destination_path.into(),
            status: TaskStatus::Pending,
            process_handle: None,
            error: None,
            created_at: Utc::now(),
            metadata: None,
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_metadata(mut self, metadata: Option<serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Downloading but not yet admitted into a concurrency slot.
    pub fn is_queued(&self) -> bool {
        matches!(self.status, TaskStatus::Downloading | TaskStatus::Pending)
            && self.process_handle.is_none()
    }

    /// Downloading with a live child process.
    pub fn is_running(&self) -> bool {
        self.status == TaskStatus::Downloading && self.process_handle.is_some()
    }

    /// Whether `handle_id` is the process currently attached to this task.
    pub fn has_process(&self, handle_id: Uuid) -> bool {
        self.process_handle
            .as_ref()
            .is_some_and(|handle| handle.id == handle_id)
    }

    /// Move to a terminal state, dropping any process handle.
    pub fn finish(&mut self, status: TaskStatus, error: Option<String>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.error = error;
        self.process_handle = None;
    }
}

/// Stable task id for a `(reference, user_id)` pair.
///
/// Deterministic so that repeated requests map onto the same record, and
/// distinct per user so that two users requesting the same episode do not
/// share a task.
pub fn task_id_for(reference: &str, user_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(reference.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DownloadTask {
        DownloadTask::new(
            "ep-1/server-2",
            "user-1",
            "https://cdn.example.com/ep1/master.m3u8",
            "Episode 1",
            "/downloads/Episode 1.mp4",
        )
    }

    #[test]
    fn test_task_id_is_stable_and_user_scoped() {
        assert_eq!(task_id_for("ep-1", "alice"), task_id_for("ep-1", "alice"));
        assert_ne!(task_id_for("ep-1", "alice"), task_id_for("ep-1", "bob"));
        assert_ne!(task_id_for("ep-1", "alice"), task_id_for("ep-2", "alice"));
        assert_eq!(task_id_for("ep-1", "alice").len(), 32);
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Downloading).unwrap(),
            "\"DOWNLOADING\""
        );
        let status: TaskStatus = serde_json::from_str("\"CANCELLED\"").unwrap();
        assert_eq!(status, TaskStatus::Cancelled);
        assert!(TaskStatus::Pending.is_active());
        assert!(TaskStatus::Completed.is_terminal());
    }

    #[test]
    fn test_process_handle_is_not_persisted() {
        let mut task = sample().with_status(TaskStatus::Downloading);
        task.process_handle = Some(ProcessHandle::new(Some(42), CancellationToken::new()));

        let json = serde_json::to_value(&task).unwrap();
        assert!(json.get("processHandle").is_none());
        assert_eq!(json["userId"], "user-1");
        assert_eq!(json["status"], "DOWNLOADING");

        let restored: DownloadTask = serde_json::from_value(json).unwrap();
        assert!(restored.process_handle.is_none());
        assert!(restored.is_queued());
    }

    #[test]
    fn test_metadata_round_trips_untouched() {
        let meta = serde_json::json!({ "movieId": 7, "episode": { "n": 3 } });
        let task = sample().with_metadata(Some(meta.clone()));
        let json = serde_json::to_string(&task).unwrap();
        let restored: DownloadTask = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.metadata, Some(meta));
    }

    #[test]
    fn test_finish_clears_handle() {
        let mut task = sample().with_status(TaskStatus::Downloading);
        let handle = ProcessHandle::new(None, CancellationToken::new());
        let handle_id = handle.id;
        task.process_handle = Some(handle);
        assert!(task.is_running());
        assert!(task.has_process(handle_id));

        task.finish(TaskStatus::Cancelled, Some("boom".into()));
        assert!(task.process_handle.is_none());
        assert!(!task.has_process(handle_id));
        assert_eq!(task.error.as_deref(), Some("boom"));
        assert!(!task.is_queued());
    }
}
