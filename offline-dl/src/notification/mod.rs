//! User-facing notification sink.
//!
//! The download manager reports task transitions here. How they are rendered
//! (system notifications, toasts, a badge) is up to the embedding
//! application; this crate only ships a logging adapter and a no-op.

use tracing::{debug, info, warn};

use crate::store::DownloadTask;

/// Receiver of user-visible download feedback.
///
/// Calls are made from the manager's serialised mutation path and must
/// return quickly; implementations that do real work should hand it off.
pub trait NotificationSink: Send + Sync {
    /// Task accepted or started; a progress-style, non-terminal event.
    fn on_state_event(&self, task: &DownloadTask);

    /// Task reached a terminal state on its own: completed (`success`) or
    /// stopped by an error.
    fn on_terminal_event(&self, task: &DownloadTask, success: bool);

    /// Task was cancelled by the user.
    fn on_cancelled_event(&self, task: &DownloadTask);

    /// Drop any feedback still shown for a task.
    fn dismiss(&self, task_id: &str);
}

/// Sink that writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotificationSink;

impl NotificationSink for LogNotificationSink {
    fn on_state_event(&self, task: &DownloadTask) {
        info!(task_id = %task.id, title = %task.title, status = %task.status, "Download update");
    }

    fn on_terminal_event(&self, task: &DownloadTask, success: bool) {
        if success {
            info!(
                task_id = %task.id,
                title = %task.title,
                path = %task.destination_path.display(),
                "Download completed"
            );
        } else {
            warn!(
                task_id = %task.id,
                title = %task.title,
                error = task.error.as_deref().unwrap_or("unknown error"),
                "Download failed"
            );
        }
    }

    fn on_cancelled_event(&self, task: &DownloadTask) {
        info!(task_id = %task.id, title = %task.title, "Download cancelled");
    }

    fn dismiss(&self, task_id: &str) {
        debug!(task_id = %task_id, "Notification dismissed");
    }
}

/// Sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotificationSink;

impl NotificationSink for NoopNotificationSink {
    fn on_state_event(&self, _task: &DownloadTask) {}
    fn on_terminal_event(&self, _task: &DownloadTask, _success: bool) {}
    fn on_cancelled_event(&self, _task: &DownloadTask) {}
    fn dismiss(&self, _task_id: &str) {}
}
