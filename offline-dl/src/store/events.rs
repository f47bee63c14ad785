//! Change notifications fanned out by the task store.

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::task::DownloadTask;

/// Default channel capacity for store change events.
pub(crate) const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// A mutation that reached the store.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// A task was inserted or updated. Carries the new state.
    Updated(DownloadTask),
    /// A task was removed.
    Removed { id: String },
}

impl TaskEvent {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Updated(task) => &task.id,
            Self::Removed { id } => id,
        }
    }
}

/// Handle returned by `subscribe`. Delivery stops when it is dropped or
/// [`Subscription::unsubscribe`] is called.
#[derive(Debug)]
#[must_use = "dropping a Subscription immediately unsubscribes the listener"]
pub struct Subscription {
    token: CancellationToken,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Run `listener` on its own task for every event received on `rx`.
///
/// The listener never runs on the mutating caller's task, so a slow listener
/// only delays itself. If it falls behind by more than the channel capacity
/// the oldest events are skipped.
pub(crate) fn spawn_listener<F>(mut rx: broadcast::Receiver<TaskEvent>, listener: F) -> Subscription
where
    F: Fn(TaskEvent) + Send + 'static,
{
    let token = CancellationToken::new();
    let cancelled = token.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => listener(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Task store listener lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("Task store listener stopped");
    });

    Subscription { token }
}
