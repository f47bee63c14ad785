//! Download Manager implementation.
//!
//! Owns admission control and the task state machine. Every path that
//! changes scheduling state (requests, cancellations, process completions,
//! connectivity changes) runs under one async mutex, so admission decisions
//! are serialised and the concurrency cap cannot be overshot. The live
//! connectivity check at admission runs with the mutex released.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::engine::{ExitOutcome, TranscodeEngine, TranscodeJob, TranscodeProgress};
use crate::config::DownloadManagerConfig;
use crate::network::{ConnectivityListener, ConnectivityProbe};
use crate::notification::NotificationSink;
use crate::store::{DownloadTask, Subscription, TaskEvent, TaskStatus, TaskStore};
use crate::utils::filename::destination_for;
use crate::utils::fs;
use crate::{Error, Result};

/// Error recorded when admission finds the device offline.
pub const NO_CONNECTION_ERROR: &str = "no internet connection available";
/// Error recorded when the transcode process could not be spawned.
pub const START_FAILED_ERROR: &str = "failed to start process";
/// Error recorded on running tasks killed by a connectivity loss.
pub const CONNECTION_LOST_ERROR: &str = "download cancelled due to internet connection loss";

/// Capacity of the per-task progress channel.
const PROGRESS_CHANNEL_CAPACITY: usize = 16;

/// Process-local scheduling state. Never persisted.
#[derive(Debug)]
struct SchedulerState {
    /// Tasks holding a concurrency slot.
    active_count: usize,
    network_connected: bool,
}

struct Inner {
    config: DownloadManagerConfig,
    store: Arc<TaskStore>,
    engine: Arc<dyn TranscodeEngine>,
    sink: Arc<dyn NotificationSink>,
    probe: Arc<dyn ConnectivityProbe>,
    state: Mutex<SchedulerState>,
    /// Latest progress per running task.
    progress: DashMap<String, TranscodeProgress>,
    shutting_down: AtomicBool,
}

/// The Download Manager service.
///
/// Cheap to clone; clones share the same scheduler.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    /// Create a new download manager.
    pub fn new(
        config: DownloadManagerConfig,
        store: Arc<TaskStore>,
        engine: Arc<dyn TranscodeEngine>,
        probe: Arc<dyn ConnectivityProbe>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                engine,
                sink,
                probe,
                state: Mutex::new(SchedulerState {
                    active_count: 0,
                    network_connected: true,
                }),
                progress: DashMap::new(),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &DownloadManagerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.inner.store
    }

    /// Load persisted tasks, prepare the download directory and resume
    /// tasks left queued by an earlier run.
    pub async fn start(&self) -> Result<()> {
        self.inner.store.load().await;
        fs::ensure_dir_all("creating download directory", &self.inner.config.download_dir)
            .await?;

        let engine = &self.inner.engine;
        if engine.is_available() {
            info!(
                engine = engine.name(),
                version = engine.version().as_deref().unwrap_or("unknown"),
                "Transcode engine available"
            );
        } else {
            warn!(
                engine = engine.name(),
                "Transcode engine not available, downloads will fail to start"
            );
        }

        self.inner.shutting_down.store(false, Ordering::Release);
        let queued = self.inner.store.queued().len();
        if queued > 0 {
            info!(queued, "Resuming queued downloads");
        }
        self.try_admit_next().await;
        Ok(())
    }

    /// Stop every running transcode without recording an outcome.
    ///
    /// The affected tasks stay `Downloading` with no handle, so the next
    /// [`start`](Self::start) picks them up again. Admission is refused until then.
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let running = self.inner.store.running();
        info!(running = running.len(), "Shutting down download manager");
        for task in running {
            if let Some(handle) = &task.process_handle {
                handle.cancel();
            }
            self.inner
                .store
                .update(&task.id, |t| t.process_handle = None)
                .await;
            self.remove_partial_output(&task).await;
        }
        state.active_count = 0;
        self.inner.progress.clear();
    }

    /// Request a download of `source_url` for `user_id`.
    ///
    /// Returns the task id. Repeating a request for the same
    /// `(reference, user_id)` returns the existing task untouched.
    pub async fn request_download(
        &self,
        reference: &str,
        source_url: &str,
        title: &str,
        user_id: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<String> {
        self.inner.store.load().await;
        let state = self.inner.state.lock().await;

        if let Some(existing) = self.inner.store.find_by_reference_and_user(reference, user_id) {
            debug!(task_id = %existing.id, status = %existing.status, "Download already requested");
            return Ok(existing.id);
        }

        let destination = destination_for(&self.inner.config.download_dir, title);
        let task = DownloadTask::new(reference, user_id, source_url, title, destination)
            .with_metadata(metadata);
        let being_written = self
            .destination_owner(&task)
            .is_some_and(|owner| owner.is_running());
        if !being_written && self.inner.store.file_exists(&task.destination_path).await {
            let task = task.with_status(TaskStatus::Completed);
            info!(
                task_id = %task.id,
                path = %task.destination_path.display(),
                "Destination already exists, marking download completed"
            );
            self.inner.store.save(task.clone()).await;
            self.inner.sink.on_terminal_event(&task, true);
            return Ok(task.id);
        }

        if !state.network_connected {
            return Err(Error::NoConnection);
        }

        let task = task.with_status(TaskStatus::Downloading);
        let task_id = task.id.clone();
        info!(task_id = %task_id, title = %task.title, "Download requested");

        self.inner.store.save(task.clone()).await;
        self.inner.sink.on_state_event(&task);
        self.admit(state).await;

        Ok(task_id)
    }

    /// Cancel an active download.
    ///
    /// Returns `false` for unknown or already finished tasks.
    pub async fn cancel_download(&self, task_id: &str) -> bool {
        let _state = self.inner.state.lock().await;

        let Some(task) = self.inner.store.get(task_id) else {
            debug!(task_id = %task_id, "Cancel requested for unknown task");
            return false;
        };
        if task.status.is_terminal() {
            debug!(task_id = %task_id, status = %task.status, "Nothing to cancel");
            return false;
        }

        match &task.process_handle {
            Some(handle) => {
                // The completion watcher records the transition and frees the slot.
                info!(task_id = %task_id, pid = ?handle.pid, "Cancelling running download");
                handle.cancel();
            }
            None => {
                info!(task_id = %task_id, "Cancelling queued download");
                if let Some(cancelled) = self
                    .inner
                    .store
                    .update(task_id, |t| t.finish(TaskStatus::Cancelled, None))
                    .await
                {
                    self.inner.sink.on_cancelled_event(&cancelled);
                }
            }
        }

        self.remove_partial_output(&task).await;
        true
    }

    /// Delete a finished download: its file and its record.
    ///
    /// Active tasks must be cancelled first; they return `false`.
    pub async fn delete_download(&self, task_id: &str) -> bool {
        let _state = self.inner.state.lock().await;

        let Some(task) = self.inner.store.get(task_id) else {
            return false;
        };
        if task.status.is_active() {
            warn!(task_id = %task_id, status = %task.status, "Refusing to delete an active download");
            return false;
        }

        if self.destination_owner(&task).is_some() {
            debug!(task_id = %task_id, "Output file belongs to another task, keeping it");
        } else if let Err(e) = self.inner.store.delete_file(&task.destination_path).await {
            warn!(task_id = %task_id, error = %e, "Failed to delete downloaded file");
        }

        self.inner.store.remove(task_id).await;
        self.inner.sink.dismiss(task_id);
        info!(task_id = %task_id, "Download deleted");
        true
    }

    pub fn get_task(&self, task_id: &str) -> Option<DownloadTask> {
        self.inner.store.get(task_id)
    }

    pub fn get_all_tasks(&self) -> Vec<DownloadTask> {
        self.inner.store.get_all()
    }

    pub fn get_all_tasks_for_user(&self, user_id: &str) -> Vec<DownloadTask> {
        self.inner.store.get_all_for_user(user_id)
    }

    /// Register a listener for task changes. See [`Subscription`].
    pub fn subscribe_to_changes<F>(&self, listener: F) -> Subscription
    where
        F: Fn(TaskEvent) + Send + 'static,
    {
        self.inner.store.subscribe(listener)
    }

    /// Number of tasks currently holding a concurrency slot.
    pub async fn active_count(&self) -> usize {
        self.inner.state.lock().await.active_count
    }

    pub async fn is_network_connected(&self) -> bool {
        self.inner.state.lock().await.network_connected
    }

    /// Latest transcode progress of a running task.
    pub fn progress(&self, task_id: &str) -> Option<TranscodeProgress> {
        self.inner.progress.get(task_id).map(|p| p.clone())
    }

    /// Start queued tasks while slots are free.
    pub async fn try_admit_next(&self) {
        let state = self.inner.state.lock().await;
        self.admit(state).await;
    }

    /// Admission loop. Consumes the scheduler guard because the live
    /// connectivity check runs unlocked; everything decided before it is
    /// re-checked once the lock is taken back.
    async fn admit<'a>(&'a self, mut state: MutexGuard<'a, SchedulerState>) {
        loop {
            if !self.can_admit(&state) {
                return;
            }
            let Some(candidate) = self.inner.store.next_queued() else {
                return;
            };

            drop(state);
            let online = self.inner.probe.is_connected().await;
            state = self.inner.state.lock().await;

            if !self.can_admit(&state) {
                return;
            }
            // Cancelled or admitted by someone else while unlocked.
            let Some(task) = self.inner.store.get(&candidate.id).filter(|t| t.is_queued()) else {
                continue;
            };

            if !online {
                warn!(task_id = %task.id, "No connectivity at admission");
                self.fail_task(&task.id, NO_CONNECTION_ERROR).await;
                return;
            }

            state.active_count += 1;
            if !self.spawn_task(task).await {
                state.active_count -= 1;
            }
        }
    }

    fn can_admit(&self, state: &SchedulerState) -> bool {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return false;
        }
        if state.active_count >= self.inner.config.max_concurrent {
            debug!(active = state.active_count, "No free download slot");
            return false;
        }
        if !state.network_connected {
            debug!("Offline, not admitting downloads");
            return false;
        }
        true
    }

    /// Start the transcode for an admitted task. Returns `false` if no process
    /// was started; the task has then already reached a terminal state.
    async fn spawn_task(&self, task: DownloadTask) -> bool {
        let task_id = task.id.clone();
        let task = self
            .inner
            .store
            .update(&task_id, |t| t.status = TaskStatus::Downloading)
            .await
            .unwrap_or(task);
        self.inner.sink.on_state_event(&task);

        match self.destination_owner(&task) {
            Some(owner) if owner.is_running() => {
                warn!(
                    task_id = %task_id,
                    owner = %owner.id,
                    path = %task.destination_path.display(),
                    "Destination is being written by another download"
                );
                self.fail_task(&task_id, START_FAILED_ERROR).await;
                return false;
            }
            Some(owner) if self.inner.store.file_exists(&task.destination_path).await => {
                info!(task_id = %task_id, owner = %owner.id, "Destination already downloaded");
                if let Some(task) = self
                    .inner
                    .store
                    .update(&task_id, |t| t.finish(TaskStatus::Completed, None))
                    .await
                {
                    self.inner.sink.on_terminal_event(&task, true);
                }
                return false;
            }
            _ => {}
        }

        if let Err(e) = self.prepare_destination(&task).await {
            error!(task_id = %task_id, error = %e, "Failed to prepare download destination");
            self.fail_task(&task_id, START_FAILED_ERROR).await;
            return false;
        }

        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let process = match self
            .inner
            .engine
            .start(TranscodeJob::from_task(&task), progress_tx)
            .await
        {
            Ok(process) => process,
            Err(e) => {
                error!(task_id = %task_id, error = %e, "Failed to start transcode");
                self.fail_task(&task_id, START_FAILED_ERROR).await;
                return false;
            }
        };

        let handle = process.handle;
        let handle_id = handle.id;
        info!(
            task_id = %task_id,
            pid = ?handle.pid,
            engine = self.inner.engine.name(),
            "Download started"
        );
        self.inner
            .store
            .update(&task_id, |t| t.process_handle = Some(handle))
            .await;

        self.spawn_progress_tracker(task_id.clone(), handle_id, progress_rx);
        self.spawn_completion_watcher(task_id, handle_id, process.exit);
        true
    }

    /// Make sure a fresh transcode can write its output.
    ///
    /// A file left at the destination by an interrupted run is removed unless
    /// another task owns it.
    async fn prepare_destination(&self, task: &DownloadTask) -> Result<()> {
        fs::ensure_parent_dir("creating download directory", &task.destination_path).await?;
        if self.destination_owner(task).is_none()
            && self.inner.store.delete_file(&task.destination_path).await?
        {
            debug!(task_id = %task.id, "Removed stale partial output");
        }
        Ok(())
    }

    fn spawn_progress_tracker(
        &self,
        task_id: String,
        handle_id: Uuid,
        mut progress_rx: mpsc::Receiver<TranscodeProgress>,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(progress) = progress_rx.recv().await {
                let current = manager
                    .inner
                    .store
                    .get(&task_id)
                    .is_some_and(|t| t.has_process(handle_id));
                if !current {
                    break;
                }
                manager.inner.progress.insert(task_id.clone(), progress);
            }
        });
    }

    fn spawn_completion_watcher(
        &self,
        task_id: String,
        handle_id: Uuid,
        exit: oneshot::Receiver<ExitOutcome>,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            let outcome = exit.await.unwrap_or_else(|_| {
                ExitOutcome::failed(None, "transcode ended without reporting an outcome")
            });
            manager.handle_completion(&task_id, handle_id, outcome).await;
        });
    }

    async fn handle_completion(&self, task_id: &str, handle_id: Uuid, outcome: ExitOutcome) {
        let mut state = self.inner.state.lock().await;

        let current = self
            .inner
            .store
            .get(task_id)
            .is_some_and(|t| t.has_process(handle_id));
        if !current {
            debug!(task_id = %task_id, ?outcome, "Ignoring completion of a written-off process");
            return;
        }

        state.active_count = state.active_count.saturating_sub(1);
        self.inner.progress.remove(task_id);

        match outcome {
            ExitOutcome::Success => {
                info!(task_id = %task_id, "Download completed");
                if let Some(task) = self
                    .inner
                    .store
                    .update(task_id, |t| t.finish(TaskStatus::Completed, None))
                    .await
                {
                    self.inner.sink.on_terminal_event(&task, true);
                }
            }
            ExitOutcome::Cancelled => {
                info!(task_id = %task_id, "Download cancelled");
                if let Some(task) = self
                    .inner
                    .store
                    .update(task_id, |t| t.finish(TaskStatus::Cancelled, None))
                    .await
                {
                    self.remove_partial_output(&task).await;
                    self.inner.sink.on_cancelled_event(&task);
                }
            }
            ExitOutcome::Failed { code, message } => {
                warn!(task_id = %task_id, ?code, error = %message, "Download failed");
                self.fail_task(task_id, &message).await;
            }
        }

        self.admit(state).await;
    }

    /// Write a task off as cancelled with `error` and tell the user.
    async fn fail_task(&self, task_id: &str, error: &str) {
        let Some(task) = self
            .inner
            .store
            .update(task_id, |t| {
                t.finish(TaskStatus::Cancelled, Some(error.to_string()))
            })
            .await
        else {
            return;
        };
        self.remove_partial_output(&task).await;
        self.inner.sink.on_terminal_event(&task, false);
    }

    /// Another task that completed into, or is currently writing, the same
    /// output file.
    fn destination_owner(&self, task: &DownloadTask) -> Option<DownloadTask> {
        self.inner.store.get_all().into_iter().find(|other| {
            other.id != task.id
                && other.destination_path == task.destination_path
                && (other.status == TaskStatus::Completed || other.is_running())
        })
    }

    /// Best-effort removal of an unfinished output file.
    async fn remove_partial_output(&self, task: &DownloadTask) {
        if self.destination_owner(task).is_some() {
            return;
        }
        match self.inner.store.delete_file(&task.destination_path).await {
            Ok(true) => debug!(task_id = %task.id, "Removed partial output"),
            Ok(false) => {}
            Err(e) => warn!(task_id = %task.id, error = %e, "Failed to remove partial output"),
        }
    }
}

#[async_trait]
impl ConnectivityListener for DownloadManager {
    /// Losing connectivity writes off every running download at once;
    /// regaining it only restarts admission of queued tasks.
    async fn on_connectivity_changed(&self, connected: bool) {
        let mut state = self.inner.state.lock().await;
        let was_connected = state.network_connected;
        state.network_connected = connected;

        match (was_connected, connected) {
            (true, false) => {
                let running = self.inner.store.running();
                warn!(running = running.len(), "Connectivity lost, cancelling running downloads");
                for task in running {
                    if let Some(handle) = &task.process_handle {
                        handle.cancel();
                    }
                    state.active_count = state.active_count.saturating_sub(1);
                    self.inner.progress.remove(&task.id);
                    self.fail_task(&task.id, CONNECTION_LOST_ERROR).await;
                }
            }
            (false, true) => {
                info!("Connectivity restored");
                self.admit(state).await;
            }
            _ => {}
        }
    }
}
