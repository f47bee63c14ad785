//! JSON-document backed task store.
//!
//! The whole task set lives in memory and is rewritten to a single JSON
//! document (object keyed by task id) after every mutation. Reads never touch
//! the disk. Writers are serialised so that "mutate, serialise, write" is
//! never interleaved between two callers.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, info, warn};

use super::events::{DEFAULT_CHANNEL_CAPACITY, Subscription, TaskEvent, spawn_listener};
use super::task::{DownloadTask, TaskStatus};
use crate::utils::fs;
use crate::{Error, Result};

/// Error recorded on completed tasks whose output vanished between runs.
pub const FILE_MISSING_ERROR: &str = "file no longer exists";

/// In-memory task set, kept in creation order.
#[derive(Default)]
struct TaskMap {
    tasks: HashMap<String, DownloadTask>,
    order: Vec<String>,
}

impl TaskMap {
    fn upsert(&mut self, task: DownloadTask) {
        if !self.tasks.contains_key(&task.id) {
            self.order.push(task.id.clone());
        }
        self.tasks.insert(task.id.clone(), task);
    }

    fn remove(&mut self, id: &str) -> Option<DownloadTask> {
        let task = self.tasks.remove(id)?;
        self.order.retain(|existing| existing != id);
        Some(task)
    }

    fn iter(&self) -> impl Iterator<Item = &DownloadTask> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }
}

/// Durable, restart-survivable map from task id to [`DownloadTask`].
pub struct TaskStore {
    path: PathBuf,
    state: RwLock<TaskMap>,
    /// Serialises mutate + write so whole-document writes never lose updates.
    write_lock: Mutex<()>,
    loaded: AtomicBool,
    event_tx: broadcast::Sender<TaskEvent>,
}

impl TaskStore {
    /// Create a store backed by the document at `path`. Nothing is read until [`load`](Self::load).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (event_tx, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            path: path.into(),
            state: RwLock::new(TaskMap::default()),
            write_lock: Mutex::new(()),
            loaded: AtomicBool::new(false),
            event_tx,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the durable document into memory.
    ///
    /// Completed tasks whose file is gone are downgraded to `Cancelled`.
    /// A document that cannot be read or parsed is moved aside to
    /// `<name>.corrupt` and the store starts empty.
    /// Only the first call does any work.
    pub async fn load(&self) {
        let _guard = self.write_lock.lock().await;
        if self.loaded.load(Ordering::Acquire) {
            return;
        }

        let document = match self.read_document().await {
            Ok(Some(document)) => document,
            Ok(None) => {
                debug!(path = %self.path.display(), "No task document yet, starting empty");
                self.loaded.store(true, Ordering::Release);
                return;
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Task document is unusable, starting empty");
                self.set_aside().await;
                self.loaded.store(true, Ordering::Release);
                return;
            }
        };

        let mut tasks: Vec<DownloadTask> = document
            .into_iter()
            .map(|(key, mut task)| {
                if task.id != key {
                    warn!(key = %key, task_id = %task.id, "Task id does not match its key, using key");
                    task.id = key;
                }
                task
            })
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut downgraded = Vec::new();
        for task in &mut tasks {
            if task.status == TaskStatus::Completed && !fs::file_exists(&task.destination_path).await
            {
                warn!(
                    task_id = %task.id,
                    path = %task.destination_path.display(),
                    "Completed download is missing on disk"
                );
                task.finish(TaskStatus::Cancelled, Some(FILE_MISSING_ERROR.to_string()));
                downgraded.push(task.clone());
            }
        }

        let count = tasks.len();
        {
            let mut state = self.state.write();
            for task in tasks {
                // Anything saved before load() is newer than the document.
                if !state.tasks.contains_key(&task.id) {
                    state.upsert(task);
                }
            }
        }
        self.loaded.store(true, Ordering::Release);
        info!(path = %self.path.display(), count, "Loaded download tasks");

        if !downgraded.is_empty() {
            self.persist_logged().await;
            for task in downgraded {
                let _ = self.event_tx.send(TaskEvent::Updated(task));
            }
        }
    }

    /// `Ok(None)` when there is no document yet.
    async fn read_document(&self) -> Result<Option<HashMap<String, DownloadTask>>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io_path("reading", &self.path, e)),
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    /// Move an unusable document out of the way so the next write does not
    /// destroy it.
    async fn set_aside(&self) {
        let aside = corrupt_path(&self.path);
        match tokio::fs::rename(&self.path, &aside).await {
            Ok(()) => warn!(path = %aside.display(), "Unusable task document kept for inspection"),
            Err(e) => error!(
                path = %self.path.display(),
                error = %e,
                "Failed to move unusable task document aside"
            ),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Insert or replace a task, write the document, notify subscribers.
    pub async fn save(&self, task: DownloadTask) {
        let _guard = self.write_lock.lock().await;
        self.state.write().upsert(task.clone());
        self.persist_logged().await;
        let _ = self.event_tx.send(TaskEvent::Updated(task));
    }

    /// Apply `f` to a stored task, then write and notify as [`save`](Self::save) does.
    ///
    /// Returns the updated task, or `None` if the id is unknown (nothing is written).
    pub async fn update<F>(&self, id: &str, f: F) -> Option<DownloadTask>
    where
        F: FnOnce(&mut DownloadTask),
    {
        let _guard = self.write_lock.lock().await;
        let updated = {
            let mut state = self.state.write();
            let task = state.tasks.get_mut(id)?;
            f(task);
            task.clone()
        };
        self.persist_logged().await;
        let _ = self.event_tx.send(TaskEvent::Updated(updated.clone()));
        Some(updated)
    }

    /// Remove a task, write the document, notify subscribers.
    pub async fn remove(&self, id: &str) -> Option<DownloadTask> {
        let _guard = self.write_lock.lock().await;
        let removed = self.state.write().remove(id)?;
        self.persist_logged().await;
        let _ = self.event_tx.send(TaskEvent::Removed { id: id.to_string() });
        Some(removed)
    }

    pub fn get(&self, id: &str) -> Option<DownloadTask> {
        self.state.read().tasks.get(id).cloned()
    }

    /// All tasks in creation order.
    pub fn get_all(&self) -> Vec<DownloadTask> {
        self.state.read().iter().cloned().collect()
    }

    pub fn get_all_for_user(&self, user_id: &str) -> Vec<DownloadTask> {
        self.state
            .read()
            .iter()
            .filter(|task| task.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn find_by_reference_and_user(&self, reference: &str, user_id: &str) -> Option<DownloadTask> {
        self.state
            .read()
            .iter()
            .find(|task| task.reference == reference && task.user_id == user_id)
            .cloned()
    }

    /// Tasks waiting for a concurrency slot, oldest first.
    pub fn queued(&self) -> Vec<DownloadTask> {
        self.state
            .read()
            .iter()
            .filter(|task| task.is_queued())
            .cloned()
            .collect()
    }

    /// The oldest task waiting for a concurrency slot.
    pub fn next_queued(&self) -> Option<DownloadTask> {
        self.state.read().iter().find(|task| task.is_queued()).cloned()
    }

    /// Tasks with a live child process.
    pub fn running(&self) -> Vec<DownloadTask> {
        self.state
            .read()
            .iter()
            .filter(|task| task.is_running())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a listener for change events. See [`Subscription`].
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(TaskEvent) + Send + 'static,
    {
        spawn_listener(self.event_tx.subscribe(), listener)
    }

    /// Raw receiver for async consumers.
    pub fn events(&self) -> broadcast::Receiver<TaskEvent> {
        self.event_tx.subscribe()
    }

    pub async fn file_exists(&self, path: &Path) -> bool {
        fs::file_exists(path).await
    }

    /// Delete a file; `Ok(false)` if it was not there.
    pub async fn delete_file(&self, path: &Path) -> Result<bool> {
        fs::remove_file_if_exists(path).await
    }

    /// Write the document. The in-memory state stays authoritative on failure.
    ///
    /// Must be called with `write_lock` held.
    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            error!(path = %self.path.display(), error = %e, "Failed to write task document");
        }
    }

    async fn persist(&self) -> Result<()> {
        let bytes = {
            let state = self.state.read();
            let document: BTreeMap<&str, &DownloadTask> = state
                .tasks
                .iter()
                .map(|(id, task)| (id.as_str(), task))
                .collect();
            serde_json::to_vec_pretty(&document)?
        };
        fs::write_atomic(&self.path, &bytes).await
    }
}

/// `tasks.json` -> `tasks.json.corrupt`.
fn corrupt_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".corrupt");
    path.with_file_name(name)
}
