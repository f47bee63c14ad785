//! Shared fixtures for manager integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use offline_dl::config::DownloadManagerConfig;
use offline_dl::downloader::engine::TranscodeProcess;
use offline_dl::downloader::{
    DownloadManager, ExitOutcome, TranscodeEngine, TranscodeJob, TranscodeProgress,
};
use offline_dl::network::ManualConnectivity;
use offline_dl::notification::NotificationSink;
use offline_dl::store::{DownloadTask, ProcessHandle, TaskStore};
use offline_dl::{Error, Result};

struct Running {
    job: TranscodeJob,
    exit_tx: oneshot::Sender<ExitOutcome>,
    progress_tx: mpsc::Sender<TranscodeProgress>,
}

#[derive(Default)]
struct EngineState {
    running: HashMap<String, Running>,
    started: Vec<String>,
    fail_sources: HashSet<String>,
    max_running: usize,
}

/// In-process engine whose "processes" run until the test finishes them.
///
/// Cancelling a handle ends the process with [`ExitOutcome::Cancelled`].
#[derive(Default)]
pub struct ScriptedEngine {
    state: Arc<Mutex<EngineState>>,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every start for `source_url` fail.
    pub fn fail_starts_for(&self, source_url: &str) {
        self.state.lock().fail_sources.insert(source_url.to_string());
    }

    /// Task ids in the order their processes were started.
    pub fn started(&self) -> Vec<String> {
        self.state.lock().started.clone()
    }

    pub fn start_count(&self, task_id: &str) -> usize {
        self.state.lock().started.iter().filter(|id| *id == task_id).count()
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.state.lock().running.contains_key(task_id)
    }

    pub fn running_count(&self) -> usize {
        self.state.lock().running.len()
    }

    /// Highest number of processes alive at the same time.
    pub fn max_running(&self) -> usize {
        self.state.lock().max_running
    }

    pub async fn report_progress(&self, task_id: &str, progress: TranscodeProgress) {
        let tx = self
            .state
            .lock()
            .running
            .get(task_id)
            .map(|r| r.progress_tx.clone())
            .expect("process is running");
        tx.send(progress).await.expect("progress receiver alive");
    }

    /// Write the output file and exit successfully.
    pub fn succeed(&self, task_id: &str) {
        let running = self
            .state
            .lock()
            .running
            .remove(task_id)
            .expect("process is running");
        std::fs::write(&running.job.destination_path, b"mp4").expect("write output");
        let _ = running.exit_tx.send(ExitOutcome::Success);
    }

    /// Exit with a failure.
    pub fn fail(&self, task_id: &str, message: &str) {
        let running = self
            .state
            .lock()
            .running
            .remove(task_id)
            .expect("process is running");
        let _ = running.exit_tx.send(ExitOutcome::failed(Some(1), message));
    }
}

#[async_trait]
impl TranscodeEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn version(&self) -> Option<String> {
        Some("scripted 1.0".to_string())
    }

    async fn start(
        &self,
        job: TranscodeJob,
        progress_tx: mpsc::Sender<TranscodeProgress>,
    ) -> Result<TranscodeProcess> {
        let mut state = self.state.lock();
        state.started.push(job.task_id.clone());
        if state.fail_sources.contains(&job.source_url) {
            return Err(Error::ProcessStart(format!("cannot run {}", job.source_url)));
        }

        // A partial output appears as soon as the process runs.
        std::fs::write(&job.destination_path, b"partial").expect("write partial output");

        let (exit_tx, exit_rx) = oneshot::channel();
        let token = CancellationToken::new();
        let task_id = job.task_id.clone();
        state.running.insert(
            task_id.clone(),
            Running {
                job,
                exit_tx,
                progress_tx,
            },
        );
        state.max_running = state.max_running.max(state.running.len());

        let shared = self.state.clone();
        let cancelled = token.clone();
        tokio::spawn(async move {
            cancelled.cancelled().await;
            let running = shared.lock().running.remove(&task_id);
            if let Some(running) = running {
                let _ = running.exit_tx.send(ExitOutcome::Cancelled);
            }
        });

        Ok(TranscodeProcess {
            handle: ProcessHandle::new(None, token),
            exit: exit_rx,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    State(String),
    Terminal(String, bool),
    Cancelled(String),
    Dismissed(String),
}

/// Sink that records every call.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }

    pub fn events_for(&self, task_id: &str) -> Vec<SinkEvent> {
        self.events()
            .into_iter()
            .filter(|event| match event {
                SinkEvent::State(id)
                | SinkEvent::Terminal(id, _)
                | SinkEvent::Cancelled(id)
                | SinkEvent::Dismissed(id) => id == task_id,
            })
            .collect()
    }
}

impl NotificationSink for RecordingSink {
    fn on_state_event(&self, task: &DownloadTask) {
        self.events.lock().push(SinkEvent::State(task.id.clone()));
    }

    fn on_terminal_event(&self, task: &DownloadTask, success: bool) {
        self.events
            .lock()
            .push(SinkEvent::Terminal(task.id.clone(), success));
    }

    fn on_cancelled_event(&self, task: &DownloadTask) {
        self.events.lock().push(SinkEvent::Cancelled(task.id.clone()));
    }

    fn dismiss(&self, task_id: &str) {
        self.events
            .lock()
            .push(SinkEvent::Dismissed(task_id.to_string()));
    }
}

/// A manager wired to scripted collaborators in a temporary directory.
pub struct Harness {
    pub temp: TempDir,
    pub engine: Arc<ScriptedEngine>,
    pub sink: Arc<RecordingSink>,
    pub connectivity: Arc<ManualConnectivity>,
    pub manager: DownloadManager,
}

impl Harness {
    pub async fn new(max_concurrent: usize) -> Self {
        let temp = TempDir::new().expect("temp dir");
        Self::in_dir(temp, max_concurrent).await
    }

    /// Build a fresh manager over an existing directory, as a restart would.
    pub async fn in_dir(temp: TempDir, max_concurrent: usize) -> Self {
        let config = DownloadManagerConfig {
            max_concurrent,
            download_dir: temp.path().join("downloads"),
            store_path: temp.path().join("downloads").join("tasks.json"),
            ..Default::default()
        };
        let engine = ScriptedEngine::new();
        let sink = Arc::new(RecordingSink::default());
        let connectivity = Arc::new(ManualConnectivity::new(true));
        let store = Arc::new(TaskStore::new(&config.store_path));
        let manager = DownloadManager::new(
            config,
            store,
            engine.clone(),
            connectivity.clone(),
            sink.clone(),
        );
        manager.start().await.expect("manager starts");

        Self {
            temp,
            engine,
            sink,
            connectivity,
            manager,
        }
    }

    pub fn download_dir(&self) -> PathBuf {
        self.temp.path().join("downloads")
    }

    pub async fn request(&self, name: &str) -> String {
        self.manager
            .request_download(name, &source_url(name), name, "user-1", None)
            .await
            .expect("request accepted")
    }

    pub fn task(&self, id: &str) -> DownloadTask {
        self.manager.get_task(id).expect("task exists")
    }

    /// Consume the harness, keeping its directory for a restart.
    pub fn into_dir(self) -> TempDir {
        self.temp
    }
}

pub fn source_url(name: &str) -> String {
    format!("https://cdn.example.com/{name}/master.m3u8")
}

/// Poll `check` until it holds, failing the test after a few seconds.
pub async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
