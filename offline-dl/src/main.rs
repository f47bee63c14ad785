use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use offline_dl::config::DownloadManagerConfig;
use offline_dl::downloader::{DownloadManager, FfmpegEngine};
use offline_dl::logging::{self, LogFormat};
use offline_dl::network::{ConnectivityProbe, HttpConnectivityProbe, NetworkMonitor};
use offline_dl::notification::LogNotificationSink;
use offline_dl::store::{DocumentLock, DownloadTask, TaskEvent, TaskStatus, TaskStore};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Directory downloads are written to
    #[arg(long, global = true)]
    download_dir: Option<PathBuf>,

    /// Task document location (defaults to tasks.json in the download directory)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Maximum number of simultaneous downloads
    #[arg(long, global = true)]
    max_concurrent: Option<usize>,

    /// Path to the ffmpeg binary
    #[arg(long, global = true)]
    ffmpeg: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download an HLS stream and wait until all queued work is done
    Fetch {
        /// HLS manifest URL
        url: String,

        /// Title, also used as the output file name
        #[arg(short, long)]
        title: String,

        /// Source reference used to de-duplicate requests (defaults to the URL)
        #[arg(long)]
        reference: Option<String>,

        /// Owner of the download
        #[arg(short, long, default_value = "local")]
        user: String,
    },
    /// Run downloads left queued by earlier runs
    Resume,
    /// List downloads
    List {
        /// Only show downloads of this user
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Cancel a queued download (refused while another process runs downloads)
    Cancel { id: String },
    /// Delete a finished download and its file (refused while another process runs downloads)
    Delete { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    logging::init(format, None)?;

    let config = resolve_config(&cli)?;
    let store = Arc::new(TaskStore::new(&config.store_path));
    let probe = Arc::new(
        HttpConnectivityProbe::new(config.probe_url.clone(), config.probe_timeout())
            .context("Failed to create connectivity probe")?,
    );
    let engine = Arc::new(FfmpegEngine::with_binary(&config.ffmpeg_path));
    let manager = DownloadManager::new(
        config.clone(),
        store,
        engine,
        probe.clone(),
        Arc::new(LogNotificationSink),
    );

    match cli.command {
        Command::Fetch {
            url,
            title,
            reference,
            user,
        } => {
            let _lock = lock_document(&config)?;
            manager.start().await.context("Failed to start download manager")?;
            let reference = reference.unwrap_or_else(|| url.clone());
            let id = manager
                .request_download(&reference, &url, &title, &user, None)
                .await
                .with_context(|| format!("Failed to request download of {}", url))?;
            println!("{} {}", "Requested:".green(), id.cyan());

            run_until_drained(&manager, probe, config.probe_interval()).await;

            let task = manager
                .get_task(&id)
                .with_context(|| format!("Task {} disappeared", id))?;
            print_task(&task);
            if task.status == TaskStatus::Cancelled {
                anyhow::bail!(
                    "Download did not complete: {}",
                    task.error.as_deref().unwrap_or("cancelled")
                );
            }
        }
        Command::Resume => {
            let _lock = lock_document(&config)?;
            manager.start().await.context("Failed to start download manager")?;
            run_until_drained(&manager, probe, config.probe_interval()).await;
            println!("{}", "All queued downloads processed".green());
        }
        Command::List { user } => {
            manager.store().load().await;
            let tasks = match user {
                Some(user) => manager.get_all_tasks_for_user(&user),
                None => manager.get_all_tasks(),
            };
            if tasks.is_empty() {
                println!("{}", "No downloads".yellow());
            }
            for task in &tasks {
                print_task(task);
            }
        }
        Command::Cancel { id } => {
            let _lock = lock_document(&config)?;
            manager.store().load().await;
            if !manager.cancel_download(&id).await {
                anyhow::bail!("No active download with id {}", id);
            }
            println!("{} {}", "Cancelled:".yellow(), id);
        }
        Command::Delete { id } => {
            let _lock = lock_document(&config)?;
            manager.store().load().await;
            if !manager.delete_download(&id).await {
                anyhow::bail!("No finished download with id {}", id);
            }
            println!("{} {}", "Deleted:".yellow(), id);
        }
    }

    Ok(())
}

/// Environment first, then command line flags.
fn resolve_config(cli: &Cli) -> anyhow::Result<DownloadManagerConfig> {
    let mut config = DownloadManagerConfig::from_env().context("Invalid configuration")?;

    if let Some(dir) = &cli.download_dir {
        config.download_dir = dir.clone();
        if cli.store.is_none() {
            config.store_path = dir.join("tasks.json");
        }
    }
    if let Some(store) = &cli.store {
        config.store_path = store.clone();
    }
    if let Some(max) = cli.max_concurrent {
        config.max_concurrent = max;
    }
    if let Some(ffmpeg) = &cli.ffmpeg {
        config.ffmpeg_path = ffmpeg.clone();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn lock_document(config: &DownloadManagerConfig) -> anyhow::Result<DocumentLock> {
    DocumentLock::try_acquire(&config.store_path)
        .context("Another offline-dl process is running downloads; stop it first")
}

/// Drive the manager until nothing is running or queued, or Ctrl-C.
async fn run_until_drained(
    manager: &DownloadManager,
    probe: Arc<dyn ConnectivityProbe>,
    probe_interval: Duration,
) {
    let monitor = NetworkMonitor::spawn_polling(Arc::new(manager.clone()), probe, probe_interval);
    let mut events = manager.store().events();
    let mut last_status: HashMap<String, TaskStatus> = HashMap::new();

    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(120));
    if let Ok(style) = ProgressStyle::with_template("{spinner:.blue} {msg}") {
        spinner.set_style(style);
    }

    let mut refresh = tokio::time::interval(Duration::from_millis(500));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        if manager.active_count().await == 0 && manager.store().queued().is_empty() {
            break;
        }

        tokio::select! {
            _ = &mut ctrl_c => {
                warn!("Interrupted, stopping downloads");
                manager.shutdown().await;
                break;
            }
            event = events.recv() => match event {
                Ok(TaskEvent::Updated(task)) => {
                    if last_status.insert(task.id.clone(), task.status) != Some(task.status) {
                        spinner.println(format!("{} {}", colored_status(task.status), task.title));
                    }
                }
                Ok(TaskEvent::Removed { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed task updates");
                }
                Err(RecvError::Closed) => break,
            },
            _ = refresh.tick() => {
                spinner.set_message(status_line(manager).await);
            }
        }
    }

    spinner.finish_and_clear();
    monitor.shutdown().await;
    info!("Download queue drained");
}

async fn status_line(manager: &DownloadManager) -> String {
    let queued = manager.store().queued().len();
    if !manager.is_network_connected().await {
        return format!("Waiting for connectivity ({} queued)", queued);
    }

    let running: Vec<String> = manager
        .store()
        .running()
        .iter()
        .map(|task| match manager.progress(&task.id) {
            Some(p) => format!(
                "{} [{:.0}s, {:.1} MiB]",
                task.title,
                p.media_time_secs,
                p.bytes_written as f64 / (1024.0 * 1024.0)
            ),
            None => task.title.clone(),
        })
        .collect();

    format!("{} queued | {}", queued, running.join(", "))
}

fn colored_status(status: TaskStatus) -> ColoredString {
    match status {
        TaskStatus::Pending => status.as_str().dimmed(),
        TaskStatus::Downloading => status.as_str().cyan(),
        TaskStatus::Completed => status.as_str().green(),
        TaskStatus::Cancelled => status.as_str().red(),
    }
}

fn print_task(task: &DownloadTask) {
    println!(
        "{}  {:<11}  {}  {}",
        task.id.dimmed(),
        colored_status(task.status),
        task.title.bold(),
        task.destination_path.display()
    );
    if let Some(error) = &task.error {
        println!("    {} {}", "error:".red(), error);
    }
}
