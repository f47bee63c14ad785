//! Connectivity monitor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::probe::ConnectivityProbe;

/// Receives connectivity transitions from a [`NetworkMonitor`].
#[async_trait]
pub trait ConnectivityListener: Send + Sync {
    async fn on_connectivity_changed(&self, connected: bool);
}

/// Background task that watches connectivity and forwards transitions.
///
/// The listener is assumed to start in the connected state; only changes
/// relative to the last forwarded state are delivered.
pub struct NetworkMonitor {
    cancellation_token: CancellationToken,
    task: JoinHandle<()>,
}

impl NetworkMonitor {
    /// Follow a pushed connectivity state (e.g. an OS reachability callback
    /// feeding a [`ManualConnectivity`](super::ManualConnectivity)).
    pub fn spawn_watch(
        listener: Arc<dyn ConnectivityListener>,
        mut rx: watch::Receiver<bool>,
    ) -> Self {
        let cancellation_token = CancellationToken::new();
        let cancelled = cancellation_token.clone();

        let task = tokio::spawn(async move {
            let mut last = true;
            loop {
                let current = *rx.borrow_and_update();
                if current != last {
                    log_transition(current);
                    listener.on_connectivity_changed(current).await;
                    last = current;
                }

                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            debug!("Connectivity source closed");
                            break;
                        }
                    }
                }
            }
            debug!("Network monitor stopped");
        });

        Self {
            cancellation_token,
            task,
        }
    }

    /// Poll `probe` every `interval`.
    pub fn spawn_polling(
        listener: Arc<dyn ConnectivityListener>,
        probe: Arc<dyn ConnectivityProbe>,
        interval: Duration,
    ) -> Self {
        let cancellation_token = CancellationToken::new();
        let cancelled = cancellation_token.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last = true;

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let current = tokio::select! {
                    _ = cancelled.cancelled() => break,
                    connected = probe.is_connected() => connected,
                };
                if current != last {
                    log_transition(current);
                    listener.on_connectivity_changed(current).await;
                    last = current;
                }
            }
            debug!("Network monitor stopped");
        });

        Self {
            cancellation_token,
            task,
        }
    }

    /// Stop the monitor without waiting for it.
    pub fn stop(&self) {
        self.cancellation_token.cancel();
    }

    /// Stop the monitor and wait for its task to finish.
    pub async fn shutdown(self) {
        self.cancellation_token.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Network monitor task failed");
        }
    }
}

fn log_transition(connected: bool) {
    if connected {
        info!("Internet connection restored");
    } else {
        warn!("Internet connection lost");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ManualConnectivity;
    use tokio::sync::mpsc;

    struct Recorder(mpsc::UnboundedSender<bool>);

    #[async_trait]
    impl ConnectivityListener for Recorder {
        async fn on_connectivity_changed(&self, connected: bool) {
            let _ = self.0.send(connected);
        }
    }

    #[tokio::test]
    async fn test_watch_forwards_only_transitions() {
        let connectivity = ManualConnectivity::new(true);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = NetworkMonitor::spawn_watch(Arc::new(Recorder(tx)), connectivity.subscribe());

        connectivity.set(false);
        assert_eq!(rx.recv().await, Some(false));
        connectivity.set(true);
        assert_eq!(rx.recv().await, Some(true));

        monitor.shutdown().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_watch_reports_initial_offline_state() {
        let connectivity = ManualConnectivity::new(false);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = NetworkMonitor::spawn_watch(Arc::new(Recorder(tx)), connectivity.subscribe());

        assert_eq!(rx.recv().await, Some(false));
        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_detects_changes() {
        let connectivity = Arc::new(ManualConnectivity::new(true));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = NetworkMonitor::spawn_polling(
            Arc::new(Recorder(tx)),
            connectivity.clone(),
            Duration::from_secs(5),
        );

        connectivity.set(false);
        assert_eq!(rx.recv().await, Some(false));
        connectivity.set(true);
        assert_eq!(rx.recv().await, Some(true));

        monitor.shutdown().await;
    }
}
