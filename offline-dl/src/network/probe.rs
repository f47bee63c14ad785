//! Live connectivity probes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use crate::Result;

/// Answers whether the device currently has a working internet connection.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn is_connected(&self) -> bool;
}

/// Probe that issues a `HEAD` request against a well-known endpoint.
///
/// Any HTTP response counts as connected; only transport failures
/// (DNS, connect, timeout) count as offline.
pub struct HttpConnectivityProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpConnectivityProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| crate::Error::Other(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ConnectivityProbe for HttpConnectivityProbe {
    async fn is_connected(&self) -> bool {
        match self.client.head(&self.url).send().await {
            Ok(response) => {
                debug!(url = %self.url, status = %response.status(), "Connectivity probe succeeded");
                true
            }
            Err(e) => {
                debug!(url = %self.url, error = %e, "Connectivity probe failed");
                false
            }
        }
    }
}

/// Connectivity state pushed from outside (a platform callback, a test).
///
/// Acts both as a probe and as the source of a `watch` channel a
/// [`NetworkMonitor`](super::NetworkMonitor) can follow.
pub struct ManualConnectivity {
    connected: AtomicBool,
    tx: watch::Sender<bool>,
}

impl ManualConnectivity {
    pub fn new(connected: bool) -> Self {
        let (tx, _) = watch::channel(connected);
        Self {
            connected: AtomicBool::new(connected),
            tx,
        }
    }

    /// Record a new state. Subscribers are only woken on an actual change.
    pub fn set(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        self.tx.send_if_modified(|current| {
            let changed = *current != connected;
            *current = connected;
            changed
        });
    }

    pub fn get(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ManualConnectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl ConnectivityProbe for ManualConnectivity {
    async fn is_connected(&self) -> bool {
        self.get()
    }
}
