//! Download manager configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Prefix shared by every environment variable read by [`DownloadManagerConfig::from_env`].
pub const ENV_PREFIX: &str = "OFFLINE_DL_";

/// Configuration for the Download Manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadManagerConfig {
    /// Maximum number of transcodes running at once.
    pub max_concurrent: usize,
    /// Directory finished files are written to.
    pub download_dir: PathBuf,
    /// Location of the durable task document.
    pub store_path: PathBuf,
    /// ffmpeg binary, looked up on `PATH` when not absolute.
    pub ffmpeg_path: String,
    /// Endpoint used by the HTTP connectivity probe.
    pub probe_url: String,
    pub probe_timeout_secs: u64,
    /// How often the connectivity monitor polls the probe.
    pub probe_interval_secs: u64,
}

impl Default for DownloadManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            download_dir: PathBuf::from("./downloads"),
            store_path: PathBuf::from("./downloads/tasks.json"),
            ffmpeg_path: "ffmpeg".to_string(),
            probe_url: "https://www.gstatic.com/generate_204".to_string(),
            probe_timeout_secs: 5,
            probe_interval_secs: 10,
        }
    }
}

impl DownloadManagerConfig {
    /// Load config from `.env` and the process environment, falling back to defaults.
    ///
    /// Supported env vars:
    /// - `OFFLINE_DL_MAX_CONCURRENT` (e.g. "3")
    /// - `OFFLINE_DL_DOWNLOAD_DIR`
    /// - `OFFLINE_DL_STORE_PATH` (defaults to `tasks.json` inside the download dir)
    /// - `OFFLINE_DL_FFMPEG_PATH`, falling back to `FFMPEG_PATH`
    /// - `OFFLINE_DL_PROBE_URL`
    /// - `OFFLINE_DL_PROBE_TIMEOUT_SECS`
    /// - `OFFLINE_DL_PROBE_INTERVAL_SECS`
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let mut config = Self::default();

        if let Some(value) = var("MAX_CONCURRENT") {
            config.max_concurrent = parse_var("MAX_CONCURRENT", &value)?;
        }

        if let Some(dir) = var("DOWNLOAD_DIR") {
            config.download_dir = PathBuf::from(dir);
        }
        config.store_path = match var("STORE_PATH") {
            Some(path) => PathBuf::from(path),
            None => config.download_dir.join("tasks.json"),
        };

        if let Some(path) = var("FFMPEG_PATH").or_else(|| {
            lookup("FFMPEG_PATH")
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        }) {
            config.ffmpeg_path = path;
        }

        if let Some(url) = var("PROBE_URL") {
            config.probe_url = url;
        }
        if let Some(value) = var("PROBE_TIMEOUT_SECS") {
            config.probe_timeout_secs = parse_var("PROBE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = var("PROBE_INTERVAL_SECS") {
            config.probe_interval_secs = parse_var("PROBE_INTERVAL_SECS", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::config("max_concurrent must be at least 1"));
        }
        if self.probe_timeout_secs == 0 {
            return Err(Error::config("probe_timeout_secs must be at least 1"));
        }
        if self.probe_interval_secs == 0 {
            return Err(Error::config("probe_interval_secs must be at least 1"));
        }
        if self.ffmpeg_path.trim().is_empty() {
            return Err(Error::config("ffmpeg_path must not be empty"));
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        Error::config(format!(
            "invalid value for {ENV_PREFIX}{name}: {value:?}"
        ))
    })
}
