//! Library-wide error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Library-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error while {op} {}: {source}", path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No internet connection available")]
    NoConnection,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Task document {} is in use by another process", path.display())]
    DocumentInUse { path: PathBuf },

    #[error("Failed to start process: {0}")]
    ProcessStart(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_path_display_includes_context() {
        let err = Error::io_path(
            "writing",
            Path::new("/tmp/tasks.json"),
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("writing"));
        assert!(msg.contains("/tmp/tasks.json"));
        assert!(msg.contains("denied"));
    }
}
