//! Cross-process ownership of the task document.
//!
//! Process handles only live in memory, so a second process editing the
//! document while another one runs downloads would act on stale state and
//! have its writes overwritten. Mutating commands take this lock first.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use crate::{Error, Result};

/// Exclusive advisory lock on `<document>.lock`.
///
/// Released when dropped, and by the OS if the holder dies.
#[derive(Debug)]
pub struct DocumentLock {
    _file: File,
    path: PathBuf,
}

impl DocumentLock {
    /// Take the lock for the document at `store_path` without waiting.
    ///
    /// Fails with [`Error::DocumentInUse`] if another process holds it.
    pub fn try_acquire(store_path: &Path) -> Result<Self> {
        let path = lock_path(store_path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io_path("creating directory for", &path, e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::io_path("opening", &path, e))?;
        if file.try_lock_exclusive().is_err() {
            return Err(Error::DocumentInUse {
                path: store_path.to_path_buf(),
            });
        }

        debug!(path = %path.display(), "Acquired task document lock");
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn lock_path(store_path: &Path) -> PathBuf {
    let mut name = store_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    store_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_is_exclusive_until_dropped() {
        let temp = TempDir::new().unwrap();
        let store_path = temp.path().join("downloads").join("tasks.json");

        let held = DocumentLock::try_acquire(&store_path).unwrap();
        assert_eq!(held.path(), temp.path().join("downloads").join("tasks.json.lock"));

        let err = DocumentLock::try_acquire(&store_path).unwrap_err();
        assert!(matches!(err, Error::DocumentInUse { ref path } if *path == store_path));

        drop(held);
        assert!(DocumentLock::try_acquire(&store_path).is_ok());
    }
}
