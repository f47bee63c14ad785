//! Persistent task store.
//!
//! The single source of truth for download task state. Everything else reads
//! tasks from here and writes them back through here.

mod events;
mod lock;
mod task;
mod task_store;

pub use events::{Subscription, TaskEvent};
pub use lock::DocumentLock;
pub use task::{DownloadTask, ProcessHandle, TaskStatus, task_id_for};
pub use task_store::{FILE_MISSING_ERROR, TaskStore};
