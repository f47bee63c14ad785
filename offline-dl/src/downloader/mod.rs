//! Download scheduling.
//!
//! The Download Manager is responsible for:
//! - Admitting queued tasks up to a concurrency limit, oldest first
//! - Starting and cancelling transcode processes
//! - Recording process outcomes on the task state machine
//! - Writing off running work when connectivity is lost

pub mod engine;

mod manager;

pub use engine::{ExitOutcome, FfmpegEngine, TranscodeEngine, TranscodeJob, TranscodeProgress};

pub use manager::{
    CONNECTION_LOST_ERROR, DownloadManager, NO_CONNECTION_ERROR, START_FAILED_ERROR,
};
