//! Utility modules for transcode engines.

mod ffmpeg_output;
mod process_runner;

pub use ffmpeg_output::{
    STDERR_TAIL_LINES, drain_stderr, parse_progress, parse_time, summarize_failure,
};
pub use process_runner::{WaitResult, spawn_process_waiter};
