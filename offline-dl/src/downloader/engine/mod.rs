//! Transcode engine abstraction.
//!
//! This module defines the `TranscodeEngine` trait the download manager
//! drives, and the ffmpeg implementation used in production.

mod ffmpeg;
mod traits;
pub mod utils;

pub use ffmpeg::FfmpegEngine;
pub use traits::{
    ExitOutcome, TranscodeEngine, TranscodeJob, TranscodeProcess, TranscodeProgress,
};
