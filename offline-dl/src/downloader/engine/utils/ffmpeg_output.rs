//! FFmpeg stderr handling.
//!
//! FFmpeg rewrites its progress line with `\r`, so stderr is split on both
//! `\r` and `\n`. Progress records are parsed and forwarded; everything else
//! is kept in a short tail used to explain failures.

use std::collections::VecDeque;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::downloader::engine::TranscodeProgress;

/// Number of diagnostic lines kept for failure messages.
pub const STDERR_TAIL_LINES: usize = 8;

/// Splits a byte stream into trimmed, non-empty text records.
struct RecordSplitter<R> {
    reader: R,
    pending: Vec<u8>,
    scratch: [u8; 4096],
    eof: bool,
}

impl<R: AsyncRead + Unpin> RecordSplitter<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            pending: Vec::new(),
            scratch: [0u8; 4096],
            eof: false,
        }
    }

    async fn next_record(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(idx) = self.pending.iter().position(|&b| b == b'\n' || b == b'\r') {
                let record: Vec<u8> = self.pending.drain(..=idx).collect();
                let text = String::from_utf8_lossy(&record).trim().to_string();
                if text.is_empty() {
                    continue;
                }
                return Ok(Some(text));
            }

            if self.eof {
                let text = String::from_utf8_lossy(&self.pending).trim().to_string();
                self.pending.clear();
                return Ok((!text.is_empty()).then_some(text));
            }

            let n = self.reader.read(&mut self.scratch).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.pending.extend_from_slice(&self.scratch[..n]);
            }
        }
    }
}

/// Drain `stderr` to the end.
///
/// Progress goes to `progress_tx` (dropped if the receiver is busy); the last
/// [`STDERR_TAIL_LINES`] other records are returned.
pub async fn drain_stderr<R>(
    stderr: R,
    progress_tx: mpsc::Sender<TranscodeProgress>,
    task_id: &str,
) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut splitter = RecordSplitter::new(stderr);
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);

    loop {
        match splitter.next_record().await {
            Ok(Some(record)) => {
                if let Some(progress) = parse_progress(&record) {
                    trace!(task_id = %task_id, ?progress, "ffmpeg progress");
                    let _ = progress_tx.try_send(progress);
                    continue;
                }
                debug!(task_id = %task_id, "ffmpeg: {}", record);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(record);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(task_id = %task_id, error = %e, "Error reading ffmpeg output");
                break;
            }
        }
    }

    tail.into()
}

/// Pick the most useful line of a stderr tail for a user-facing message.
pub fn summarize_failure(tail: &[String]) -> Option<&str> {
    tail.iter()
        .rev()
        .find(|line| {
            let lower = line.to_ascii_lowercase();
            lower.contains("error")
                || lower.contains("failed")
                || lower.contains("invalid")
                || lower.contains("not found")
                || lower.contains("denied")
        })
        .or_else(|| tail.last())
        .map(String::as_str)
}

/// Parse time string in HH:MM:SS.ms format to seconds.
pub fn parse_time(time_str: &str) -> Option<f64> {
    let mut parts = time_str.split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Value following `key=` up to the next space, skipping padding after `=`.
fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)? + key.len();
    let rest = line[start..].trim_start();
    let end = rest.find(' ').unwrap_or(rest.len());
    Some(&rest[..end])
}

/// Parse `size=  1024kB` / `size= 1024KiB` into bytes.
fn parse_size(line: &str) -> Option<u64> {
    let raw = field(line, "size=")?;
    let digits_end = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let value: u64 = raw[..digits_end].parse().ok()?;
    let multiplier = match raw[digits_end..].to_ascii_lowercase().as_str() {
        "kb" | "kib" => 1024,
        "mb" | "mib" => 1024 * 1024,
        "b" | "" => 1,
        _ => return None,
    };
    value.checked_mul(multiplier)
}

fn parse_bitrate_kbps(line: &str) -> Option<f64> {
    field(line, "bitrate=")?.strip_suffix("kbits/s")?.parse().ok()
}

fn parse_speed(line: &str) -> Option<f64> {
    field(line, "speed=")?.strip_suffix('x')?.parse().ok()
}

/// Parse an FFmpeg progress record:
/// `frame=X fps=X q=X size=XkB time=HH:MM:SS.ms bitrate=Xkbits/s speed=Xx`.
///
/// Requires `time=` plus `size=` or `frame=` so unrelated lines are not taken
/// for progress.
pub fn parse_progress(line: &str) -> Option<TranscodeProgress> {
    if !line.contains("time=") || !(line.contains("size=") || line.contains("frame=")) {
        return None;
    }

    Some(TranscodeProgress {
        bytes_written: parse_size(line).unwrap_or(0),
        media_time_secs: field(line, "time=").and_then(parse_time).unwrap_or(0.0),
        bitrate_kbps: parse_bitrate_kbps(line),
        speed: parse_speed(line),
    })
}
