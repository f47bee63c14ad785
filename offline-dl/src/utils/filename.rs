//! Output filename derivation for downloaded titles.
//!
//! Titles come straight from the catalog and may contain anything: slashes in
//! "Season 1 / Episode 2", colons, emoji, CJK text. The destination filename
//! must be deterministic for a given title (the scheduler relies on it to
//! detect already-downloaded files) and valid on every platform.

use std::path::{Path, PathBuf};

/// Characters that are invalid in Windows filenames (and `/` everywhere).
const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Windows reserved filenames (case-insensitive)
const WINDOWS_RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Upper bound for the stem, leaving room for the extension within the
/// common 255-byte filename limit.
const MAX_STEM_BYTES: usize = 200;

/// Extension of every transcoded output file.
pub const OUTPUT_EXTENSION: &str = "mp4";

/// Sanitize a title for use as a filename stem.
///
/// Control and reserved characters become `_` (runs collapse to one),
/// leading/trailing spaces and dots are trimmed, reserved device names get a
/// `_` prefix and the result is cut to [`MAX_STEM_BYTES`] on a character
/// boundary. An empty result becomes `"unnamed"`.
///
/// ```
/// use offline_dl::utils::filename::sanitize_filename;
///
/// assert_eq!(sanitize_filename("Show: Episode 1"), "Show_ Episode 1");
/// assert_eq!(sanitize_filename(""), "unnamed");
/// ```
pub fn sanitize_filename(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut last_was_replacement = false;

    for c in input.chars() {
        if c.is_control() || INVALID_CHARS.contains(&c) {
            if !last_was_replacement {
                result.push('_');
                last_was_replacement = true;
            }
        } else {
            result.push(c);
            last_was_replacement = false;
        }
    }

    let trimmed = truncate_on_char_boundary(
        result.trim_matches(|c| c == ' ' || c == '.'),
        MAX_STEM_BYTES,
    )
    .trim_end_matches(|c| c == ' ' || c == '.');

    if trimmed.is_empty() {
        return "unnamed".to_string();
    }

    let upper = trimmed.to_uppercase();
    let is_reserved = WINDOWS_RESERVED_NAMES
        .iter()
        .any(|reserved| upper == *reserved || upper.starts_with(&format!("{reserved}.")));
    if is_reserved {
        return format!("_{trimmed}");
    }

    trimmed.to_string()
}

/// Destination path of the transcoded file for `title` inside `download_dir`.
pub fn destination_for(download_dir: &Path, title: &str) -> PathBuf {
    download_dir.join(format!("{}.{}", sanitize_filename(title), OUTPUT_EXTENSION))
}

fn truncate_on_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
