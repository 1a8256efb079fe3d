//! Progress extraction from the external tool's stdout.
//!
//! The tool prints lines such as `Progress: 45%`. A line without the marker
//! is not an error, it simply carries no update.

use std::sync::LazyLock;

use regex::Regex;

use crate::job::is_valid_progress;

/// Regex pattern matching the progress marker and capturing the percentage.
pub const PROGRESS_PATTERN: &str = r"Progress:\s*(\d+)%";

/// Compiled regex for progress extraction. Compiled once, reused forever.
static PROGRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(PROGRESS_PATTERN).expect("valid regex"));

/// Extract the raw percentage from a line, if the marker is present.
///
/// Returns the number as written, even when it is outside 0-100. Values too
/// large to fit in a `u32` are treated as absent.
pub fn extract_progress(line: &str) -> Option<u32> {
    PROGRESS_RE
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Extract a progress value that may be stored on a job (0-100 inclusive).
pub fn parse_progress(line: &str) -> Option<i16> {
    extract_progress(line)
        .and_then(|raw| i16::try_from(raw).ok())
        .filter(|p| is_valid_progress(*p))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
