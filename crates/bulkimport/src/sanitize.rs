//! Helpers for keeping untrusted values out of file names and span fields.
//!
//! Job ids end up in lock file and log file names, so they are checked
//! before any path is derived from them.

use std::path::Path;

/// Maximum job id length (the `job_id` column is `VARCHAR(100)`).
pub const MAX_JOB_ID_LEN: usize = 100;

/// Returns only the filename component of a path (no directory).
///
/// Used in span fields so logs show the file name but not the directory.
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

/// Returns true if `job_id` is non-empty, at most [`MAX_JOB_ID_LEN`] bytes
/// and only contains `[A-Za-z0-9_.-]`, and is not a relative path component.
pub fn is_valid_job_id(job_id: &str) -> bool {
    !job_id.is_empty()
        && job_id.len() <= MAX_JOB_ID_LEN
        && job_id != "."
        && job_id != ".."
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}
