//! Import job data model.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::progress::{estimate, percent_complete, Eta};
use crate::reader::ParseOptions;

/// Lifecycle status of a job. Transitions only move forward:
/// `Pending → Processing → {Completed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Numeric code persisted in the `status` column.
    pub fn code(self) -> i64 {
        match self {
            JobStatus::Pending => 1,
            JobStatus::Processing => 2,
            JobStatus::Completed => 3,
            JobStatus::Failed => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(JobStatus::Pending),
            2 => Some(JobStatus::Processing),
            3 => Some(JobStatus::Completed),
            4 => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "Pending"),
            JobStatus::Processing => write!(f, "Processing"),
            JobStatus::Completed => write!(f, "Completed"),
            JobStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Running totals for one job. Owned by the engine for the duration of a
/// run and snapshotted into the store at every checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub total_processed: u64,
    pub total_skip_empty_row: u64,
    pub total_success: u64,
    pub total_failed: u64,
    pub total_inserted: u64,
    pub total_updated: u64,
}

impl Counters {
    /// `processed = success + failed` and `inserted + updated <= success`.
    pub fn is_consistent(&self) -> bool {
        self.total_processed == self.total_success + self.total_failed
            && self.total_inserted + self.total_updated <= self.total_success
    }

    /// True if no counter in `self` is below its value in `previous`.
    pub fn dominates(&self, previous: &Counters) -> bool {
        self.total_processed >= previous.total_processed
            && self.total_skip_empty_row >= previous.total_skip_empty_row
            && self.total_success >= previous.total_success
            && self.total_failed >= previous.total_failed
            && self.total_inserted >= previous.total_inserted
            && self.total_updated >= previous.total_updated
    }
}

/// Diagnostics persisted in the `error_message` column.
///
/// `data` holds handler-reported business errors, `system` holds errors
/// raised while handling a row. `fatal` is the message that ended the job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLog {
    #[serde(default)]
    pub data: Vec<String>,
    #[serde(default)]
    pub system: Vec<String>,
    /// Messages discarded once a bucket reached its limit.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub dropped: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal: Option<String>,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl ErrorLog {
    /// A log carrying only a job-ending message.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            fatal: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn push_data(&mut self, message: String, limit: usize) {
        if self.data.len() < limit {
            self.data.push(message);
        } else {
            self.dropped += 1;
        }
    }

    pub fn push_system(&mut self, message: String, limit: usize) {
        if self.system.len() < limit {
            self.system.push(message);
        } else {
            self.dropped += 1;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.system.is_empty() && self.fatal.is_none() && self.dropped == 0
    }

    /// Serialized form for the `error_message` column.
    pub fn to_column(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parses the `error_message` column. Text that is not a serialized
    /// log is kept as the fatal message.
    pub fn from_column(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("") => Self::default(),
            Some(text) => serde_json::from_str(text).unwrap_or_else(|_| Self::fatal(text)),
        }
    }
}

/// One persisted import job, decoded from its database row.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub job_id: String,
    pub owner: Option<i64>,
    pub filepath: PathBuf,
    pub filename: String,
    pub options: ParseOptions,
    /// Name of the registered row handler.
    pub handler: Option<String>,
    /// Names of the dependencies resolved before each chunk.
    pub dependencies: Vec<String>,
    pub display_id: Option<String>,
    pub total_data: u64,
    pub counters: Counters,
    pub errors: ErrorLog,
    pub status: JobStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds between `start_time` and `end_time`.
    pub run_time: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Read-only projection of a job for pollers, with computed progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<i64>,
    pub status: JobStatus,
    pub total_data: u64,
    pub total_process: u64,
    pub total_skip_empty_row: u64,
    pub total_success: u64,
    pub total_failed: u64,
    pub total_inserted: u64,
    pub total_updated: u64,
    pub error_message: ErrorLog,
    pub estimate_time: Eta,
    pub percent_complete: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub run_time: u64,
    pub created_at: DateTime<Utc>,
}

impl JobSnapshot {
    pub fn from_job(job: &Job, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job.job_id.clone(),
            file_name: job.filename.clone(),
            display_id: job.display_id.clone(),
            owner: job.owner,
            status: job.status,
            total_data: job.total_data,
            total_process: job.counters.total_processed,
            total_skip_empty_row: job.counters.total_skip_empty_row,
            total_success: job.counters.total_success,
            total_failed: job.counters.total_failed,
            total_inserted: job.counters.total_inserted,
            total_updated: job.counters.total_updated,
            error_message: job.errors.clone(),
            estimate_time: estimate(job, now),
            percent_complete: percent_complete(job.counters.total_processed, job.total_data),
            start_time: job.start_time,
            end_time: job.end_time,
            run_time: job.run_time,
            created_at: job.created_at,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(JobStatus::from_code(0), None);
        assert_eq!(JobStatus::from_code(9), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_counters_consistency() {
        let mut counters = Counters {
            total_processed: 4,
            total_success: 3,
            total_failed: 1,
            total_inserted: 2,
            total_updated: 1,
            ..Default::default()
        };
        assert!(counters.is_consistent());

        counters.total_updated = 2;
        assert!(!counters.is_consistent());
    }

    #[test]
    fn test_counters_dominates() {
        let earlier = Counters {
            total_processed: 2,
            total_success: 2,
            ..Default::default()
        };
        let later = Counters {
            total_processed: 5,
            total_success: 4,
            total_failed: 1,
            ..Default::default()
        };
        assert!(later.dominates(&earlier));
        assert!(!earlier.dominates(&later));
    }

    #[test]
    fn test_error_log_bucket_limit() {
        let mut log = ErrorLog::default();
        log.push_data("a".to_string(), 2);
        log.push_data("b".to_string(), 2);
        log.push_data("c".to_string(), 2);
        log.push_system("boom".to_string(), 2);
        assert_eq!(log.data, vec!["a", "b"]);
        assert_eq!(log.system, vec!["boom"]);
        assert_eq!(log.dropped, 1);
    }

    #[test]
    fn test_error_log_column_round_trip() {
        let mut log = ErrorLog::default();
        log.push_data("Row 2: missing email".to_string(), 10);
        log.push_system("Row 3: handler panicked".to_string(), 10);

        let parsed = ErrorLog::from_column(Some(&log.to_column()));
        assert_eq!(parsed, log);
    }

    #[test]
    fn test_error_log_plain_text_column_becomes_fatal() {
        let parsed = ErrorLog::from_column(Some("CSV file not found"));
        assert_eq!(parsed.fatal.as_deref(), Some("CSV file not found"));
        assert!(parsed.data.is_empty());
    }

    #[test]
    fn test_error_log_empty_column() {
        assert!(ErrorLog::from_column(None).is_empty());
        assert!(ErrorLog::from_column(Some("  ")).is_empty());
    }

    #[test]
    fn test_empty_log_serializes_both_buckets() {
        let json = ErrorLog::default().to_column();
        assert_eq!(json, r#"{"data":[],"system":[]}"#);
    }
}
