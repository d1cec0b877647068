//! Durable job records in domain types.
//!
//! `JobStore` wraps the raw `job_repo` rows. Every status change goes
//! through a conditional update, so a stale writer in another process can
//! never move a job backwards.

use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::db::job_repo::{self, JobRow, JobUpdate};
use crate::db::{Database, DatabaseError};
use crate::job::{Counters, ErrorLog, Job, JobStatus};
use crate::reader::ParseOptions;

/// Everything needed to persist a new Pending job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: String,
    pub owner: Option<i64>,
    pub filepath: PathBuf,
    pub filename: String,
    pub options: ParseOptions,
    pub handler: Option<String>,
    pub dependencies: Vec<String>,
    pub display_id: Option<String>,
    pub total_data: u64,
}

#[derive(Clone)]
pub struct JobStore {
    db: Database,
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Persists a Pending job and returns it as stored.
    pub fn create(&self, job: &NewJob) -> Result<Job, DatabaseError> {
        let dependencies = serde_json::to_string(&job.dependencies).map_err(|e| {
            DatabaseError::Decode {
                column: "callback_model",
                reason: e.to_string(),
            }
        })?;

        let row = JobRow {
            job_id: job.job_id.clone(),
            filepath: job.filepath.to_string_lossy().into_owned(),
            filename: job.filename.clone(),
            owner_id: job.owner,
            total_data: to_column_int(job.total_data),
            total_processed: 0,
            total_skip_empty_row: 0,
            total_success: 0,
            total_failed: 0,
            total_inserted: 0,
            total_updated: 0,
            callback: job.handler.clone(),
            callback_model: Some(dependencies),
            error_message: None,
            display_id: job.display_id.clone(),
            skip_header: job.options.skip_header,
            delimiter: (job.options.delimiter as char).to_string(),
            enclosure: (job.options.enclosure as char).to_string(),
            escape_char: job.options.escape.map(|b| (b as char).to_string()),
            chunk_size: job.options.chunk_size as i64,
            status: JobStatus::Pending.code(),
            start_time: None,
            end_time: None,
            run_time: 0,
            created_at: timestamp(Utc::now()),
            updated_at: None,
        };

        job_repo::insert(&self.db, &row)?;
        decode(row)
    }

    pub fn fetch(&self, job_id: &str) -> Result<Option<Job>, DatabaseError> {
        job_repo::find_by_id(&self.db, job_id)?.map(decode).transpose()
    }

    /// All jobs of one owner, newest first.
    pub fn fetch_by_owner(&self, owner: i64) -> Result<Vec<Job>, DatabaseError> {
        job_repo::find_by_owner(&self.db, owner)?
            .into_iter()
            .map(decode)
            .collect()
    }

    pub fn count_by_status(&self, status: JobStatus) -> Result<u64, DatabaseError> {
        job_repo::count_by_status(&self.db, status.code())
    }

    /// Partial update. `updated_at` is always stamped.
    pub fn update(&self, job_id: &str, mut change: JobUpdate) -> Result<bool, DatabaseError> {
        change.updated_at = Some(timestamp(Utc::now()));
        job_repo::update(&self.db, job_id, &change)
    }

    /// Pending → Processing. False if the job was not Pending.
    pub fn mark_processing(
        &self,
        job_id: &str,
        start_time: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        self.update(
            job_id,
            JobUpdate {
                status: Some(JobStatus::Processing.code()),
                start_time: Some(timestamp(start_time)),
                require_status: vec![JobStatus::Pending.code()],
                ..Default::default()
            },
        )
    }

    /// Persists running counters. Only applies while Processing.
    pub fn checkpoint(
        &self,
        job_id: &str,
        counters: &Counters,
        errors: &ErrorLog,
    ) -> Result<bool, DatabaseError> {
        self.update(
            job_id,
            JobUpdate {
                counters: Some(*counters),
                error_message: Some(errors.to_column()),
                require_status: vec![JobStatus::Processing.code()],
                ..Default::default()
            },
        )
    }

    /// Processing → Completed with final counters.
    pub fn finish(
        &self,
        job_id: &str,
        counters: &Counters,
        errors: &ErrorLog,
        end_time: DateTime<Utc>,
        run_time: u64,
    ) -> Result<bool, DatabaseError> {
        self.update(
            job_id,
            JobUpdate {
                status: Some(JobStatus::Completed.code()),
                counters: Some(*counters),
                error_message: Some(errors.to_column()),
                end_time: Some(timestamp(end_time)),
                run_time: Some(to_column_int(run_time)),
                require_status: vec![JobStatus::Processing.code()],
                ..Default::default()
            },
        )
    }

    /// Pending or Processing → Failed. Counters are written when given.
    pub fn fail(
        &self,
        job_id: &str,
        errors: &ErrorLog,
        counters: Option<&Counters>,
        end_time: DateTime<Utc>,
        run_time: Option<u64>,
    ) -> Result<bool, DatabaseError> {
        self.update(
            job_id,
            JobUpdate {
                status: Some(JobStatus::Failed.code()),
                counters: counters.copied(),
                error_message: Some(errors.to_column()),
                end_time: Some(timestamp(end_time)),
                run_time: run_time.map(to_column_int),
                require_status: vec![JobStatus::Pending.code(), JobStatus::Processing.code()],
                ..Default::default()
            },
        )
    }

    /// Drops the connection; the next call reopens it.
    pub fn release_connection(&self) -> Result<(), DatabaseError> {
        self.db.release()
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn to_column_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn parse_time(column: &'static str, value: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Decode {
            column,
            reason: e.to_string(),
        })
}

fn parse_optional_time(
    column: &'static str,
    value: Option<&str>,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    value.map(|v| parse_time(column, v)).transpose()
}

fn decode_byte(column: &'static str, value: &str) -> Result<u8, DatabaseError> {
    ParseOptions::byte_from_str(column, value).map_err(|e| DatabaseError::Decode {
        column,
        reason: e.to_string(),
    })
}

fn decode(row: JobRow) -> Result<Job, DatabaseError> {
    let status = JobStatus::from_code(row.status).ok_or_else(|| DatabaseError::Decode {
        column: "status",
        reason: format!("unknown status code {}", row.status),
    })?;

    let dependencies = match row.callback_model.as_deref().map(str::trim) {
        None | Some("") => Vec::new(),
        Some(text) => serde_json::from_str(text).map_err(|e| DatabaseError::Decode {
            column: "callback_model",
            reason: e.to_string(),
        })?,
    };

    let options = ParseOptions {
        delimiter: decode_byte("delimiter", &row.delimiter)?,
        enclosure: decode_byte("enclosure", &row.enclosure)?,
        escape: row
            .escape_char
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| decode_byte("escape_char", s))
            .transpose()?,
        skip_header: row.skip_header,
        chunk_size: usize::try_from(row.chunk_size).unwrap_or(0),
    };

    Ok(Job {
        counters: Counters {
            total_processed: count(row.total_processed),
            total_skip_empty_row: count(row.total_skip_empty_row),
            total_success: count(row.total_success),
            total_failed: count(row.total_failed),
            total_inserted: count(row.total_inserted),
            total_updated: count(row.total_updated),
        },
        errors: ErrorLog::from_column(row.error_message.as_deref()),
        start_time: parse_optional_time("start_time", row.start_time.as_deref())?,
        end_time: parse_optional_time("end_time", row.end_time.as_deref())?,
        created_at: parse_time("created_at", &row.created_at)?,
        updated_at: parse_optional_time("updated_at", row.updated_at.as_deref())?,
        job_id: row.job_id,
        owner: row.owner_id,
        filepath: PathBuf::from(row.filepath),
        filename: row.filename,
        options,
        handler: row.callback.filter(|h| !h.is_empty()),
        dependencies,
        display_id: row.display_id,
        total_data: count(row.total_data),
        status,
        run_time: count(row.run_time),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> JobStore {
        JobStore::new(Database::open_in_memory().unwrap())
    }

    fn new_job(job_id: &str) -> NewJob {
        NewJob {
            job_id: job_id.to_string(),
            owner: Some(42),
            filepath: PathBuf::from("/data/customers.csv"),
            filename: "customers.csv".to_string(),
            options: ParseOptions {
                delimiter: b';',
                escape: Some(b'\\'),
                chunk_size: 3,
                ..Default::default()
            },
            handler: Some("echo".to_string()),
            dependencies: vec!["tenant".to_string(), "pricing".to_string()],
            display_id: Some("upload-7".to_string()),
            total_data: 10,
        }
    }

    #[test]
    fn test_create_and_fetch() {
        let store = store();
        let created = store.create(&new_job("csv_a")).unwrap();
        let fetched = store.fetch("csv_a").unwrap().unwrap();

        assert_eq!(fetched.status, JobStatus::Pending);
        assert_eq!(fetched.options.delimiter, b';');
        assert_eq!(fetched.options.escape, Some(b'\\'));
        assert_eq!(fetched.options.chunk_size, 3);
        assert_eq!(fetched.dependencies, vec!["tenant", "pricing"]);
        assert_eq!(fetched.total_data, 10);
        assert_eq!(fetched.counters, Counters::default());
        assert_eq!(fetched.created_at, created.created_at);
    }

    #[test]
    fn test_fetch_missing() {
        assert!(store().fetch("nope").unwrap().is_none());
    }

    #[test]
    fn test_fetch_by_owner() {
        let store = store();
        store.create(&new_job("csv_a")).unwrap();
        store.create(&new_job("csv_b")).unwrap();
        let mut other = new_job("csv_c");
        other.owner = None;
        store.create(&other).unwrap();

        assert_eq!(store.fetch_by_owner(42).unwrap().len(), 2);
        assert!(store.fetch_by_owner(7).unwrap().is_empty());
    }

    #[test]
    fn test_lifecycle_transitions() {
        let store = store();
        store.create(&new_job("csv_a")).unwrap();
        let counters = Counters {
            total_processed: 2,
            total_success: 2,
            ..Default::default()
        };

        // Checkpoints are ignored before the job is Processing.
        assert!(!store.checkpoint("csv_a", &counters, &ErrorLog::default()).unwrap());

        let start = Utc::now();
        assert!(store.mark_processing("csv_a", start).unwrap());
        assert!(!store.mark_processing("csv_a", start).unwrap());
        assert!(store.checkpoint("csv_a", &counters, &ErrorLog::default()).unwrap());

        let job = store.fetch("csv_a").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.counters.total_processed, 2);
        assert!(job.start_time.is_some());
        assert!(job.updated_at.is_some());

        assert!(store
            .finish("csv_a", &counters, &ErrorLog::default(), Utc::now(), 4)
            .unwrap());
        let job = store.fetch("csv_a").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.run_time, 4);

        // Terminal states are final.
        assert!(!store
            .fail("csv_a", &ErrorLog::fatal("late"), None, Utc::now(), None)
            .unwrap());
        assert_eq!(store.fetch("csv_a").unwrap().unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn test_fail_from_pending() {
        let store = store();
        store.create(&new_job("csv_a")).unwrap();
        assert!(store
            .fail("csv_a", &ErrorLog::fatal("CSV file not found"), None, Utc::now(), None)
            .unwrap());

        let job = store.fetch("csv_a").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.errors.fatal.as_deref(), Some("CSV file not found"));
        assert!(job.end_time.is_some());
        assert!(job.start_time.is_none());
    }

    #[test]
    fn test_count_by_status() {
        let store = store();
        store.create(&new_job("csv_a")).unwrap();
        store.create(&new_job("csv_b")).unwrap();
        store.mark_processing("csv_b", Utc::now()).unwrap();

        assert_eq!(store.count_by_status(JobStatus::Pending).unwrap(), 1);
        assert_eq!(store.count_by_status(JobStatus::Processing).unwrap(), 1);
    }

    #[test]
    fn test_decode_rejects_unknown_status() {
        let store = store();
        store.create(&new_job("csv_a")).unwrap();
        store
            .database()
            .with_conn(|conn| {
                conn.execute("UPDATE csv_process_jobs SET status = 9", [])?;
                Ok(())
            })
            .unwrap();

        assert!(matches!(
            store.fetch("csv_a"),
            Err(DatabaseError::Decode { column: "status", .. })
        ));
    }
}
