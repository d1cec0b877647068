//! Job repository: row-level operations on the `csv_process_jobs` table.

use rusqlite::types::ToSql;
use rusqlite::{params, Row};

use super::{Database, DatabaseError};
use crate::job::Counters;

/// A raw job row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub job_id: String,
    pub filepath: String,
    pub filename: String,
    pub owner_id: Option<i64>,
    pub total_data: i64,
    pub total_processed: i64,
    pub total_skip_empty_row: i64,
    pub total_success: i64,
    pub total_failed: i64,
    pub total_inserted: i64,
    pub total_updated: i64,
    /// Registered handler name.
    pub callback: Option<String>,
    /// JSON array of dependency names.
    pub callback_model: Option<String>,
    pub error_message: Option<String>,
    pub display_id: Option<String>,
    pub skip_header: bool,
    pub delimiter: String,
    pub enclosure: String,
    pub escape_char: Option<String>,
    pub chunk_size: i64,
    pub status: i64,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub run_time: i64,
    pub created_at: String,
    pub updated_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            job_id: row.get("job_id")?,
            filepath: row.get("filepath")?,
            filename: row.get("filename")?,
            owner_id: row.get("owner_id")?,
            total_data: row.get("total_data")?,
            total_processed: row.get("total_processed")?,
            total_skip_empty_row: row.get("total_skip_empty_row")?,
            total_success: row.get("total_success")?,
            total_failed: row.get("total_failed")?,
            total_inserted: row.get("total_inserted")?,
            total_updated: row.get("total_updated")?,
            callback: row.get("callback")?,
            callback_model: row.get("callback_model")?,
            error_message: row.get("error_message")?,
            display_id: row.get("display_id")?,
            skip_header: row.get("skip_header")?,
            delimiter: row.get("delimiter")?,
            enclosure: row.get("enclosure")?,
            escape_char: row.get("escape_char")?,
            chunk_size: row.get("chunk_size")?,
            status: row.get("status")?,
            start_time: row.get("start_time")?,
            end_time: row.get("end_time")?,
            run_time: row.get("run_time")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// A partial update. Only `Some` fields are written.
///
/// When `require_status` is non-empty the row is only touched if its
/// current status is one of the listed codes, which makes status
/// transitions safe against concurrent writers.
#[derive(Debug, Default, Clone)]
pub struct JobUpdate {
    pub status: Option<i64>,
    pub counters: Option<Counters>,
    pub error_message: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub run_time: Option<i64>,
    pub updated_at: Option<String>,
    pub require_status: Vec<i64>,
}

/// Inserts a new job row and returns its surrogate id.
pub fn insert(db: &Database, job: &JobRow) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO csv_process_jobs (job_id, filepath, filename, owner_id, total_data,
             total_processed, total_skip_empty_row, total_success, total_failed, total_inserted,
             total_updated, callback, callback_model, error_message, display_id, skip_header,
             delimiter, enclosure, escape_char, chunk_size, status, start_time, end_time,
             run_time, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
             ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)",
            params![
                job.job_id,
                job.filepath,
                job.filename,
                job.owner_id,
                job.total_data,
                job.total_processed,
                job.total_skip_empty_row,
                job.total_success,
                job.total_failed,
                job.total_inserted,
                job.total_updated,
                job.callback,
                job.callback_model,
                job.error_message,
                job.display_id,
                job.skip_header,
                job.delimiter,
                job.enclosure,
                job.escape_char,
                job.chunk_size,
                job.status,
                job.start_time,
                job.end_time,
                job.run_time,
                job.created_at,
                job.updated_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    })
}

/// Finds a job by its public id.
pub fn find_by_id(db: &Database, job_id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM csv_process_jobs WHERE job_id = ?1")?;
        let mut rows = stmt.query_map(params![job_id], JobRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Lists an owner's jobs, newest first.
pub fn find_by_owner(db: &Database, owner_id: i64) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM csv_process_jobs WHERE owner_id = ?1
             ORDER BY created_at DESC, id DESC",
        )?;
        let rows = stmt
            .query_map(params![owner_id], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Counts jobs with the given status code.
pub fn count_by_status(db: &Database, status: i64) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM csv_process_jobs WHERE status = ?1",
            params![status],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Applies a partial update. Returns whether a row was changed.
pub fn update(db: &Database, job_id: &str, change: &JobUpdate) -> Result<bool, DatabaseError> {
    let mut assignments: Vec<&'static str> = Vec::new();
    let mut values: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(status) = change.status {
        assignments.push("status");
        values.push(Box::new(status));
    }
    if let Some(counters) = change.counters {
        for (column, value) in [
            ("total_processed", counters.total_processed),
            ("total_skip_empty_row", counters.total_skip_empty_row),
            ("total_success", counters.total_success),
            ("total_failed", counters.total_failed),
            ("total_inserted", counters.total_inserted),
            ("total_updated", counters.total_updated),
        ] {
            assignments.push(column);
            values.push(Box::new(value as i64));
        }
    }
    if let Some(ref message) = change.error_message {
        assignments.push("error_message");
        values.push(Box::new(message.clone()));
    }
    if let Some(ref start_time) = change.start_time {
        assignments.push("start_time");
        values.push(Box::new(start_time.clone()));
    }
    if let Some(ref end_time) = change.end_time {
        assignments.push("end_time");
        values.push(Box::new(end_time.clone()));
    }
    if let Some(run_time) = change.run_time {
        assignments.push("run_time");
        values.push(Box::new(run_time));
    }
    if let Some(ref updated_at) = change.updated_at {
        assignments.push("updated_at");
        values.push(Box::new(updated_at.clone()));
    }

    if assignments.is_empty() {
        return Ok(false);
    }

    let set_clause = assignments
        .iter()
        .enumerate()
        .map(|(i, column)| format!("{} = ?{}", column, i + 1))
        .collect::<Vec<_>>()
        .join(", ");

    values.push(Box::new(job_id.to_string()));
    let mut sql = format!(
        "UPDATE csv_process_jobs SET {} WHERE job_id = ?{}",
        set_clause,
        values.len()
    );

    if !change.require_status.is_empty() {
        let placeholders = change
            .require_status
            .iter()
            .map(|status| {
                values.push(Box::new(*status));
                format!("?{}", values.len())
            })
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(" AND status IN ({})", placeholders));
    }

    db.with_conn(|conn| {
        let params_ref: Vec<&dyn ToSql> = values.iter().map(|p| p.as_ref()).collect();
        let changed = conn.execute(&sql, params_ref.as_slice())?;
        Ok(changed > 0)
    })
}
