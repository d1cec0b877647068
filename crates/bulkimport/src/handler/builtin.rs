//! Handlers shipped with the worker binary, used for smoke tests and for
//! exercising real worker processes.

use std::sync::OnceLock;
use std::time::Duration;

use super::{Dependencies, HandlerRegistry, RowResult};
use crate::error::HandlerError;
use crate::reader::Row;

pub const ECHO: &str = "echo";
pub const SLOW: &str = "slow";
pub const REJECT_EMPTY_FIRST: &str = "reject-empty-first";

/// Per-row delay of the `slow` handler, in milliseconds.
pub const ENV_SLOW_ROW_MS: &str = "BULKIMPORT_SLOW_ROW_MS";
const DEFAULT_SLOW_ROW_MS: u64 = 50;

pub fn register(registry: &mut HandlerRegistry) {
    registry
        .register_handler(ECHO, echo)
        .register_handler(SLOW, slow)
        .register_handler(REJECT_EMPTY_FIRST, reject_empty_first);
}

/// Accepts every row without side effects.
pub fn echo(row: &Row, index: u64, _deps: &Dependencies) -> Result<RowResult, HandlerError> {
    log::trace!("row {} ({} fields)", index, row.len());
    Ok(RowResult::ok())
}

/// Sleeps before accepting the row.
pub fn slow(_row: &Row, _index: u64, _deps: &Dependencies) -> Result<RowResult, HandlerError> {
    std::thread::sleep(slow_row_delay());
    Ok(RowResult::ok())
}

fn slow_row_delay() -> Duration {
    static DELAY: OnceLock<Duration> = OnceLock::new();
    *DELAY.get_or_init(|| {
        let millis = std::env::var(ENV_SLOW_ROW_MS)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_SLOW_ROW_MS);
        Duration::from_millis(millis)
    })
}

/// Rejects rows whose first field is blank with status 422; other rows
/// count as created.
pub fn reject_empty_first(
    row: &Row,
    _index: u64,
    _deps: &Dependencies,
) -> Result<RowResult, HandlerError> {
    match row.get(0).map(str::trim) {
        Some(first) if !first.is_empty() => Ok(RowResult::created()),
        _ => Ok(RowResult::rejected(422, "first column is empty")),
    }
}
