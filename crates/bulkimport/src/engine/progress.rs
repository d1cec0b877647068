//! Remaining-time and percent-complete estimates for pollers.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::job::Job;

/// Estimated remaining duration, floored to whole seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Eta {
    pub hours: u64,
    pub minutes: u64,
    pub seconds: u64,
}

impl Eta {
    pub fn from_seconds(total: u64) -> Self {
        Self {
            hours: total / 3600,
            minutes: (total % 3600) / 60,
            seconds: total % 60,
        }
    }

    pub fn total_seconds(&self) -> u64 {
        self.hours * 3600 + self.minutes * 60 + self.seconds
    }

    pub fn is_zero(&self) -> bool {
        self.total_seconds() == 0
    }
}

/// Remaining time from observed throughput since `start_time`.
///
/// Zero when nothing was processed yet, when the job is finished, or when
/// no time has elapsed.
pub fn estimate(job: &Job, now: DateTime<Utc>) -> Eta {
    if job.counters.total_processed == 0 || job.status.is_terminal() {
        return Eta::default();
    }
    let Some(start) = job.start_time else {
        return Eta::default();
    };
    let elapsed = (now - start).num_milliseconds() as f64 / 1000.0;
    remaining(job.counters.total_processed, job.total_data, elapsed)
}

fn remaining(processed: u64, total: u64, elapsed_secs: f64) -> Eta {
    if processed == 0 || elapsed_secs <= 0.0 {
        return Eta::default();
    }
    let rate = processed as f64 / elapsed_secs;
    if rate <= 0.0 {
        return Eta::default();
    }
    let left = total.saturating_sub(processed) as f64;
    Eta::from_seconds((left / rate).floor() as u64)
}

/// `round(100 * processed / total, 2)`. A zero total reads as 100, since
/// there is nothing left to process.
pub fn percent_complete(processed: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    if processed == 0 {
        return 0.0;
    }
    let percent = 100.0 * processed as f64 / total as f64;
    (percent * 100.0).round() / 100.0
}
