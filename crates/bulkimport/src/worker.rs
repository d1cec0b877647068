//! Worker process entry point.
//!
//! A worker runs the import engine for exactly one job id and exits. The
//! shipped `bulkimport-worker` binary calls [`run`] with the built-in
//! handlers; embedders build their own binary around it to register
//! theirs.

use std::sync::Arc;

use crate::config::ImporterConfig;
use crate::db::Database;
use crate::engine::{ImportEngine, RunOutcome};
use crate::error::EngineError;
use crate::handler::HandlerRegistry;
use crate::sanitize;
use crate::store::JobStore;
use crate::supervisor::lock;

/// How a worker run ended, mapped to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The job reached a terminal state, or there was nothing to do.
    Done,
    /// The job id is malformed or unknown.
    InvalidJob,
    /// Nothing could be recorded, e.g. the database failed to open.
    Bootstrap,
}

impl WorkerExit {
    pub fn code(self) -> i32 {
        match self {
            WorkerExit::Done => 0,
            WorkerExit::Bootstrap => 1,
            WorkerExit::InvalidJob => 2,
        }
    }
}

pub fn run(job_id: &str, config: &ImporterConfig, registry: HandlerRegistry) -> WorkerExit {
    if !sanitize::is_valid_job_id(job_id) {
        log::error!("Refusing to run invalid job id '{}'", job_id);
        return WorkerExit::InvalidJob;
    }

    let db = match Database::open(&config.database_path) {
        Ok(db) => db,
        Err(e) => {
            log::error!(
                "Cannot open job database {}: {}",
                sanitize::redact_path(&config.database_path),
                e
            );
            return WorkerExit::Bootstrap;
        }
    };

    let engine = ImportEngine::new(
        JobStore::new(db),
        Arc::new(registry),
        Arc::new(config.clone()),
    );
    log::debug!("Worker pid {} starting job {}", std::process::id(), job_id);

    let outcome = engine.run(job_id);
    release_handed_over_lock(config, job_id);

    match outcome {
        Ok(RunOutcome::NotFound) => WorkerExit::InvalidJob,
        Ok(outcome) => {
            log::debug!("Worker for job {} finished: {:?}", job_id, outcome);
            WorkerExit::Done
        }
        Err(EngineError::InvalidJobId(_)) => WorkerExit::InvalidJob,
        Err(e) => {
            log::error!("Worker for job {} could not record its run: {}", job_id, e);
            WorkerExit::Bootstrap
        }
    }
}

/// The supervisor hands the job's lock to this process before the engine
/// looks at the job. A run that skipped the job never took the lock, so it
/// is cleared here.
fn release_handed_over_lock(config: &ImporterConfig, job_id: &str) {
    let path = lock::lock_path(&config.lock_dir, job_id);
    if let Err(e) = lock::release_if_owned(&path, std::process::id()) {
        log::warn!("Failed to clear lock for job {}: {}", job_id, e);
    }
}
