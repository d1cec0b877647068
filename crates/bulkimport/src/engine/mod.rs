//! The chunked import loop.
//!
//! One [`ImportEngine::run`] takes a Pending job through Processing to a
//! terminal status. Rows are handed to the job's handler in file order,
//! counters live in one [`Counters`] value owned by the run and are
//! checkpointed to the store after every chunk.

pub mod limits;
pub mod progress;

pub use progress::{estimate, percent_complete, Eta};

use std::io::Read;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug_span, info_span};

use crate::config::ImporterConfig;
use crate::db::DatabaseError;
use crate::error::{EngineError, ReaderError};
use crate::handler::{Dependencies, HandlerRegistry, RowAction, RowInvoker, RowOutcome};
use crate::job::{Counters, ErrorLog, Job, JobStatus};
use crate::reader::{CsvSource, OpenRetry, Row};
use crate::sanitize;
use crate::store::JobStore;
use crate::supervisor::lock::JobLock;
use crate::supervisor::platform::{self, ProcessControl};

use self::limits::LimitGuard;

/// Why a run did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The job was not Pending.
    NotPending(JobStatus),
    /// Another process, or another run in this one, holds the lock.
    Locked,
}

/// How a call to [`ImportEngine::run`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    NotFound,
    Skipped(SkipReason),
    Completed(Counters),
    /// The job was recorded as Failed with this message.
    Failed(String),
    /// The job left Processing while this run was still working on it,
    /// typically because it was killed.
    Interrupted,
}

impl RunOutcome {
    /// True when the persisted job reached a terminal status in this run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunOutcome::Completed(_) | RunOutcome::Failed(_))
    }
}

/// Errors that end a run after it entered Processing.
enum Fatal {
    Reader(ReaderError),
    Database(DatabaseError),
    /// A conditional write found the job no longer Processing.
    Interrupted,
}

impl From<ReaderError> for Fatal {
    fn from(e: ReaderError) -> Self {
        Fatal::Reader(e)
    }
}

impl From<DatabaseError> for Fatal {
    fn from(e: DatabaseError) -> Self {
        Fatal::Database(e)
    }
}

/// Mutable state of one run.
struct RunState {
    counters: Counters,
    errors: ErrorLog,
    /// 1-based index of the last content row handed out.
    index: u64,
    /// Counters changed since the last checkpoint.
    dirty: bool,
}

pub struct ImportEngine {
    store: JobStore,
    registry: Arc<HandlerRegistry>,
    config: Arc<ImporterConfig>,
    control: Arc<dyn ProcessControl>,
}

impl ImportEngine {
    pub fn new(
        store: JobStore,
        registry: Arc<HandlerRegistry>,
        config: Arc<ImporterConfig>,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            control: platform::native(),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Processes one job. Returns `Err` only if the store fails in a way
    /// that prevents recording the outcome.
    pub fn run(&self, job_id: &str) -> Result<RunOutcome, EngineError> {
        if !sanitize::is_valid_job_id(job_id) {
            return Err(EngineError::InvalidJobId(job_id.to_string()));
        }

        let Some(job) = self.store.fetch(job_id)? else {
            log::warn!("Job {} not found", job_id);
            return Ok(RunOutcome::NotFound);
        };
        if job.status != JobStatus::Pending {
            log::info!("Job {} is {}, nothing to do", job_id, job.status);
            return Ok(RunOutcome::Skipped(SkipReason::NotPending(job.status)));
        }

        let Some(_lock) = JobLock::acquire(&self.config.lock_dir, job_id, self.control.as_ref())?
        else {
            return Ok(RunOutcome::Skipped(SkipReason::Locked));
        };

        // Re-read under the lock; a previous holder may have finished it.
        let Some(job) = self.store.fetch(job_id)? else {
            return Ok(RunOutcome::NotFound);
        };
        if job.status != JobStatus::Pending {
            return Ok(RunOutcome::Skipped(SkipReason::NotPending(job.status)));
        }

        let _limits = if self.config.raise_resource_limits {
            LimitGuard::raise()
        } else {
            LimitGuard::disabled()
        };

        let filename = sanitize::redact_path(&job.filepath);
        let _span = info_span!(
            "import",
            job_id = %job.job_id,
            filename = %filename,
            total_data = job.total_data
        )
        .entered();

        self.run_locked(&job)
    }

    fn run_locked(&self, job: &Job) -> Result<RunOutcome, EngineError> {
        let invoker = match self.invoker_for(job) {
            Ok(invoker) => invoker,
            Err(message) => return self.fail_before_start(job, message),
        };

        let mut source = match CsvSource::open(
            &job.filepath,
            job.options,
            OpenRetry::from_config(&self.config),
        ) {
            Ok(source) => source,
            Err(e) => return self.fail_before_start(job, e.to_string()),
        };

        let start = Utc::now();
        if !self.store.mark_processing(&job.job_id, start)? {
            let status = self
                .store
                .fetch(&job.job_id)?
                .map(|j| j.status)
                .unwrap_or(JobStatus::Failed);
            return Ok(RunOutcome::Skipped(SkipReason::NotPending(status)));
        }
        log::info!(
            "Processing job {} ({} rows, chunk size {})",
            job.job_id,
            job.total_data,
            job.options.chunk_size
        );

        let mut state = RunState {
            counters: Counters::default(),
            errors: ErrorLog::default(),
            index: 0,
            dirty: false,
        };

        match self.process(job, &mut source, &invoker, &mut state) {
            Ok(()) => {
                let end = Utc::now();
                let run_time = elapsed_seconds(start, end);
                if !self
                    .store
                    .finish(&job.job_id, &state.counters, &state.errors, end, run_time)?
                {
                    return Ok(RunOutcome::Interrupted);
                }
                log::info!(
                    "Job {} completed: {} processed, {} failed, {} blank rows skipped in {}s",
                    job.job_id,
                    state.counters.total_processed,
                    state.counters.total_failed,
                    state.counters.total_skip_empty_row,
                    run_time
                );
                Ok(RunOutcome::Completed(state.counters))
            }
            Err(Fatal::Interrupted) => {
                log::warn!("Job {} left Processing during the run, stopping", job.job_id);
                Ok(RunOutcome::Interrupted)
            }
            Err(Fatal::Reader(e)) => self.fail_during_run(job, &mut state, start, e.to_string()),
            Err(Fatal::Database(e)) => {
                log::error!("Store failed while processing job {}: {}", job.job_id, e);
                // The store may have recovered; try to leave a terminal record.
                self.fail_during_run(job, &mut state, start, e.to_string())
                    .map_err(|_| EngineError::Database(e))
            }
        }
    }

    /// Resolves the job's handler. Dependencies are only checked for
    /// registration here; they are resolved per chunk.
    fn invoker_for(&self, job: &Job) -> Result<RowInvoker, String> {
        let name = job
            .handler
            .as_deref()
            .ok_or_else(|| "No row handler set for this job".to_string())?;
        let handler = self
            .registry
            .handler(name)
            .ok_or_else(|| format!("Row handler '{}' is not registered", name))?;
        if let Some(missing) = self.registry.missing_dependency(&job.dependencies) {
            return Err(format!("Dependency '{}' is not registered", missing));
        }
        Ok(RowInvoker::new(handler))
    }

    fn fail_before_start(&self, job: &Job, message: String) -> Result<RunOutcome, EngineError> {
        log::error!("Job {} failed before processing: {}", job.job_id, message);
        self.store
            .fail(&job.job_id, &ErrorLog::fatal(message.clone()), None, Utc::now(), None)?;
        Ok(RunOutcome::Failed(message))
    }

    fn fail_during_run(
        &self,
        job: &Job,
        state: &mut RunState,
        start: DateTime<Utc>,
        message: String,
    ) -> Result<RunOutcome, EngineError> {
        log::error!("Job {} failed: {}", job.job_id, message);
        let end = Utc::now();
        state.errors.fatal = Some(message.clone());
        self.store.fail(
            &job.job_id,
            &state.errors,
            Some(&state.counters),
            end,
            Some(elapsed_seconds(start, end)),
        )?;
        Ok(RunOutcome::Failed(message))
    }

    fn process<R: Read>(
        &self,
        job: &Job,
        source: &mut CsvSource<R>,
        invoker: &RowInvoker,
        state: &mut RunState,
    ) -> Result<(), Fatal> {
        if job.options.skip_header {
            source.next_record()?;
        }

        let chunk_size = job.options.chunk_size.max(1);
        let refresh = match self.config.refresh_interval {
            0 => None,
            n if n == chunk_size as u64 => None,
            n => Some(n),
        };
        let recycle_connection = job.total_data > self.config.large_job_threshold;

        let mut chunk: Vec<Row> = Vec::with_capacity(chunk_size);
        let mut chunk_no: u64 = 0;
        loop {
            chunk.clear();
            let mut eof = false;
            while chunk.len() < chunk_size {
                match source.next_record()? {
                    None => {
                        eof = true;
                        break;
                    }
                    Some(row) if !row.has_content() => {
                        state.counters.total_skip_empty_row += 1;
                        state.dirty = true;
                    }
                    Some(row) => chunk.push(row),
                }
            }

            if !chunk.is_empty() {
                chunk_no += 1;
                let _chunk_span =
                    debug_span!("chunk", number = chunk_no, rows = chunk.len()).entered();
                self.process_chunk(job, &chunk, invoker, state, refresh)?;
            }
            if state.dirty {
                self.checkpoint(job, state)?;
            }
            if eof {
                return Ok(());
            }
            if recycle_connection {
                self.store.release_connection()?;
                std::thread::sleep(self.config.reconnect_pause());
            }
        }
    }

    fn process_chunk(
        &self,
        job: &Job,
        chunk: &[Row],
        invoker: &RowInvoker,
        state: &mut RunState,
        refresh: Option<u64>,
    ) -> Result<(), Fatal> {
        let deps: Result<Dependencies, String> = self
            .registry
            .resolve(&job.dependencies, job)
            .map_err(|e| e.to_string());
        if let Err(ref e) = deps {
            log::error!("Dependency resolution failed for job {}: {}", job.job_id, e);
        }

        let limit = self.config.error_bucket_limit;
        for row in chunk {
            state.index += 1;
            let index = state.index;
            let outcome = match &deps {
                Ok(deps) => invoker.invoke(row, index, deps),
                Err(e) => RowOutcome::SystemError(e.clone()),
            };
            record(state, index, outcome, limit);

            if let Some(every) = refresh {
                if state.counters.total_processed % every == 0 {
                    self.checkpoint(job, state)?;
                }
            }
        }
        Ok(())
    }

    fn checkpoint(&self, job: &Job, state: &mut RunState) -> Result<(), Fatal> {
        if !self
            .store
            .checkpoint(&job.job_id, &state.counters, &state.errors)?
        {
            return Err(Fatal::Interrupted);
        }
        state.dirty = false;
        Ok(())
    }
}

fn record(state: &mut RunState, index: u64, outcome: RowOutcome, limit: usize) {
    let counters = &mut state.counters;
    match outcome {
        RowOutcome::Success(action) => {
            counters.total_success += 1;
            match action {
                RowAction::Create => counters.total_inserted += 1,
                RowAction::Update => counters.total_updated += 1,
                RowAction::None => {}
            }
        }
        RowOutcome::Rejected(message) => {
            counters.total_failed += 1;
            if let Some(message) = message {
                state.errors.push_data(format!("Row {}: {}", index, message), limit);
            }
        }
        RowOutcome::SystemError(message) => {
            counters.total_failed += 1;
            state.errors.push_system(format!("Row {}: {}", index, message), limit);
        }
    }
    counters.total_processed += 1;
    state.dirty = true;
}

fn elapsed_seconds(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    u64::try_from((end - start).num_seconds()).unwrap_or(0)
}
