//! Submission API and status queries.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::config::{ImporterConfig, StartFailurePolicy};
use crate::db::{Database, DatabaseError};
use crate::engine::{ImportEngine, RunOutcome};
use crate::error::{ImportError, SubmitError, SupervisorError};
use crate::handler::HandlerRegistry;
use crate::job::{ErrorLog, JobSnapshot};
use crate::reader::{self, OpenRetry, ParseOptions};
use crate::sanitize;
use crate::store::{JobStore, NewJob};
use crate::supervisor::{ProcessSupervisor, StartOutcome, Supervisor};

/// Builder for one import.
///
/// ```no_run
/// # use bulkimport::{ImportRequest, Importer, ImporterConfig, HandlerRegistry};
/// # fn main() -> bulkimport::Result<()> {
/// let importer = Importer::new(ImporterConfig::default(), HandlerRegistry::with_builtins())?;
/// let job_id = importer.submit(
///     ImportRequest::new("/data/users.csv")
///         .owner(42)
///         .handler("echo")
///         .delimiter(b';'),
/// )?;
/// # Ok(()) }
/// ```
#[derive(Debug, Clone)]
pub struct ImportRequest {
    path: PathBuf,
    owner: Option<i64>,
    display_id: Option<String>,
    handler: Option<String>,
    dependencies: Vec<String>,
    delimiter: u8,
    enclosure: u8,
    escape: Option<u8>,
    skip_header: bool,
    chunk_size: Option<usize>,
}

impl ImportRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let defaults = ParseOptions::default();
        Self {
            path: path.into(),
            owner: None,
            display_id: None,
            handler: None,
            dependencies: Vec::new(),
            delimiter: defaults.delimiter,
            enclosure: defaults.enclosure,
            escape: defaults.escape,
            skip_header: defaults.skip_header,
            chunk_size: None,
        }
    }

    /// Owner the job is listed under in [`Importer::get_status_by_owner`].
    pub fn owner(mut self, owner: i64) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Opaque id a UI uses to attach the job's progress to an element.
    pub fn display_id(mut self, id: impl Into<String>) -> Self {
        self.display_id = Some(id.into());
        self
    }

    pub fn handler(mut self, name: impl Into<String>) -> Self {
        self.handler = Some(name.into());
        self
    }

    pub fn dependencies<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn skip_header(mut self, skip: bool) -> Self {
        self.skip_header = skip;
        self
    }

    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn enclosure(mut self, enclosure: u8) -> Self {
        self.enclosure = enclosure;
        self
    }

    pub fn escape(mut self, escape: Option<u8>) -> Self {
        self.escape = escape;
        self
    }

    /// Rows per chunk. Defaults to `default_chunk_size` from the config.
    pub fn chunk_size(mut self, rows: usize) -> Self {
        self.chunk_size = Some(rows);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Entry point for callers: validates and records jobs, launches workers,
/// answers status polls.
pub struct Importer {
    config: Arc<ImporterConfig>,
    store: JobStore,
    registry: Arc<HandlerRegistry>,
    supervisor: Arc<dyn Supervisor>,
}

impl Importer {
    /// Opens the database at `config.database_path` and supervises workers
    /// as separate processes.
    pub fn new(config: ImporterConfig, registry: HandlerRegistry) -> Result<Self, ImportError> {
        let db = Database::open(&config.database_path)?;
        let config = Arc::new(config);
        let store = JobStore::new(db);
        let supervisor = Arc::new(ProcessSupervisor::new(Arc::clone(&config), store.clone()));
        Ok(Self::with_parts(config, store, Arc::new(registry), supervisor))
    }

    pub fn with_parts(
        config: Arc<ImporterConfig>,
        store: JobStore,
        registry: Arc<HandlerRegistry>,
        supervisor: Arc<dyn Supervisor>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            supervisor,
        }
    }

    pub fn config(&self) -> &ImporterConfig {
        &self.config
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Records a Pending job and launches a worker for it.
    ///
    /// Returns the job id once the worker is running. If no worker could
    /// be started the job is kept Pending or marked Failed according to
    /// `start_failure_policy`, and the returned error carries its id.
    pub fn submit(&self, request: ImportRequest) -> Result<String, SubmitError> {
        let job_id = self.create_job(&request)?;

        let reason = match self.supervisor.start(&job_id) {
            Ok(StartOutcome::Started { pid }) => {
                log::info!("Job {} handed to worker pid {}", job_id, pid);
                return Ok(job_id);
            }
            Ok(StartOutcome::AlreadyRunning { pid }) => {
                format!("a worker (pid {}) already holds the job", pid)
            }
            Ok(StartOutcome::AtCapacity { live, limit }) => {
                format!("{} of {} workers are busy", live, limit)
            }
            Err(e) => e.to_string(),
        };

        log::warn!("Could not start a worker for job {}: {}", job_id, reason);
        if self.config.start_failure_policy == StartFailurePolicy::MarkFailed {
            self.store.fail(
                &job_id,
                &ErrorLog::fatal(format!("Worker was not started: {}", reason)),
                None,
                Utc::now(),
                None,
            )?;
        }
        Err(SubmitError::NotStarted { job_id, reason })
    }

    /// Records the job and imports it in the calling thread.
    pub fn process_now(&self, request: ImportRequest) -> Result<JobSnapshot, SubmitError> {
        let job_id = self.create_job(&request)?;
        let engine = ImportEngine::new(
            self.store.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.config),
        );
        match engine.run(&job_id)? {
            RunOutcome::Completed(_) | RunOutcome::Failed(_) => {}
            other => log::warn!("Job {} did not run to completion: {:?}", job_id, other),
        }
        self.get_status(&job_id)?
            .ok_or(SubmitError::JobNotFound(job_id))
    }

    /// Launches a worker for an existing Pending job, e.g. one kept
    /// Pending by an earlier failed start.
    pub fn start_worker(&self, job_id: &str) -> Result<StartOutcome, SupervisorError> {
        self.supervisor.start(job_id)
    }

    pub fn get_status(&self, job_id: &str) -> Result<Option<JobSnapshot>, DatabaseError> {
        let now = Utc::now();
        Ok(self
            .store
            .fetch(job_id)?
            .map(|job| JobSnapshot::from_job(&job, now)))
    }

    /// All jobs of `owner`, newest first.
    pub fn get_status_by_owner(&self, owner: i64) -> Result<Vec<JobSnapshot>, DatabaseError> {
        let now = Utc::now();
        Ok(self
            .store
            .fetch_by_owner(owner)?
            .iter()
            .map(|job| JobSnapshot::from_job(job, now))
            .collect())
    }

    pub fn is_running(&self, job_id: &str) -> Result<bool, SupervisorError> {
        self.supervisor.is_running(job_id)
    }

    pub fn kill(&self, job_id: &str) -> Result<bool, SupervisorError> {
        self.supervisor.kill(job_id)
    }

    fn create_job(&self, request: &ImportRequest) -> Result<String, SubmitError> {
        self.check_handler(request)?;
        let filepath = self.check_file(&request.path)?;

        let chunk_size = request.chunk_size.unwrap_or(self.config.default_chunk_size);
        if chunk_size == 0 {
            return Err(SubmitError::InvalidChunkSize(chunk_size));
        }
        let options = ParseOptions {
            delimiter: request.delimiter,
            enclosure: request.enclosure,
            escape: request.escape,
            skip_header: request.skip_header,
            chunk_size,
        };
        options.validate()?;

        let total_data =
            reader::count_records(&filepath, options, OpenRetry::from_config(&self.config))?;

        let job_id = format!("csv_{}", Uuid::new_v4().simple());
        let filename = filepath
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        self.store.create(&NewJob {
            job_id: job_id.clone(),
            owner: request.owner,
            filepath,
            filename,
            options,
            handler: request.handler.clone(),
            dependencies: request.dependencies.clone(),
            display_id: request.display_id.clone(),
            total_data,
        })?;

        log::info!(
            "Created job {} for {} ({} rows)",
            job_id,
            sanitize::redact_path(&request.path),
            total_data
        );
        Ok(job_id)
    }

    fn check_handler(&self, request: &ImportRequest) -> Result<(), SubmitError> {
        let name = request.handler.as_deref().ok_or(SubmitError::MissingHandler)?;
        if !self.registry.has_handler(name) {
            return Err(SubmitError::UnknownHandler(name.to_string()));
        }
        if let Some(missing) = self.registry.missing_dependency(&request.dependencies) {
            return Err(SubmitError::UnknownDependency(missing.to_string()));
        }
        Ok(())
    }

    /// Checks existence, readability and extension. Returns the absolute
    /// path so workers with another working directory find the file.
    fn check_file(&self, path: &Path) -> Result<PathBuf, SubmitError> {
        if !path.is_file() {
            return Err(SubmitError::FileNotFound(path.to_path_buf()));
        }
        File::open(path).map_err(|e| SubmitError::NotReadable {
            path: path.to_path_buf(),
            source: e,
        })?;

        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !self.config.is_allowed_extension(&extension) {
            return Err(SubmitError::InvalidExtension {
                path: path.to_path_buf(),
                expected: self.config.allowed_extensions.join(", "),
            });
        }

        fs::canonicalize(path).map_err(|e| SubmitError::NotReadable {
            path: path.to_path_buf(),
            source: e,
        })
    }
}
