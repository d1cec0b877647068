use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Reader error: {0}")]
    Reader(#[from] ReaderError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Submission error: {0}")]
    Submit(#[from] SubmitError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("File not found: {0}")]
    NotFound(PathBuf),

    #[error("File '{path}' is not readable: {source}")]
    NotReadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed record at line {line}: {reason}")]
    Malformed { line: u64, reason: String },

    #[error("Invalid {name} '{value}': must be a single ASCII character")]
    InvalidOption { name: &'static str, value: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("Row handler '{0}' is not registered")]
    UnknownHandler(String),

    #[error("Dependency '{0}' is not registered")]
    UnknownDependency(String),

    #[error("Dependency '{name}' could not be resolved: {reason}")]
    Dependency { name: String, reason: String },

    #[error("{0}")]
    Failed(String),

    #[error("Row handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Shorthand for a handler-raised failure.
    pub fn msg(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Invalid job id '{0}'")]
    InvalidJobId(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Lock file error for '{path}': {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn worker after {attempts} attempt(s): {reason}")]
    SpawnFailed { attempts: u32, reason: String },

    #[error("Worker PID {pid} exited during startup with {}", exit_code_text(.code))]
    WorkerExited { pid: u32, code: Option<i32> },

    #[error("Worker log error for '{path}': {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

fn exit_code_text(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (killed by a signal)".to_string(),
    }
}

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("A row handler must be set before processing")]
    MissingHandler,

    #[error("Row handler '{0}' is not registered")]
    UnknownHandler(String),

    #[error("Dependency '{0}' is not registered")]
    UnknownDependency(String),

    #[error("CSV file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("File '{path}' is not readable: {source}")]
    NotReadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("File '{path}' has an unsupported extension (expected one of: {expected})")]
    InvalidExtension { path: PathBuf, expected: String },

    #[error("Invalid chunk size {0}: must be greater than zero")]
    InvalidChunkSize(usize),

    #[error("Failed to scan file: {0}")]
    Reader(#[from] ReaderError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Job {0} is missing from the store")]
    JobNotFound(String),

    #[error("Worker for job {job_id} was not started: {reason}")]
    NotStarted { job_id: String, reason: String },

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Import engine error: {0}")]
    Engine(#[from] EngineError),
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Invalid job id '{0}'")]
    InvalidJobId(String),

    #[error("Could not take the job lock: {0}")]
    Lock(#[from] SupervisorError),
}

pub type Result<T> = std::result::Result<T, ImportError>;
