pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod handler;
pub mod importer;
pub mod job;
pub mod logging;
pub mod reader;
pub mod sanitize;
pub mod store;
pub mod supervisor;
pub mod worker;

pub use config::{load_config, ImporterConfig, StartFailurePolicy};
pub use db::{Database, DatabaseError};
pub use engine::{estimate, percent_complete, Eta, ImportEngine, RunOutcome, SkipReason};
pub use error::{
    ConfigError, EngineError, HandlerError, ImportError, ReaderError, Result, SubmitError,
    SupervisorError,
};
pub use handler::{
    Dependencies, DependencyProvider, HandlerRegistry, RowAction, RowHandler, RowResult,
};
pub use importer::{ImportRequest, Importer};
pub use job::{Counters, ErrorLog, Job, JobSnapshot, JobStatus};
pub use reader::{count_records, CsvSource, OpenRetry, ParseOptions, Row};
pub use store::JobStore;
pub use supervisor::{ProcessSupervisor, StartOutcome, Supervisor};
pub use worker::WorkerExit;
