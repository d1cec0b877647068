//! Test harness for isolated test execution.
//!
//! The `TestHarness` owns a temporary directory holding the input files,
//! the job database and the lock directory, plus a config and registry
//! wired to them. Each test gets its own, so tests never share jobs.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use bulkimport::supervisor::lock;
use bulkimport::{
    Database, HandlerRegistry, ImportEngine, ImportRequest, Importer, ImporterConfig, Job,
    JobStatus, JobStore,
};

pub struct TestHarness {
    temp_dir: TempDir,
    pub input_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub config: ImporterConfig,
    pub registry: HandlerRegistry,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let base = temp_dir.path();

        let input_dir = base.join("input");
        let lock_dir = base.join("locks");
        std::fs::create_dir_all(&input_dir).expect("Failed to create input dir");
        std::fs::create_dir_all(&lock_dir).expect("Failed to create lock dir");

        let config = ImporterConfig {
            database_path: base.join("data").join("jobs.db"),
            lock_dir: lock_dir.clone(),
            worker_program: PathBuf::from(env!("CARGO_BIN_EXE_bulkimport-worker")),
            open_retry_attempts: 1,
            open_retry_delay_ms: 0,
            spawn_retry_delay_ms: 10,
            reconnect_pause_ms: 0,
            kill_grace_ms: 2000,
            raise_resource_limits: false,
            ..Default::default()
        };

        Self {
            temp_dir,
            input_dir,
            lock_dir,
            config,
            registry: HandlerRegistry::with_builtins(),
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn write_csv(&self, filename: &str, content: &str) -> PathBuf {
        let path = self.input_dir.join(filename);
        std::fs::write(&path, content).expect("Failed to write input file");
        path
    }

    /// A second handle on the harness database, as another process would
    /// open it.
    pub fn store(&self) -> JobStore {
        JobStore::new(Database::open(&self.config.database_path).expect("Failed to open database"))
    }

    pub fn importer(&self) -> Importer {
        Importer::new(self.config.clone(), self.registry.clone()).expect("Failed to build importer")
    }

    pub fn engine(&self) -> ImportEngine {
        ImportEngine::new(
            self.store(),
            Arc::new(self.registry.clone()),
            Arc::new(self.config.clone()),
        )
    }

    /// Imports in-process and returns the stored job.
    pub fn process(&self, request: ImportRequest) -> Job {
        let snapshot = self.importer().process_now(request).expect("Import failed");
        self.store()
            .fetch(&snapshot.job_id)
            .expect("Failed to read job")
            .expect("Job missing after import")
    }

    pub fn lock_file(&self, job_id: &str) -> PathBuf {
        lock::lock_path(&self.lock_dir, job_id)
    }

    /// Polls the job until `done` holds, panicking after `timeout`.
    pub fn wait_for(&self, job_id: &str, timeout: Duration, done: impl Fn(&Job) -> bool) -> Job {
        let store = self.store();
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(job) = store.fetch(job_id).expect("Failed to read job") {
                if done(&job) {
                    return job;
                }
                if Instant::now() >= deadline {
                    panic!("Timed out waiting on job {}: {:?}", job_id, job);
                }
            } else if Instant::now() >= deadline {
                panic!("Job {} never appeared", job_id);
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    pub fn wait_for_status(&self, job_id: &str, status: JobStatus, timeout: Duration) -> Job {
        self.wait_for(job_id, timeout, |job| job.status == status)
    }

    /// Polls until the lock file for `job_id` is gone.
    pub fn wait_for_unlock(&self, job_id: &str, timeout: Duration) -> bool {
        let path = self.lock_file(job_id);
        let deadline = Instant::now() + timeout;
        while path.exists() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        true
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
