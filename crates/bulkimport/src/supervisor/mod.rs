//! Worker process lifecycle: start, liveness and termination.
//!
//! Callers depend on the [`Supervisor`] trait. [`ProcessSupervisor`] runs
//! each job in its own `bulkimport-worker` process, guarded by a per-job
//! lock file, and talks to the OS through [`platform::ProcessControl`].

pub mod lock;
pub mod platform;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::config::{ImporterConfig, ENV_DATABASE, ENV_LOCK_DIR};
use crate::error::SupervisorError;
use crate::job::{ErrorLog, JobStatus};
use crate::sanitize;
use crate::store::JobStore;

use self::lock::{Claim, ENV_LOCK_PID};
use self::platform::ProcessControl;

/// Message recorded on a job stopped through [`Supervisor::kill`].
pub const KILLED_MESSAGE: &str = "Process terminated by user";

const POLL_INTERVAL: Duration = Duration::from_millis(25);
/// How long to wait for a forced kill to take effect.
const FORCE_KILL_WAIT: Duration = Duration::from_secs(2);

/// Result of a start request that did not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    /// Another live process holds the job's lock.
    AlreadyRunning { pid: u32 },
    /// The concurrency ceiling is reached; try again later.
    AtCapacity { live: usize, limit: usize },
}

impl StartOutcome {
    pub fn started(&self) -> bool {
        matches!(self, StartOutcome::Started { .. })
    }
}

pub trait Supervisor: Send + Sync {
    /// Launches a worker for `job_id`.
    fn start(&self, job_id: &str) -> Result<StartOutcome, SupervisorError>;

    /// True while a live process holds the job's lock.
    fn is_running(&self, job_id: &str) -> Result<bool, SupervisorError>;

    /// Stops the worker of a Processing job and marks the job Failed.
    /// Returns false if the job was not Processing or could not be stopped.
    fn kill(&self, job_id: &str) -> Result<bool, SupervisorError>;
}

pub struct ProcessSupervisor {
    config: Arc<ImporterConfig>,
    store: JobStore,
    control: Arc<dyn ProcessControl>,
    children: Mutex<HashMap<String, Child>>,
}

impl ProcessSupervisor {
    pub fn new(config: Arc<ImporterConfig>, store: JobStore) -> Self {
        Self::with_control(config, store, platform::native())
    }

    pub fn with_control(
        config: Arc<ImporterConfig>,
        store: JobStore,
        control: Arc<dyn ProcessControl>,
    ) -> Self {
        Self {
            config,
            store,
            control,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn check_job_id(job_id: &str) -> Result<(), SupervisorError> {
        if sanitize::is_valid_job_id(job_id) {
            Ok(())
        } else {
            Err(SupervisorError::InvalidJobId(job_id.to_string()))
        }
    }

    /// Collects exit statuses of finished children so they do not linger
    /// as zombies.
    fn reap(&self) {
        let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        children.retain(|job_id, child| match child.try_wait() {
            Ok(Some(status)) => {
                log::debug!("Worker for job {} exited with {}", job_id, status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                log::warn!("Could not poll worker for job {}: {}", job_id, e);
                true
            }
        });
    }

    fn open_log(&self, job_id: &str) -> Result<File, SupervisorError> {
        let path = lock::log_path(&self.config.lock_dir, job_id);
        rotate_log(&path, self.config.max_log_bytes)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| SupervisorError::Log { path, source: e })
    }

    fn spawn_once(&self, job_id: &str) -> Result<Child, SupervisorError> {
        let log = self.open_log(job_id)?;

        let mut cmd = Command::new(&self.config.worker_program);
        cmd.args(&self.config.worker_args)
            .arg(job_id)
            .env(ENV_DATABASE, &self.config.database_path)
            .env(ENV_LOCK_DIR, &self.config.lock_dir)
            .env(ENV_LOCK_PID, std::process::id().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log));

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Keep terminal signals aimed at the submitter away from the worker.
            cmd.process_group(0);
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        cmd.spawn().map_err(|e| SupervisorError::SpawnFailed {
            attempts: 1,
            reason: e.to_string(),
        })
    }

    fn spawn_with_retry(&self, job_id: &str) -> Result<Child, SupervisorError> {
        let attempts = self.config.spawn_retry_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.spawn_once(job_id) {
                Ok(child) => return Ok(child),
                Err(e) => {
                    log::warn!(
                        "Spawning worker for job {} failed (attempt {}/{}): {}",
                        job_id,
                        attempt,
                        attempts,
                        e
                    );
                    last_error = e.to_string();
                    if attempt < attempts {
                        std::thread::sleep(self.config.spawn_retry_delay());
                    }
                }
            }
        }
        Err(SupervisorError::SpawnFailed {
            attempts,
            reason: last_error,
        })
    }

    /// Keeps the child handle so `reap` can collect its exit status.
    fn track(&self, job_id: &str, child: Child) {
        self.children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id.to_string(), child);
    }

    /// Polls until `pid` is gone or `timeout` passes.
    fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.reap();
            if !self.control.is_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn stop_process(&self, job_id: &str, pid: u32) -> bool {
        if !self.control.is_alive(pid) {
            return true;
        }
        log::info!("Terminating worker PID {} for job {}", pid, job_id);
        if let Err(e) = self.control.terminate(pid) {
            log::warn!("Graceful termination of PID {} failed: {}", pid, e);
        }
        if self.wait_for_exit(pid, self.config.kill_grace()) {
            return true;
        }

        log::warn!("Worker PID {} ignored termination, killing", pid);
        if let Err(e) = self.control.force_kill(pid) {
            log::error!("Forced kill of PID {} failed: {}", pid, e);
        }
        self.wait_for_exit(pid, FORCE_KILL_WAIT)
    }
}

impl Supervisor for ProcessSupervisor {
    fn start(&self, job_id: &str) -> Result<StartOutcome, SupervisorError> {
        Self::check_job_id(job_id)?;
        self.reap();

        let lock_dir = &self.config.lock_dir;
        let me = std::process::id();
        match lock::claim_for_spawn(lock_dir, job_id, self.control.as_ref())? {
            Claim::Claimed => {}
            Claim::HeldBy(pid) => {
                log::info!("Worker for job {} already running as PID {}", job_id, pid);
                return Ok(StartOutcome::AlreadyRunning { pid });
            }
            Claim::Busy => return Ok(StartOutcome::AlreadyRunning { pid: 0 }),
        }
        let lock_path = lock::lock_path(lock_dir, job_id);

        let live = lock::live_locks(lock_dir, self.control.as_ref())?
            .into_iter()
            .filter(|(id, _)| id != job_id)
            .count();
        let limit = self.config.max_concurrent_workers;
        if live >= limit {
            lock::release_if_owned(&lock_path, me)?;
            log::warn!(
                "Not starting job {}: {} workers running (limit {})",
                job_id,
                live,
                limit
            );
            return Ok(StartOutcome::AtCapacity { live, limit });
        }

        let mut child = match self.spawn_with_retry(job_id) {
            Ok(child) => child,
            Err(e) => {
                lock::release_if_owned(&lock_path, me)?;
                return Err(e);
            }
        };
        let pid = child.id();
        lock::hand_over(&lock_path, me, pid)?;

        std::thread::sleep(self.config.startup_probe());
        match child.try_wait() {
            Ok(Some(status)) => {
                // Finished already (small file) or died during bootstrap.
                lock::release_if_owned(&lock_path, pid)?;
                if !status.success() {
                    log::error!("Worker for job {} exited early with {}", job_id, status);
                    return Err(SupervisorError::WorkerExited {
                        pid,
                        code: status.code(),
                    });
                }
            }
            Ok(None) => self.track(job_id, child),
            Err(e) => {
                log::warn!("Could not poll worker for job {}: {}", job_id, e);
                self.track(job_id, child);
            }
        }

        log::info!("Started worker PID {} for job {}", pid, job_id);
        Ok(StartOutcome::Started { pid })
    }

    fn is_running(&self, job_id: &str) -> Result<bool, SupervisorError> {
        Self::check_job_id(job_id)?;
        self.reap();
        let path = lock::lock_path(&self.config.lock_dir, job_id);
        Ok(match lock::read_pid(&path)? {
            Some(pid) => self.control.is_alive(pid),
            None => false,
        })
    }

    fn kill(&self, job_id: &str) -> Result<bool, SupervisorError> {
        Self::check_job_id(job_id)?;
        let job = self
            .store
            .fetch(job_id)?
            .ok_or_else(|| SupervisorError::JobNotFound(job_id.to_string()))?;
        if job.status != JobStatus::Processing {
            log::info!("Not killing job {}: status is {}", job_id, job.status);
            return Ok(false);
        }

        let path = lock::lock_path(&self.config.lock_dir, job_id);
        // A lock naming this process belongs to an in-process run, which
        // stops at its next checkpoint once the job is Failed.
        if let Some(pid) = lock::read_pid(&path)?.filter(|&pid| pid != std::process::id()) {
            if !self.stop_process(job_id, pid) {
                log::error!("Worker PID {} for job {} could not be stopped", pid, job_id);
                return Ok(false);
            }
        }

        let end = Utc::now();
        let run_time = job
            .start_time
            .map(|start| u64::try_from((end - start).num_seconds()).unwrap_or(0));
        let mut errors = job.errors;
        errors.fatal = Some(KILLED_MESSAGE.to_string());
        let changed = self.store.fail(job_id, &errors, None, end, run_time)?;

        if lock::read_pid(&path)? != Some(std::process::id()) {
            lock::remove(&path)?;
        }
        log::info!("Job {} terminated by user", job_id);
        Ok(changed)
    }
}

/// Moves an oversized worker log to `<name>.1`, keeping one generation.
fn rotate_log(path: &Path, max_bytes: u64) -> Result<(), SupervisorError> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(_) => return Ok(()),
    };
    if len <= max_bytes {
        return Ok(());
    }
    let mut rotated = path.as_os_str().to_owned();
    rotated.push(".1");
    fs::rename(path, &rotated).map_err(|e| SupervisorError::Log {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::reader::ParseOptions;
    use crate::store::NewJob;
    use std::io;
    use std::path::PathBuf;

    struct FakeControl {
        alive: Mutex<Vec<u32>>,
        ignore_terminate: bool,
    }

    impl FakeControl {
        fn new(alive: Vec<u32>, ignore_terminate: bool) -> Self {
            Self {
                alive: Mutex::new(alive),
                ignore_terminate,
            }
        }
    }

    impl ProcessControl for FakeControl {
        fn is_alive(&self, pid: u32) -> bool {
            self.alive.lock().unwrap().contains(&pid)
        }
        fn terminate(&self, pid: u32) -> io::Result<()> {
            if !self.ignore_terminate {
                self.alive.lock().unwrap().retain(|&p| p != pid);
            }
            Ok(())
        }
        fn force_kill(&self, pid: u32) -> io::Result<()> {
            self.alive.lock().unwrap().retain(|&p| p != pid);
            Ok(())
        }
    }

    fn setup(control: FakeControl) -> (tempfile::TempDir, JobStore, ProcessSupervisor) {
        let dir = tempfile::tempdir().unwrap();
        let config = ImporterConfig {
            lock_dir: dir.path().to_path_buf(),
            worker_program: PathBuf::from("/nonexistent/bulkimport-worker"),
            spawn_retry_attempts: 2,
            spawn_retry_delay_ms: 1,
            kill_grace_ms: 50,
            startup_probe_ms: 0,
            max_concurrent_workers: 2,
            ..Default::default()
        };
        let store = JobStore::new(Database::open_in_memory().unwrap());
        let supervisor =
            ProcessSupervisor::with_control(Arc::new(config), store.clone(), Arc::new(control));
        (dir, store, supervisor)
    }

    fn processing_job(store: &JobStore, job_id: &str) {
        store
            .create(&NewJob {
                job_id: job_id.to_string(),
                owner: None,
                filepath: PathBuf::from("/tmp/a.csv"),
                filename: "a.csv".to_string(),
                options: ParseOptions::default(),
                handler: Some("echo".to_string()),
                dependencies: Vec::new(),
                display_id: None,
                total_data: 5,
            })
            .unwrap();
        store.mark_processing(job_id, Utc::now()).unwrap();
    }

    #[test]
    fn test_start_rejects_invalid_job_id() {
        let (_dir, _store, supervisor) = setup(FakeControl::new(vec![], false));
        assert!(matches!(
            supervisor.start("../etc"),
            Err(SupervisorError::InvalidJobId(_))
        ));
    }

    #[test]
    fn test_start_reports_running_owner() {
        let (dir, _store, supervisor) = setup(FakeControl::new(vec![4242], false));
        fs::write(lock::lock_path(dir.path(), "csv_a"), "4242").unwrap();

        assert_eq!(
            supervisor.start("csv_a").unwrap(),
            StartOutcome::AlreadyRunning { pid: 4242 }
        );
    }

    #[test]
    fn test_start_at_capacity_leaves_no_lock() {
        let (dir, _store, supervisor) =
            setup(FakeControl::new(vec![std::process::id(), 10, 11], false));
        fs::write(lock::lock_path(dir.path(), "other1"), "10").unwrap();
        fs::write(lock::lock_path(dir.path(), "other2"), "11").unwrap();

        let outcome = supervisor.start("csv_a").unwrap();
        assert_eq!(outcome, StartOutcome::AtCapacity { live: 2, limit: 2 });
        assert!(!outcome.started());
        assert!(!lock::lock_path(dir.path(), "csv_a").exists());
    }

    #[test]
    fn test_spawn_failure_after_retries_releases_lock() {
        let (dir, _store, supervisor) =
            setup(FakeControl::new(vec![std::process::id()], false));

        match supervisor.start("csv_a") {
            Err(SupervisorError::SpawnFailed { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected spawn failure, got {:?}", other),
        }
        assert!(!lock::lock_path(dir.path(), "csv_a").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_worker_dying_at_startup_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = ImporterConfig {
            lock_dir: dir.path().to_path_buf(),
            worker_program: PathBuf::from("/bin/false"),
            startup_probe_ms: 300,
            ..Default::default()
        };
        let store = JobStore::new(Database::open_in_memory().unwrap());
        let supervisor = ProcessSupervisor::new(Arc::new(config), store);

        match supervisor.start("csv_p") {
            Err(SupervisorError::WorkerExited { code, .. }) => assert_eq!(code, Some(1)),
            other => panic!("expected worker exit error, got {:?}", other),
        }
        assert!(!lock::lock_path(dir.path(), "csv_p").exists());
    }

    #[test]
    fn test_is_running_follows_lock_owner() {
        let (dir, _store, supervisor) = setup(FakeControl::new(vec![55], false));
        assert!(!supervisor.is_running("csv_a").unwrap());

        fs::write(lock::lock_path(dir.path(), "csv_a"), "55").unwrap();
        assert!(supervisor.is_running("csv_a").unwrap());

        fs::write(lock::lock_path(dir.path(), "csv_a"), "56").unwrap();
        assert!(!supervisor.is_running("csv_a").unwrap());
    }

    #[test]
    fn test_kill_processing_job() {
        let (dir, store, supervisor) = setup(FakeControl::new(vec![321], false));
        processing_job(&store, "csv_k");
        fs::write(lock::lock_path(dir.path(), "csv_k"), "321").unwrap();

        assert!(supervisor.kill("csv_k").unwrap());

        let job = store.fetch("csv_k").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.errors.fatal.as_deref(), Some(KILLED_MESSAGE));
        assert!(job.end_time.is_some());
        assert!(!lock::lock_path(dir.path(), "csv_k").exists());
    }

    #[test]
    fn test_kill_escalates_to_force() {
        let (dir, store, supervisor) = setup(FakeControl::new(vec![321], true));
        processing_job(&store, "csv_k");
        fs::write(lock::lock_path(dir.path(), "csv_k"), "321").unwrap();

        assert!(supervisor.kill("csv_k").unwrap());
        assert_eq!(store.fetch("csv_k").unwrap().unwrap().status, JobStatus::Failed);
    }

    #[test]
    fn test_kill_requires_processing() {
        let (_dir, store, supervisor) = setup(FakeControl::new(vec![], false));
        processing_job(&store, "csv_k");
        store
            .finish("csv_k", &Default::default(), &ErrorLog::default(), Utc::now(), 1)
            .unwrap();

        assert!(!supervisor.kill("csv_k").unwrap());
        assert_eq!(store.fetch("csv_k").unwrap().unwrap().status, JobStatus::Completed);
    }

    #[test]
    fn test_kill_unknown_job() {
        let (_dir, _store, supervisor) = setup(FakeControl::new(vec![], false));
        assert!(matches!(
            supervisor.kill("csv_missing"),
            Err(SupervisorError::JobNotFound(_))
        ));
    }

    #[test]
    fn test_rotate_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("csv_import_x.log");
        fs::write(&path, "0123456789").unwrap();

        rotate_log(&path, 100).unwrap();
        assert!(path.exists());

        rotate_log(&path, 5).unwrap();
        assert!(!path.exists());
        assert!(dir.path().join("csv_import_x.log.1").exists());
    }
}
