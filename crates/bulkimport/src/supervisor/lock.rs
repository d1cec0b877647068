//! Per-job lock files.
//!
//! `<lock_dir>/csv_import_<job_id>.lock` holds the PID of the process that
//! owns the job. The supervisor writes its own PID as a placeholder before
//! spawning and hands the lock over to the worker's PID afterwards; the
//! worker accepts a placeholder written by the PID it inherited through
//! [`ENV_LOCK_PID`].

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use crate::error::SupervisorError;

use super::platform::ProcessControl;

/// PID of the supervisor that placed the lock for a spawned worker.
pub const ENV_LOCK_PID: &str = "BULKIMPORT_LOCK_PID";

const LOCK_PREFIX: &str = "csv_import_";
const LOCK_SUFFIX: &str = ".lock";

/// An empty lock file younger than this is assumed to be mid-write.
const EMPTY_LOCK_GRACE: Duration = Duration::from_secs(5);

pub fn lock_path(lock_dir: &Path, job_id: &str) -> PathBuf {
    lock_dir.join(format!("{}{}{}", LOCK_PREFIX, job_id, LOCK_SUFFIX))
}

/// Append-only stderr log of the worker for `job_id`.
pub fn log_path(lock_dir: &Path, job_id: &str) -> PathBuf {
    lock_dir.join(format!("{}{}.log", LOCK_PREFIX, job_id))
}

/// Locks held by engines running in this process. Two runs in one process
/// share a PID, so the file alone cannot tell them apart.
fn held_here() -> &'static Mutex<HashSet<PathBuf>> {
    static HELD: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    HELD.get_or_init(|| Mutex::new(HashSet::new()))
}

fn lock_error(path: &Path, source: io::Error) -> SupervisorError {
    SupervisorError::Lock {
        path: path.to_path_buf(),
        source,
    }
}

/// Reads the recorded PID. `None` if the file is missing, empty or garbled.
pub fn read_pid(path: &Path) -> Result<Option<u32>, SupervisorError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content.trim().parse().ok()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(lock_error(path, e)),
    }
}

fn owner_only() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
}

/// Creates the lock with `pid` unless it already exists.
fn create_exclusive(path: &Path, pid: u32) -> Result<bool, SupervisorError> {
    match owner_only().create_new(true).open(path) {
        Ok(mut file) => {
            write!(file, "{}", pid).map_err(|e| lock_error(path, e))?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(lock_error(path, e)),
    }
}

/// Replaces the recorded PID atomically (write to a sibling, then rename).
pub fn write_pid(path: &Path, pid: u32) -> Result<(), SupervisorError> {
    let tmp = path.with_extension(format!("lock.{}.tmp", std::process::id()));
    let mut file = owner_only()
        .create(true)
        .truncate(true)
        .open(&tmp)
        .map_err(|e| lock_error(&tmp, e))?;
    write!(file, "{}", pid).map_err(|e| lock_error(&tmp, e))?;
    drop(file);
    fs::rename(&tmp, path).map_err(|e| lock_error(path, e))
}

/// Removes the lock file. Missing files are fine.
pub fn remove(path: &Path) -> Result<(), SupervisorError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(lock_error(path, e)),
    }
}

/// Removes the lock only if it still records `pid`.
pub fn release_if_owned(path: &Path, pid: u32) -> Result<bool, SupervisorError> {
    if read_pid(path)? == Some(pid) {
        remove(path)?;
        return Ok(true);
    }
    Ok(false)
}

/// Passes the lock from `from` to `to`, unless someone else already moved
/// or removed it.
pub fn hand_over(path: &Path, from: u32, to: u32) -> Result<bool, SupervisorError> {
    if read_pid(path)? == Some(from) {
        write_pid(path, to)?;
        return Ok(true);
    }
    Ok(false)
}

fn is_fresh(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .map(|age| age < EMPTY_LOCK_GRACE)
        .unwrap_or(true)
}

/// Result of trying to place a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    Claimed,
    HeldBy(u32),
    /// Present but not yet readable.
    Busy,
}

/// Places a lock recording `pid`, clearing a stale one left by a dead
/// process. `accept` decides whether an existing live owner may be taken
/// over by this caller.
fn claim(
    path: &Path,
    pid: u32,
    control: &dyn ProcessControl,
    accept: impl Fn(u32) -> bool,
) -> Result<Claim, SupervisorError> {
    for _ in 0..3 {
        if create_exclusive(path, pid)? {
            return Ok(Claim::Claimed);
        }
        match read_pid(path)? {
            Some(owner) if accept(owner) => {
                write_pid(path, pid)?;
                return Ok(Claim::Claimed);
            }
            Some(owner) if control.is_alive(owner) => return Ok(Claim::HeldBy(owner)),
            Some(owner) => {
                log::warn!(
                    "Removing stale lock {} left by PID {}",
                    path.display(),
                    owner
                );
                remove(path)?;
            }
            None if is_fresh(path) => return Ok(Claim::Busy),
            None => {
                log::warn!("Removing unreadable lock {}", path.display());
                remove(path)?;
            }
        }
    }
    Ok(Claim::Busy)
}

/// Supervisor side: places a placeholder lock with this process's PID.
pub fn claim_for_spawn(
    lock_dir: &Path,
    job_id: &str,
    control: &dyn ProcessControl,
) -> Result<Claim, SupervisorError> {
    fs::create_dir_all(lock_dir).map_err(|e| lock_error(lock_dir, e))?;
    claim(&lock_path(lock_dir, job_id), std::process::id(), control, |_| false)
}

/// Live lock owners in `lock_dir`, as `(job_id, pid)`. Stale locks are
/// removed on the way.
pub fn live_locks(
    lock_dir: &Path,
    control: &dyn ProcessControl,
) -> Result<Vec<(String, u32)>, SupervisorError> {
    let entries = match fs::read_dir(lock_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(lock_error(lock_dir, e)),
    };

    let mut live = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(job_id) = name
            .to_str()
            .and_then(|n| n.strip_prefix(LOCK_PREFIX))
            .and_then(|n| n.strip_suffix(LOCK_SUFFIX))
        else {
            continue;
        };
        let path = entry.path();
        match read_pid(&path)? {
            Some(pid) if control.is_alive(pid) => live.push((job_id.to_string(), pid)),
            Some(pid) => {
                log::debug!("Clearing stale lock for job {} (PID {})", job_id, pid);
                remove(&path)?;
            }
            None if is_fresh(&path) => live.push((job_id.to_string(), 0)),
            None => remove(&path)?,
        }
    }
    Ok(live)
}

/// A lock held by an import run in this process. Dropping it removes the
/// file if it still records this process.
#[derive(Debug)]
pub struct JobLock {
    path: PathBuf,
    pid: u32,
}

impl JobLock {
    /// Takes the lock for an engine run. `None` if another live process
    /// (or another run in this process) owns it.
    ///
    /// A placeholder left by the supervisor that spawned this process, or
    /// a lock already naming this process, is taken over.
    pub fn acquire(
        lock_dir: &Path,
        job_id: &str,
        control: &dyn ProcessControl,
    ) -> Result<Option<JobLock>, SupervisorError> {
        fs::create_dir_all(lock_dir).map_err(|e| lock_error(lock_dir, e))?;
        let path = lock_path(lock_dir, job_id);
        let pid = std::process::id();
        let parent: Option<u32> = std::env::var(ENV_LOCK_PID)
            .ok()
            .and_then(|v| v.trim().parse().ok());

        let mut held = held_here().lock().unwrap_or_else(|e| e.into_inner());
        if held.contains(&path) {
            return Ok(None);
        }

        match claim(&path, pid, control, |owner| {
            owner == pid || Some(owner) == parent
        })? {
            Claim::Claimed => {
                held.insert(path.clone());
                Ok(Some(JobLock { path, pid }))
            }
            Claim::HeldBy(owner) => {
                log::info!("Job {} is locked by PID {}", job_id, owner);
                Ok(None)
            }
            Claim::Busy => Ok(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        held_here()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.path);
        if let Err(e) = release_if_owned(&self.path, self.pid) {
            log::warn!("Failed to remove lock {}: {}", self.path.display(), e);
        }
    }
}
