use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What happens to a freshly created job when no worker could be started for it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartFailurePolicy {
    /// Leave the job `Pending` so a later `start` can pick it up.
    #[default]
    KeepPending,
    /// Record the job as `Failed` with the start failure as its message.
    MarkFailed,
}

/// Engine-wide settings shared by the submitting process and its workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImporterConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
    #[serde(default = "default_worker_program")]
    pub worker_program: PathBuf,
    /// Arguments placed before the job id when launching a worker.
    #[serde(default)]
    pub worker_args: Vec<String>,
    #[serde(default = "default_max_concurrent_workers")]
    pub max_concurrent_workers: usize,
    #[serde(default = "default_spawn_retry_attempts")]
    pub spawn_retry_attempts: u32,
    #[serde(default = "default_spawn_retry_delay_ms")]
    pub spawn_retry_delay_ms: u64,
    #[serde(default = "default_open_retry_attempts")]
    pub open_retry_attempts: u32,
    #[serde(default = "default_open_retry_delay_ms")]
    pub open_retry_delay_ms: u64,
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: usize,
    /// Rows between intra-chunk checkpoints. `0` disables them.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    #[serde(default = "default_large_job_threshold")]
    pub large_job_threshold: u64,
    #[serde(default = "default_reconnect_pause_ms")]
    pub reconnect_pause_ms: u64,
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    #[serde(default = "default_startup_probe_ms")]
    pub startup_probe_ms: u64,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default = "default_error_bucket_limit")]
    pub error_bucket_limit: usize,
    #[serde(default = "default_max_log_bytes")]
    pub max_log_bytes: u64,
    #[serde(default = "default_true")]
    pub raise_resource_limits: bool,
    #[serde(default)]
    pub start_failure_policy: StartFailurePolicy,
}

/// Returns the canonical database path: `~/.bulkimport/data/jobs.db`.
///
/// Falls back to the temporary directory when no home directory is known.
pub fn default_database_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".bulkimport").join("data"))
        .unwrap_or_else(std::env::temp_dir)
        .join("jobs.db")
}

fn default_lock_dir() -> PathBuf {
    std::env::temp_dir()
}

/// Prefers a worker binary installed next to the running executable.
fn default_worker_program() -> PathBuf {
    let name = format!("bulkimport-worker{}", std::env::consts::EXE_SUFFIX);
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
        .filter(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(name))
}

fn default_max_concurrent_workers() -> usize {
    5
}

fn default_spawn_retry_attempts() -> u32 {
    3
}

fn default_spawn_retry_delay_ms() -> u64 {
    500
}

fn default_open_retry_attempts() -> u32 {
    3
}

fn default_open_retry_delay_ms() -> u64 {
    200
}

fn default_chunk_size() -> usize {
    250
}

fn default_refresh_interval() -> u64 {
    100
}

fn default_large_job_threshold() -> u64 {
    10_000
}

fn default_reconnect_pause_ms() -> u64 {
    1000
}

fn default_kill_grace_ms() -> u64 {
    2000
}

fn default_startup_probe_ms() -> u64 {
    200
}

fn default_allowed_extensions() -> Vec<String> {
    vec!["csv".to_string(), "txt".to_string()]
}

fn default_error_bucket_limit() -> usize {
    1000
}

fn default_max_log_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            lock_dir: default_lock_dir(),
            worker_program: default_worker_program(),
            worker_args: Vec::new(),
            max_concurrent_workers: default_max_concurrent_workers(),
            spawn_retry_attempts: default_spawn_retry_attempts(),
            spawn_retry_delay_ms: default_spawn_retry_delay_ms(),
            open_retry_attempts: default_open_retry_attempts(),
            open_retry_delay_ms: default_open_retry_delay_ms(),
            default_chunk_size: default_chunk_size(),
            refresh_interval: default_refresh_interval(),
            large_job_threshold: default_large_job_threshold(),
            reconnect_pause_ms: default_reconnect_pause_ms(),
            kill_grace_ms: default_kill_grace_ms(),
            startup_probe_ms: default_startup_probe_ms(),
            allowed_extensions: default_allowed_extensions(),
            error_bucket_limit: default_error_bucket_limit(),
            max_log_bytes: default_max_log_bytes(),
            raise_resource_limits: true,
            start_failure_policy: StartFailurePolicy::default(),
        }
    }
}

impl ImporterConfig {
    pub fn spawn_retry_delay(&self) -> Duration {
        Duration::from_millis(self.spawn_retry_delay_ms)
    }

    pub fn open_retry_delay(&self) -> Duration {
        Duration::from_millis(self.open_retry_delay_ms)
    }

    pub fn reconnect_pause(&self) -> Duration {
        Duration::from_millis(self.reconnect_pause_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn startup_probe(&self) -> Duration {
        Duration::from_millis(self.startup_probe_ms)
    }

    /// Case-insensitive check against `allowed_extensions`.
    pub fn is_allowed_extension(&self, extension: &str) -> bool {
        self.allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(extension))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_serde_defaults() {
        let from_json: ImporterConfig = serde_json::from_str("{}").unwrap();
        let default = ImporterConfig::default();
        assert_eq!(from_json.max_concurrent_workers, default.max_concurrent_workers);
        assert_eq!(from_json.default_chunk_size, 250);
        assert_eq!(from_json.refresh_interval, 100);
        assert_eq!(from_json.start_failure_policy, StartFailurePolicy::KeepPending);
        assert!(from_json.raise_resource_limits);
    }

    #[test]
    fn test_start_failure_policy_snake_case() {
        let policy: StartFailurePolicy = serde_json::from_str("\"mark_failed\"").unwrap();
        assert_eq!(policy, StartFailurePolicy::MarkFailed);
    }

    #[test]
    fn test_is_allowed_extension_ignores_case() {
        let config = ImporterConfig::default();
        assert!(config.is_allowed_extension("CSV"));
        assert!(config.is_allowed_extension("txt"));
        assert!(!config.is_allowed_extension("xlsx"));
    }

    #[test]
    fn test_default_database_path() {
        let path = default_database_path();
        assert!(path.ends_with("jobs.db"));
    }
}
