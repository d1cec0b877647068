use std::path::{Path, PathBuf};

use crate::config::schema::ImporterConfig;
use crate::error::ConfigError;

/// Names a JSON config file to load before environment overrides.
pub const ENV_CONFIG: &str = "BULKIMPORT_CONFIG";
/// Overrides `database_path`.
pub const ENV_DATABASE: &str = "BULKIMPORT_DATABASE";
/// Overrides `lock_dir`.
pub const ENV_LOCK_DIR: &str = "BULKIMPORT_LOCK_DIR";
/// Overrides `worker_program`.
pub const ENV_WORKER: &str = "BULKIMPORT_WORKER";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ImporterConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<ImporterConfig, ConfigError> {
    let config: ImporterConfig = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

/// Builds the config a worker or submitter should use: defaults, then the
/// file named by `BULKIMPORT_CONFIG`, then single-value overrides.
pub fn load_from_env() -> Result<ImporterConfig, ConfigError> {
    let mut config = match non_empty_var(ENV_CONFIG) {
        Some(path) => load_config(path)?,
        None => ImporterConfig::default(),
    };

    if let Some(path) = non_empty_var(ENV_DATABASE) {
        config.database_path = PathBuf::from(path);
    }
    if let Some(path) = non_empty_var(ENV_LOCK_DIR) {
        config.lock_dir = PathBuf::from(path);
    }
    if let Some(path) = non_empty_var(ENV_WORKER) {
        config.worker_program = PathBuf::from(path);
    }

    validate_config(&config)?;

    Ok(config)
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub fn validate_config(config: &ImporterConfig) -> Result<(), ConfigError> {
    if config.default_chunk_size == 0 {
        return Err(ConfigError::Validation {
            message: "default_chunk_size must be greater than zero".to_string(),
        });
    }

    if config.max_concurrent_workers == 0 {
        return Err(ConfigError::Validation {
            message: "max_concurrent_workers must be greater than zero".to_string(),
        });
    }

    if config.spawn_retry_attempts == 0 || config.open_retry_attempts == 0 {
        return Err(ConfigError::Validation {
            message: "retry attempts must be at least 1".to_string(),
        });
    }

    if config.allowed_extensions.is_empty() {
        return Err(ConfigError::Validation {
            message: "allowed_extensions must list at least one extension".to_string(),
        });
    }

    for ext in &config.allowed_extensions {
        if ext.is_empty() || ext.starts_with('.') {
            return Err(ConfigError::Validation {
                message: format!("Invalid extension '{}': give it without a leading dot", ext),
            });
        }
    }

    if config.worker_program.as_os_str().is_empty() {
        return Err(ConfigError::Validation {
            message: "worker_program must not be empty".to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn clear_env() {
        for name in [ENV_CONFIG, ENV_DATABASE, ENV_LOCK_DIR, ENV_WORKER] {
            std::env::remove_var(name);
        }
    }

    #[test]
    fn test_load_minimal_config() {
        let config = load_config_from_str(r#"{"max_concurrent_workers": 2}"#).unwrap();
        assert_eq!(config.max_concurrent_workers, 2);
        assert_eq!(config.default_chunk_size, 250);
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        let result = load_config_from_str(r#"{"default_chunk_size": 0}"#);
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_rejects_zero_workers() {
        let result = load_config_from_str(r#"{"max_concurrent_workers": 0}"#);
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_rejects_dotted_extension() {
        let result = load_config_from_str(r#"{"allowed_extensions": [".csv"]}"#);
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_invalid_json() {
        let result = load_config_from_str("{not json");
        assert!(matches!(result, Err(ConfigError::ParseJson(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = load_config("/nonexistent/bulkimport.json");
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        clear_env();
        let mut file = tempfile::NamedTempFile::with_suffix(".json").unwrap();
        write!(
            file,
            r#"{{"database_path": "/from/file.db", "lock_dir": "/from/file", "kill_grace_ms": 10}}"#
        )
        .unwrap();

        std::env::set_var(ENV_CONFIG, file.path());
        std::env::set_var(ENV_DATABASE, "/from/env.db");

        let config = load_from_env().unwrap();
        assert_eq!(config.database_path, PathBuf::from("/from/env.db"));
        assert_eq!(config.lock_dir, PathBuf::from("/from/file"));
        assert_eq!(config.kill_grace_ms, 10);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_env_without_file_uses_defaults() {
        clear_env();
        std::env::set_var(ENV_LOCK_DIR, "/var/tmp/locks");

        let config = load_from_env().unwrap();
        assert_eq!(config.lock_dir, PathBuf::from("/var/tmp/locks"));
        assert_eq!(config.max_concurrent_workers, 5);

        clear_env();
    }
}
