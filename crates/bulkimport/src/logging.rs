//! Process-wide log setup for worker binaries and embedders.
//!
//! Library code logs through the `log` facade and `tracing` spans. [`init`]
//! installs a `tracing-subscriber` registry writing to stderr (which the
//! supervisor redirects to the job's log file) and forwards `log` records
//! into it.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Selects the stderr line format. Unset or anything else means text.
pub const ENV_LOG_FORMAT: &str = "BULKIMPORT_LOG_FORMAT";

const DEFAULT_DIRECTIVE: &str = "bulkimport=info";
const VERBOSE_DIRECTIVE: &str = "bulkimport=debug";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match std::env::var(ENV_LOG_FORMAT) {
            Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

static INSTALLED: OnceLock<bool> = OnceLock::new();

/// Installs the global subscriber once. Later calls return the first
/// result without touching the subscriber.
///
/// `RUST_LOG` overrides the default filter. Returns false if another
/// logger or subscriber was already installed by the host program.
pub fn init(verbose: bool) -> bool {
    *INSTALLED.get_or_init(|| install(verbose, LogFormat::from_env()))
}

fn install(verbose: bool, format: LogFormat) -> bool {
    if tracing_log::LogTracer::init().is_err() {
        return false;
    }

    let filter = filter(verbose);
    let registry = Registry::default().with(filter);
    let result = match format {
        LogFormat::Text => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().with_writer(std::io::stderr).with_target(true)),
        ),
        LogFormat::Json => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().json().with_writer(std::io::stderr)),
        ),
    };
    result.is_ok()
}

fn filter(verbose: bool) -> EnvFilter {
    let fallback = if verbose {
        VERBOSE_DIRECTIVE
    } else {
        DEFAULT_DIRECTIVE
    };
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.trim().is_empty() => {
            EnvFilter::try_new(&directives).unwrap_or_else(|_| EnvFilter::new(fallback))
        }
        _ => EnvFilter::new(fallback),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_log_format_from_env() {
        std::env::set_var(ENV_LOG_FORMAT, "JSON");
        assert_eq!(LogFormat::from_env(), LogFormat::Json);
        std::env::set_var(ENV_LOG_FORMAT, "text");
        assert_eq!(LogFormat::from_env(), LogFormat::Text);
        std::env::remove_var(ENV_LOG_FORMAT);
        assert_eq!(LogFormat::from_env(), LogFormat::Text);
    }

    #[test]
    #[serial]
    fn test_init_is_idempotent() {
        let first = init(false);
        assert_eq!(init(true), first);
        log::info!("logging initialized");
    }
}
