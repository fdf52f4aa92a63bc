//! Daemon configuration.
//!
//! Built once per process from the environment (optionally seeded from an env
//! file) and handed to each component at construction time.
//!
//! | Variable | Default |
//! |---|---|
//! | `SOKRATES_CONFIG_FILEPATH` | `~/.sokrates/.env` |
//! | `SOKRATES_DATABASE_PATH` | `~/.sokrates/sokrates_database.sqlite` |
//! | `SOKRATES_TASK_QUEUE_DAEMON_LOGFILE_PATH` | `~/.sokrates/logs/daemon.log` |
//! | `SOKRATES_TASK_QUEUE_DAEMON_PROCESSING_INTERVAL` | `15` (seconds) |
//! | `SOKRATES_TASK_QUEUE_MAX_ATTEMPTS` | `3` |
//! | `SOKRATES_TASK_QUEUE_RETRY_BASE_DELAY_MS` | `5000` |
//! | `SOKRATES_TASK_QUEUE_RETRY_MAX_DELAY_MS` | `300000` |
//! | `SOKRATES_TASK_QUEUE_INTER_TASK_DELAY_MS` | `1000` |
//! | `SOKRATES_TASK_QUEUE_BATCH_LIMIT` | unset (all pending) |
//! | `SOKRATES_SUBTASK_COMMAND` | unset |
//! | `SOKRATES_TASK_RESULTS_DIR` | `~/.sokrates/tasks/results` |

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use sokrates_queue::{ProcessorConfig, RetryPolicy};

pub const CONFIG_FILEPATH: &str = "SOKRATES_CONFIG_FILEPATH";
pub const DATABASE_PATH: &str = "SOKRATES_DATABASE_PATH";
pub const DAEMON_LOGFILE_PATH: &str = "SOKRATES_TASK_QUEUE_DAEMON_LOGFILE_PATH";
pub const PROCESSING_INTERVAL: &str = "SOKRATES_TASK_QUEUE_DAEMON_PROCESSING_INTERVAL";
pub const MAX_ATTEMPTS: &str = "SOKRATES_TASK_QUEUE_MAX_ATTEMPTS";
pub const RETRY_BASE_DELAY_MS: &str = "SOKRATES_TASK_QUEUE_RETRY_BASE_DELAY_MS";
pub const RETRY_MAX_DELAY_MS: &str = "SOKRATES_TASK_QUEUE_RETRY_MAX_DELAY_MS";
pub const INTER_TASK_DELAY_MS: &str = "SOKRATES_TASK_QUEUE_INTER_TASK_DELAY_MS";
pub const BATCH_LIMIT: &str = "SOKRATES_TASK_QUEUE_BATCH_LIMIT";
pub const SUBTASK_COMMAND: &str = "SOKRATES_SUBTASK_COMMAND";
pub const RESULTS_DIR: &str = "SOKRATES_TASK_RESULTS_DIR";

const DEFAULT_INTERVAL_SECS: u64 = 15;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine the home directory")]
    NoHomeDir,
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("failed to load env file {}: {message}", path.display())]
    EnvFile { path: PathBuf, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    /// `~/.sokrates`
    pub home_dir: PathBuf,
    pub database_path: PathBuf,
    pub log_file: PathBuf,
    pub processing_interval: Duration,
    pub retry_policy: RetryPolicy,
    pub inter_task_delay: Duration,
    pub batch_limit: Option<usize>,
    /// Shell command run once per subtask.
    pub subtask_command: Option<String>,
    pub results_dir: PathBuf,
}

impl DaemonConfig {
    /// Load the env file (if any) and read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = dirs::home_dir()
            .ok_or(ConfigError::NoHomeDir)?
            .join(".sokrates");

        let env_file = std::env::var_os(CONFIG_FILEPATH)
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(".env"));
        load_env_file(&env_file)?;

        Self::from_lookup(&home, |key| std::env::var(key).ok())
    }

    /// Build a config from `lookup` with defaults rooted at `home`.
    ///
    /// Blank values count as unset.
    pub fn from_lookup<F>(home: &Path, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let path_or = |key: &str, default: PathBuf| get(key).map(PathBuf::from).unwrap_or(default);

        let interval_secs: u64 = parse_or(PROCESSING_INTERVAL, get(PROCESSING_INTERVAL), DEFAULT_INTERVAL_SECS)?;
        if interval_secs == 0 {
            return Err(invalid(PROCESSING_INTERVAL, "0"));
        }

        let defaults = RetryPolicy::default();
        let max_attempts: u32 = parse_or(MAX_ATTEMPTS, get(MAX_ATTEMPTS), defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(invalid(MAX_ATTEMPTS, "0"));
        }
        let base_ms: u64 = parse_or(
            RETRY_BASE_DELAY_MS,
            get(RETRY_BASE_DELAY_MS),
            millis(defaults.base_delay),
        )?;
        let max_ms: u64 = parse_or(
            RETRY_MAX_DELAY_MS,
            get(RETRY_MAX_DELAY_MS),
            millis(defaults.max_delay),
        )?;
        let inter_task_ms: u64 = parse_or(INTER_TASK_DELAY_MS, get(INTER_TASK_DELAY_MS), 1000)?;

        let batch_limit = match get(BATCH_LIMIT) {
            Some(raw) => Some(parse(BATCH_LIMIT, &raw)?),
            None => None,
        };

        Ok(Self {
            home_dir: home.to_path_buf(),
            database_path: path_or(DATABASE_PATH, home.join("sokrates_database.sqlite")),
            log_file: path_or(DAEMON_LOGFILE_PATH, home.join("logs").join("daemon.log")),
            processing_interval: Duration::from_secs(interval_secs),
            retry_policy: RetryPolicy::exponential(
                max_attempts,
                Duration::from_millis(base_ms),
                Duration::from_millis(max_ms),
            ),
            inter_task_delay: Duration::from_millis(inter_task_ms),
            batch_limit,
            subtask_command: get(SUBTASK_COMMAND),
            results_dir: path_or(RESULTS_DIR, home.join("tasks").join("results")),
        })
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            retry_policy: self.retry_policy.clone(),
            inter_task_delay: self.inter_task_delay,
        }
    }

    /// The subtask command; the daemon cannot run without one.
    pub fn require_subtask_command(&self) -> Result<&str, ConfigError> {
        self.subtask_command
            .as_deref()
            .ok_or(ConfigError::Missing(SUBTASK_COMMAND))
    }
}

/// Load `KEY=value` pairs into the environment. A missing file is fine;
/// variables already set are not overridden.
fn load_env_file(path: &Path) -> Result<(), ConfigError> {
    match dotenvy::from_path(path) {
        Ok(()) => Ok(()),
        Err(dotenvy::Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ConfigError::EnvFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        }),
    }
}

fn parse<T: FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| invalid(key, raw))
}

fn parse_or<T: FromStr>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError> {
    match raw {
        Some(raw) => parse(key, &raw),
        None => Ok(default),
    }
}

fn invalid(key: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_with(vars: &[(&str, &str)]) -> Result<DaemonConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DaemonConfig::from_lookup(Path::new("/home/ada/.sokrates"), |key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_live_under_the_home_dir() {
        let config = config_with(&[]).unwrap();

        assert_eq!(
            config.database_path,
            PathBuf::from("/home/ada/.sokrates/sokrates_database.sqlite")
        );
        assert_eq!(config.log_file, PathBuf::from("/home/ada/.sokrates/logs/daemon.log"));
        assert_eq!(config.processing_interval, Duration::from_secs(15));
        assert_eq!(config.retry_policy.max_attempts, 3);
        assert_eq!(config.retry_policy.base_delay, Duration::from_secs(5));
        assert_eq!(config.inter_task_delay, Duration::from_secs(1));
        assert_eq!(config.batch_limit, None);
        assert_eq!(config.subtask_command, None);
    }

    #[test]
    fn overrides_are_applied() {
        let config = config_with(&[
            (DATABASE_PATH, "/data/q.sqlite"),
            (PROCESSING_INTERVAL, "60"),
            (MAX_ATTEMPTS, "5"),
            (RETRY_BASE_DELAY_MS, "100"),
            (BATCH_LIMIT, "10"),
            (SUBTASK_COMMAND, "llm-run --model small"),
            (INTER_TASK_DELAY_MS, "0"),
        ])
        .unwrap();

        assert_eq!(config.database_path, PathBuf::from("/data/q.sqlite"));
        assert_eq!(config.processing_interval, Duration::from_secs(60));
        assert_eq!(config.retry_policy.max_attempts, 5);
        assert_eq!(config.retry_policy.base_delay, Duration::from_millis(100));
        assert_eq!(config.batch_limit, Some(10));
        assert_eq!(config.require_subtask_command().unwrap(), "llm-run --model small");
        assert_eq!(config.processor_config().inter_task_delay, Duration::ZERO);
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = config_with(&[(PROCESSING_INTERVAL, "soon")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid { key: PROCESSING_INTERVAL, ref value } if value == "soon"
        ));

        assert!(matches!(
            config_with(&[(MAX_ATTEMPTS, "0")]),
            Err(ConfigError::Invalid { key: MAX_ATTEMPTS, .. })
        ));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = config_with(&[(SUBTASK_COMMAND, "   "), (PROCESSING_INTERVAL, "")]).unwrap();
        assert!(matches!(
            config.require_subtask_command(),
            Err(ConfigError::Missing(SUBTASK_COMMAND))
        ));
        assert_eq!(config.processing_interval, Duration::from_secs(15));
    }

    #[test]
    fn missing_env_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_env_file(&dir.path().join("absent.env")).is_ok());
    }
}
