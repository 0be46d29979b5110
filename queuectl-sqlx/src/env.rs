//! Locations of the database, configuration file and job logs, as seen by worker processes.
use std::{ffi::OsString, path::PathBuf};

use queuectl::pool::Subprocess;

pub const DB_PATH_ENV: &str = "QUEUECTL_DB_PATH";
pub const CONFIG_PATH_ENV: &str = "QUEUECTL_CONFIG_PATH";
pub const LOG_DIR_ENV: &str = "QUEUECTL_LOG_DIR";

pub const DEFAULT_DB_PATH: &str = "queuectl.db";
pub const DEFAULT_CONFIG_PATH: &str = "queuectl_config.json";
pub const DEFAULT_LOG_DIR: &str = "job_logs";

/// Where a queue keeps its state.
///
/// Relative defaults resolve against the working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub db: PathBuf,
    pub config: PathBuf,
    pub log_dir: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            db: DEFAULT_DB_PATH.into(),
            config: DEFAULT_CONFIG_PATH.into(),
            log_dir: DEFAULT_LOG_DIR.into(),
        }
    }
}

impl Paths {
    /// Paths rooted in `dir`, using the default file names.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            db: dir.join(DEFAULT_DB_PATH),
            config: dir.join(DEFAULT_CONFIG_PATH),
            log_dir: dir.join(DEFAULT_LOG_DIR),
        }
    }

    /// Reads the paths from the environment, falling back to the defaults.
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var_os(key))
    }

    fn from_vars(var: impl Fn(&str) -> Option<OsString>) -> Self {
        let defaults = Self::default();
        Self {
            db: var(DB_PATH_ENV).map_or(defaults.db, PathBuf::from),
            config: var(CONFIG_PATH_ENV).map_or(defaults.config, PathBuf::from),
            log_dir: var(LOG_DIR_ENV).map_or(defaults.log_dir, PathBuf::from),
        }
    }

    /// Passes these paths on to every worker process `isolation` launches.
    pub fn apply(&self, isolation: Subprocess) -> Subprocess {
        isolation
            .env(DB_PATH_ENV, &self.db)
            .env(CONFIG_PATH_ENV, &self.config)
            .env(LOG_DIR_ENV, &self.log_dir)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_vars_use_defaults() {
        assert_eq!(Paths::from_vars(|_| None), Paths::default());
    }

    #[test]
    fn vars_override_defaults() {
        let paths = Paths::from_vars(|key| (key == DB_PATH_ENV).then(|| "/tmp/jobs.db".into()));

        assert_eq!(paths.db, PathBuf::from("/tmp/jobs.db"));
        assert_eq!(paths.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn in_dir_joins_default_names() {
        let paths = Paths::in_dir("/var/lib/queuectl");

        assert_eq!(paths.db, PathBuf::from("/var/lib/queuectl/queuectl.db"));
        assert_eq!(paths.log_dir, PathBuf::from("/var/lib/queuectl/job_logs"));
    }
}
