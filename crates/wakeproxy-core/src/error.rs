use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// A single invalid configuration field.
///
/// Kept separate from [`ConfigError`] so validation can collect every
/// problem in one pass instead of stopping at the first one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigProblem {
    #[error("listen port {0} is not usable (must be 1-65535)")]
    InvalidListenPort(u32),
    #[error("listen port {0} is mapped more than once")]
    DuplicatePort(u16),
    #[error("destination URL {0:?} is invalid: {1}")]
    InvalidDestination(String, String),
    #[error("no port mappings were configured")]
    NoPortMaps,
    #[error("the backend command must not be empty")]
    EmptyCommand,
    #[error("wake timeout must be greater than zero")]
    ZeroWakeTimeout,
    #[error("drain timeout must be greater than zero")]
    ZeroDrainTimeout,
    #[error("health check timeout must be greater than zero")]
    ZeroHealthCheckTimeout,
}

/// Every [`ConfigProblem`] found while validating a [`crate::Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(pub Vec<ConfigProblem>);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid configuration ({} problem(s)): ", self.0.len())?;
        for (i, problem) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{problem}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigError {}

/// The error type shared across the wakeproxy crates.
///
/// Every variant is cheap to clone: the lifecycle state machine in
/// `wakeproxy-drain` hands a single failure back to every caller that was
/// waiting on it, so the underlying `std::io::Error`/`reqwest::Error`
/// sources are captured as rendered strings rather than carried as-is.
#[derive(Debug, Clone, Error)]
pub enum WakeproxyError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to spawn backend process: {0}")]
    Spawn(String),

    #[error("backend did not report healthy within {0:?}")]
    HealthCheckTimeout(Duration),

    #[error("failed to stop backend process: {0}")]
    Stop(String),

    #[error("pid file error at {path}: {message}")]
    PidFile { path: PathBuf, message: String },
}

impl WakeproxyError {
    pub fn pid_file(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        WakeproxyError::PidFile {
            path: path.into(),
            message: err.to_string(),
        }
    }
}
