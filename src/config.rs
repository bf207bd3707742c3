//! Runtime configuration with environment variable overrides.
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic** — values set via builder methods (`worker_threads(4)`)
//! 2. **Environment variables** — values from `COWNS_*` env vars
//! 3. **Defaults** — built-in defaults from [`RuntimeConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `COWNS_WORKER_THREADS` | `usize` | `worker_threads` |
//! | `COWNS_THREAD_NAME_PREFIX` | `String` | `thread_name_prefix` |
//! | `COWNS_MUTE_CHECK_INTERVAL` | `usize` | `mute_check_interval` |

use crate::error::BuildError;

/// Environment variable name for the worker thread count.
pub const ENV_WORKER_THREADS: &str = "COWNS_WORKER_THREADS";
/// Environment variable name for the worker thread name prefix.
pub const ENV_THREAD_NAME_PREFIX: &str = "COWNS_THREAD_NAME_PREFIX";
/// Environment variable name for the mute-set check interval.
pub const ENV_MUTE_CHECK_INTERVAL: &str = "COWNS_MUTE_CHECK_INTERVAL";

/// Configuration for a [`Runtime`](crate::runtime::Runtime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Number of scheduler workers.
    pub worker_threads: usize,
    /// Name prefix for spawned worker threads.
    pub thread_name_prefix: String,
    /// How many scheduler iterations pass between mute-set checks.
    ///
    /// `1` checks on every iteration; larger values amortize the check.
    pub mute_check_interval: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: 1,
            thread_name_prefix: "cowns-worker".into(),
            mute_check_interval: 1,
        }
    }
}

impl RuntimeConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of scheduler workers.
    #[must_use]
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count;
        self
    }

    /// Sets the worker thread name prefix.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Sets the mute-set check interval.
    #[must_use]
    pub fn mute_check_interval(mut self, interval: usize) -> Self {
        self.mute_check_interval = interval;
        self
    }

    /// Applies `COWNS_*` environment variable overrides.
    ///
    /// Only variables that are set in the environment are applied.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::InvalidEnvValue`] if a variable is set but
    /// contains an unparseable value.
    pub fn apply_env_overrides(mut self) -> Result<Self, BuildError> {
        if let Some(value) = read_env(ENV_WORKER_THREADS) {
            self.worker_threads = parse_usize(ENV_WORKER_THREADS, &value)?;
        }
        if let Some(value) = read_env(ENV_THREAD_NAME_PREFIX) {
            self.thread_name_prefix = value;
        }
        if let Some(value) = read_env(ENV_MUTE_CHECK_INTERVAL) {
            self.mute_check_interval = parse_usize(ENV_MUTE_CHECK_INTERVAL, &value)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::InvalidWorkerCount`] if the worker count is zero.
    pub fn validate(&self) -> Result<(), BuildError> {
        if self.worker_threads == 0 {
            return Err(BuildError::InvalidWorkerCount);
        }
        Ok(())
    }
}

fn read_env(var: &'static str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

fn parse_usize(var: &'static str, value: &str) -> Result<usize, BuildError> {
    value.parse().map_err(|_| BuildError::InvalidEnvValue {
        var,
        value: value.to_string(),
    })
}
