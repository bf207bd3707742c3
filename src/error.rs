//! Error types for the public surface of the runtime.
//!
//! The core scheduling machinery treats invariant violations as
//! assertion-class failures (they panic). The errors here cover the
//! recoverable, caller-facing edges: posting work to a runtime that is
//! tearing down, and invalid configuration.

use thiserror::Error;

/// Error returned when posting work to the runtime fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// The runtime is tearing down and no longer accepts behaviours.
    #[error("runtime teardown in progress")]
    Teardown,
    /// A behaviour was scheduled with no participant cowns.
    #[error("behaviour scheduled with an empty cown set")]
    NoParticipants,
}

/// Error returned when building a [`RuntimeConfig`](crate::config::RuntimeConfig).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    /// Worker count must be at least one.
    #[error("worker count must be at least 1")]
    InvalidWorkerCount,
    /// An environment variable was set but could not be parsed.
    #[error("invalid value {value:?} for {var}")]
    InvalidEnvValue {
        /// The environment variable name.
        var: &'static str,
        /// The unparseable value.
        value: String,
    },
}
