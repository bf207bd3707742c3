//! Cowns: a concurrent-owner actor runtime core.
//!
//! A *cown* (concurrent owner) encapsulates state that at any moment may
//! be accessed by at most one scheduler worker. Work is submitted as
//! *multi-messages*: behaviours that require simultaneous exclusive
//! access to an ordered set of cowns. The runtime serialises, sequences,
//! and schedules that work deadlock-free, applies backpressure to
//! overloaded cowns, and collects cyclic garbage among actor references.
//!
//! # Core Guarantees
//!
//! - **Single runner**: a cown runs on at most one worker at a time;
//!   within a behaviour, access to every participant is exclusive.
//! - **No deadlock**: participants are acquired in a global sort order,
//!   so acquisition cycles cannot form; priority escalation walks the
//!   blocker chain to keep muted participants from stalling escalated
//!   work.
//! - **Backpressure**: overloaded cowns mute their senders; token
//!   messages meter load and demote priorities once pressure subsides.
//! - **Cycle collection**: an epoch-based leak detector traces live
//!   cowns and collects unreachable cycles, including the references
//!   captured by in-flight behaviours.
//! - **Deterministic testing**: a lab runtime drives workers on one
//!   thread with seeded randomness at every injection point.
//!
//! # Module Structure
//!
//! - [`runtime`]: the scheduling core (cowns, queues, multi-messages,
//!   backpressure, workers, the runtime pool)
//! - [`object`]: user-state and tracing contracts
//! - [`lab`]: deterministic lab runtime for testing
//! - [`config`]: runtime configuration with environment overrides
//! - [`types`]: identifiers and leak-detector enums
//! - [`error`]: typed errors for the public surface
//! - [`tracing_compat`]: feature-gated structured logging
//!
//! # Example
//!
//! ```
//! use cowns::schedule_fn;
//!
//! struct Counter(u64);
//! impl cowns::CownState for Counter {}
//!
//! let mut lab = cowns::lab::LabRuntime::with_seed(7);
//! let counter = lab.create_cown(Counter(0));
//!
//! let c = counter.clone();
//! schedule_fn(&[counter.clone()], move || {
//!     c.with_mut(|state: &mut Counter| state.0 += 1);
//! })
//! .unwrap();
//!
//! lab.run_until_quiescent();
//! assert_eq!(counter.with(|state: &Counter| state.0), 1);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod config;
pub mod error;
pub mod lab;
pub mod object;
pub mod runtime;
pub mod tracing_compat;
pub mod types;

pub(crate) mod util;

#[cfg(test)]
pub mod test_utils;

pub use config::RuntimeConfig;
pub use error::{BuildError, ScheduleError};
pub use object::{CownState, ImmRef, RegionRef, TraceStack, Traced};
pub use runtime::{schedule, schedule_fn, Behaviour, CownRef, CownWeak, Priority, Runtime};
pub use types::{CownId, EpochMark, LdPhase};
