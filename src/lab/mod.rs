//! Deterministic lab runtime for testing.
//!
//! The lab drives a [`Runtime`]'s workers cooperatively on the calling
//! thread: no worker threads, no wall-clock dependence, and every
//! randomized decision drawn from a seeded deterministic RNG. The same
//! seed reproduces the same execution, including the chaotic
//! perturbations injected at the systematic-testing points.

mod config;
pub(crate) mod systematic;

pub use config::LabConfig;

use std::sync::Arc;

use crate::runtime::cown::CownRef;
use crate::runtime::pool::{run_one, Runtime};
use crate::runtime::worker;
use crate::tracing_compat::debug;

/// A deterministic, single-thread driver for a [`Runtime`].
#[derive(Debug)]
pub struct LabRuntime {
    runtime: Runtime,
    config: LabConfig,
    steps: u64,
}

impl LabRuntime {
    /// Creates a lab runtime with the given configuration.
    ///
    /// # Panics
    ///
    /// Panics if the derived runtime configuration is invalid (zero
    /// workers).
    #[must_use]
    pub fn new(config: LabConfig) -> Self {
        let runtime = Runtime::new(
            crate::config::RuntimeConfig::new().worker_threads(config.workers.max(1)),
        )
        .expect("lab runtime config is valid");
        Self {
            runtime,
            config,
            steps: 0,
        }
    }

    /// Creates a lab runtime with the default configuration and the given
    /// seed.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self::new(LabConfig::new(seed))
    }

    /// The underlying runtime handle.
    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Total cown dispatches executed so far.
    #[must_use]
    pub const fn steps(&self) -> u64 {
        self.steps
    }

    /// Creates a cown on the lab's runtime.
    #[must_use]
    pub fn create_cown<T: crate::object::CownState>(&self, data: T) -> CownRef {
        self.runtime.create_cown(data)
    }

    /// Drives every worker until no cown is scheduled anywhere.
    ///
    /// Returns the number of cown dispatches executed. Stops early if the
    /// configured step limit is reached.
    pub fn run_until_quiescent(&mut self) -> u64 {
        let rt = Arc::clone(self.runtime.inner());
        systematic::install(self.config.seed.wrapping_add(self.steps), self.config.chaos);

        let mut executed: u64 = 0;
        'drive: loop {
            let mut progressed = false;
            for w in rt.workers() {
                let guard = worker::enter(Arc::clone(w), Arc::clone(&rt));
                w.check_mute_sets();
                while let Some(cown) = w.pop().or_else(|| rt.injector_pop()) {
                    run_one(w, cown);
                    executed += 1;
                    progressed = true;
                    if self
                        .config
                        .max_steps
                        .is_some_and(|max| self.steps + executed >= max)
                    {
                        debug!(executed, "lab step limit reached");
                        drop(guard);
                        break 'drive;
                    }
                }
                drop(guard);
            }
            if !progressed && rt.runqueues_empty() {
                break;
            }
        }

        systematic::clear();
        self.steps += executed;
        executed
    }

    /// Runs a full leak-detection pass: pre-scan, epoch advance and scan
    /// from `roots`, then sweep.
    ///
    /// Cowns unreachable from the roots, from scheduled work, and from
    /// in-flight messages are collected.
    pub fn collect_garbage(&mut self, roots: &[CownRef]) {
        self.runtime.ld_prescan();
        self.run_until_quiescent();

        self.runtime.ld_scan(roots);
        self.run_until_quiescent();
        debug_assert_eq!(
            self.runtime.debug_inflight_messages(),
            0,
            "scan left messages in flight"
        );

        self.runtime.ld_sweep();
    }
}
