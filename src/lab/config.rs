//! Configuration for the lab runtime.

/// Configuration for a [`LabRuntime`](crate::lab::LabRuntime).
#[derive(Debug, Clone)]
pub struct LabConfig {
    /// Random seed for the systematic-testing injection points.
    pub seed: u64,
    /// Enables chaotic perturbations: spurious CAS retries, forced
    /// priority escalations, and random overload flips.
    pub chaos: bool,
    /// Number of logical workers driven cooperatively.
    pub workers: usize,
    /// Maximum number of cown dispatches before a drive gives up.
    pub max_steps: Option<u64>,
}

impl LabConfig {
    /// Creates a lab configuration with the given seed.
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self {
            seed,
            chaos: false,
            workers: 1,
            max_steps: Some(1_000_000),
        }
    }

    /// Enables or disables chaotic perturbations.
    #[must_use]
    pub const fn chaos(mut self, value: bool) -> Self {
        self.chaos = value;
        self
    }

    /// Sets the number of logical workers.
    #[must_use]
    pub const fn workers(mut self, count: usize) -> Self {
        self.workers = count;
        self
    }

    /// Sets the dispatch limit.
    #[must_use]
    pub const fn max_steps(mut self, steps: u64) -> Self {
        self.max_steps = Some(steps);
        self
    }
}

impl Default for LabConfig {
    fn default() -> Self {
        Self::new(42)
    }
}
