//! Identifier types for runtime entities.
//!
//! These wrap raw integers with type safety. `CownId` doubles as the sort
//! key for multi-message acquisition: every multi-message sorts its
//! participants by id, so any two messages sharing two or more cowns visit
//! them in the same order and acquisition cycles cannot form.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_COWN_ID: AtomicU64 = AtomicU64::new(1);

/// A unique, stable identifier for a cown.
///
/// Ids are allocated from a process-wide monotone counter, so they are
/// totally ordered and never reused. Id `0` is reserved to mean "no cown"
/// in the packed backpressure word.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CownId(u64);

impl CownId {
    /// Allocates a fresh id.
    #[must_use]
    pub(crate) fn next() -> Self {
        Self(NEXT_COWN_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Reconstructs an id from its raw value.
    ///
    /// Returns `None` for the reserved null id.
    #[must_use]
    pub(crate) const fn from_u64(raw: u64) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// Creates an id for testing/benchmarking purposes.
    #[doc(hidden)]
    #[must_use]
    pub const fn new_for_test(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for CownId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CownId({})", self.0)
    }
}

impl fmt::Display for CownId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// Index of a scheduler worker within its runtime.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub(crate) usize);

impl WorkerId {
    /// Returns the raw worker index.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Debug for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkerId({})", self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "W{}", self.0)
    }
}
