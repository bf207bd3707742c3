//! Object-graph contracts: user state, tracing, and reachable kinds.
//!
//! A cown's data participates in two graph walks: the leak detector's
//! epoch scan and teardown-time release. Both walk the graph through the
//! [`CownState::trace`] hook, which pushes every directly reachable
//! runtime object onto a [`TraceStack`]. Reachable objects carry a kind
//! discriminator — iso region root, refcounted immutable, or cown — and
//! the walker dispatches on it.
//!
//! Release does not go through `trace`: dropping the data releases the
//! references it holds, which is the ordinary ownership path in Rust.
//! `trace` is used for scanning only.

use std::any::Any;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::runtime::cown::CownRef;
use crate::types::EpochMark;

/// User state held by a cown.
///
/// The state is owned by the cown and mutated only by the worker currently
/// running it. The hooks:
///
/// - [`trace`](Self::trace): push every reachable runtime object, so the
///   leak detector can find cycles through this state.
/// - [`finalise`](Self::finalise): called once when the cown body is
///   collected, before the state is dropped.
/// - [`notified`](Self::notified): called when the cown's notify flag
///   surfaces in its run loop.
pub trait CownState: Send + 'static {
    /// Pushes every runtime object directly reachable from this state.
    fn trace(&self, stack: &mut TraceStack) {
        let _ = stack;
    }

    /// Runs once when the cown body is collected.
    fn finalise(&mut self) {}

    /// Runs when an edge-triggered notification surfaces on the cown.
    fn notified(&mut self) {}
}

/// Object-safe extension of [`CownState`] that supports downcasting.
pub(crate) trait AnyCownState: CownState {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: CownState> AnyCownState for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A runtime object reachable from a cown's state or a behaviour closure.
#[derive(Clone)]
pub enum Traced {
    /// The root of an iso region.
    Region(RegionRef),
    /// A refcounted immutable.
    Imm(ImmRef),
    /// Another cown.
    Cown(CownRef),
}

impl std::fmt::Debug for Traced {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Region(_) => write!(f, "Traced::Region"),
            Self::Imm(_) => write!(f, "Traced::Imm"),
            Self::Cown(c) => write!(f, "Traced::Cown({})", c.id()),
        }
    }
}

/// Work stack for object-graph walks.
#[derive(Debug, Default)]
pub struct TraceStack {
    entries: Vec<Traced>,
}

impl TraceStack {
    /// Creates an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a reachable object.
    pub fn push(&mut self, entry: Traced) {
        self.entries.push(entry);
    }

    /// Pushes a reachable cown.
    pub fn push_cown(&mut self, cown: &CownRef) {
        self.entries.push(Traced::Cown(cown.clone()));
    }

    /// Pops the next entry to visit.
    pub(crate) fn pop(&mut self) -> Option<Traced> {
        self.entries.pop()
    }

    /// Returns true if the stack is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A handle to a refcounted immutable object.
///
/// Immutables are frozen object graphs shared between cowns. The handle is
/// the unit of reference counting: cloning acquires, dropping releases.
/// Immutables may reach cowns, so the scan recurses through their
/// contents.
#[derive(Clone)]
pub struct ImmRef {
    inner: Arc<ImmNode>,
}

struct ImmNode {
    mark: AtomicU8,
    reaches: Mutex<Vec<Traced>>,
}

impl ImmRef {
    /// Freezes a graph fragment that reaches the given objects.
    #[must_use]
    pub fn new(reaches: Vec<Traced>) -> Self {
        Self {
            inner: Arc::new(ImmNode {
                mark: AtomicU8::new(EpochMark::EpochNone as u8),
                reaches: Mutex::new(reaches),
            }),
        }
    }

    /// Marks this immutable in `epoch` and pushes its contents for
    /// scanning. Idempotent within an epoch.
    pub(crate) fn mark_and_scan(&self, epoch: EpochMark, stack: &mut TraceStack) {
        let prev = self.inner.mark.swap(epoch as u8, Ordering::AcqRel);
        if EpochMark::from_u8(prev) == epoch {
            return;
        }
        let reaches = self.inner.reaches.lock().expect("immutable lock poisoned");
        for entry in reaches.iter() {
            stack.push(entry.clone());
        }
    }

    /// Current number of handles to this immutable.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

/// A handle to the root of an iso region.
///
/// A region is a bulk-owned heap fragment with a single entry point. The
/// last handle dropping releases the whole region. Regions may reach
/// cowns, so the scan recurses through their contents.
#[derive(Clone)]
pub struct RegionRef {
    inner: Arc<RegionNode>,
}

struct RegionNode {
    mark: AtomicU8,
    contents: Mutex<Vec<Traced>>,
}

impl RegionRef {
    /// Creates a region whose objects reach the given runtime objects.
    #[must_use]
    pub fn new(contents: Vec<Traced>) -> Self {
        Self {
            inner: Arc::new(RegionNode {
                mark: AtomicU8::new(EpochMark::EpochNone as u8),
                contents: Mutex::new(contents),
            }),
        }
    }

    /// Marks this region in `epoch` and pushes its contents for scanning.
    /// Idempotent within an epoch.
    pub(crate) fn cown_scan(&self, epoch: EpochMark, stack: &mut TraceStack) {
        let prev = self.inner.mark.swap(epoch as u8, Ordering::AcqRel);
        if EpochMark::from_u8(prev) == epoch {
            return;
        }
        let contents = self.inner.contents.lock().expect("region lock poisoned");
        for entry in contents.iter() {
            stack.push(entry.clone());
        }
    }
}
