//! Multi-messages: behaviours plus their ordered participant sets.
//!
//! A behaviour is a one-shot closure that requires simultaneous exclusive
//! access to a set of cowns. The participants are sorted by id at post
//! time and acquired sequentially in that order; the shared
//! [`MessageBody`] tracks how far the acquisition has progressed. Each hop
//! of the acquisition enqueues a fresh [`MultiMessage`] referencing the
//! same body.
//!
//! A message with no body is a *token*: an in-queue sentinel used by the
//! backpressure engine to meter per-cown load.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use smallvec::SmallVec;

use crate::object::TraceStack;
use crate::runtime::cown::CownRef;
use crate::types::EpochMark;

/// A behaviour scheduled onto a set of cowns.
///
/// The behaviour runs exactly once, on the worker that acquires the last
/// participant. [`trace`](Self::trace) reports every runtime object the
/// closure captures, so in-flight behaviours keep their captures visible
/// to the leak detector.
pub trait Behaviour: Send + 'static {
    /// Pushes every runtime object captured by this behaviour.
    fn trace(&self, stack: &mut TraceStack) {
        let _ = stack;
    }

    /// Executes the behaviour. All participants are exclusively held.
    fn run(self: Box<Self>);
}

/// Adapter turning a plain closure into a [`Behaviour`].
///
/// Closure behaviours report no captures to the scanner; use a manual
/// [`Behaviour`] impl when the closure holds cown references that must
/// stay visible to the leak detector.
pub(crate) struct FnBehaviour<F: FnOnce() + Send + 'static>(pub(crate) F);

impl<F: FnOnce() + Send + 'static> Behaviour for FnBehaviour<F> {
    fn run(self: Box<Self>) {
        (self.0)();
    }
}

/// Shared state of one multi-message acquisition.
pub(crate) struct MessageBody {
    /// Participants, strictly sorted by id.
    pub(crate) cowns: SmallVec<[CownRef; 4]>,
    /// How many participants have been acquired so far.
    index: AtomicUsize,
    /// The behaviour to run once all participants are held.
    behaviour: Mutex<Option<Box<dyn Behaviour>>>,
}

impl MessageBody {
    /// Builds a body over an already-sorted participant set.
    pub(crate) fn new(cowns: SmallVec<[CownRef; 4]>, behaviour: Box<dyn Behaviour>) -> Arc<Self> {
        debug_assert!(
            cowns.windows(2).all(|w| w[0].id() < w[1].id()),
            "participants must be strictly sorted by id"
        );
        Arc::new(Self {
            cowns,
            index: AtomicUsize::new(0),
            behaviour: Mutex::new(Some(behaviour)),
        })
    }

    /// Number of participants.
    pub(crate) fn count(&self) -> usize {
        self.cowns.len()
    }

    /// Index of the next participant to acquire.
    pub(crate) fn index(&self) -> usize {
        self.index.load(Ordering::Acquire)
    }

    /// Advances to the next participant.
    pub(crate) fn advance_index(&self) {
        self.index.fetch_add(1, Ordering::AcqRel);
    }

    /// Takes the behaviour for execution.
    ///
    /// # Panics
    ///
    /// Panics if the behaviour was already taken: a body runs exactly once.
    pub(crate) fn take_behaviour(&self) -> Box<dyn Behaviour> {
        self.behaviour
            .lock()
            .expect("behaviour lock poisoned")
            .take()
            .expect("multi-message behaviour already executed")
    }

    /// Traces the behaviour's captures, if it has not run yet.
    pub(crate) fn trace_behaviour(&self, stack: &mut TraceStack) {
        if let Some(behaviour) = self
            .behaviour
            .lock()
            .expect("behaviour lock poisoned")
            .as_ref()
        {
            behaviour.trace(stack);
        }
    }
}

impl std::fmt::Debug for MessageBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBody")
            .field("count", &self.count())
            .field("index", &self.index())
            .finish_non_exhaustive()
    }
}

/// A queue element: one hop of a multi-message acquisition, or a token.
#[derive(Debug)]
pub(crate) struct MultiMessage {
    /// The shared acquisition state; `None` marks a token message.
    pub(crate) body: Option<Arc<MessageBody>>,
    /// Epoch mark at creation, for in-flight accounting during scans.
    pub(crate) epoch: EpochMark,
    /// Enqueue sequence number, stamped by the receiving queue.
    seq: AtomicU64,
}

impl MultiMessage {
    /// Creates a message hop for `body`.
    pub(crate) fn new(body: Arc<MessageBody>, epoch: EpochMark) -> Arc<Self> {
        Arc::new(Self {
            body: Some(body),
            epoch,
            seq: AtomicU64::new(0),
        })
    }

    /// Creates a token message.
    pub(crate) fn token(epoch: EpochMark) -> Arc<Self> {
        Arc::new(Self {
            body: None,
            epoch,
            seq: AtomicU64::new(0),
        })
    }

    /// Returns true if this is a token message.
    pub(crate) fn is_token(&self) -> bool {
        self.body.is_none()
    }

    pub(crate) fn set_seq(&self, seq: u64) {
        self.seq.store(seq, Ordering::Release);
    }

    /// The sequence number stamped at enqueue time.
    pub(crate) fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }
}
