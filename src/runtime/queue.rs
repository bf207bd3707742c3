//! Per-cown message queue facade.
//!
//! Wraps the underlying MPSC primitive with the sleep/wake protocol the
//! cown state machine depends on:
//!
//! - An empty queue whose consumer has marked it *sleeping* requires the
//!   next producer to wake and schedule the cown. Exactly one producer
//!   observes the sleeping state per sleep.
//! - An edge-triggered *notify* flag rides alongside messages: it is set
//!   by [`MessageQueue::mark_notify`] and surfaces at most once per
//!   observation, either on dequeue or when a sleep attempt fails.
//! - Every enqueue is stamped with a monotone sequence number;
//!   [`MessageQueue::peek_back`] snapshots the tail so a run loop can
//!   recognise the end of the batch that existed when it started.
//!
//! All transitions happen under one short-lived lock, which is what makes
//! "enqueue and observe sleeping" a single atomic step.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::runtime::message::MultiMessage;

/// The queue state protected by the lock.
#[derive(Debug)]
struct QueueInner {
    messages: VecDeque<Arc<MultiMessage>>,
    /// Sequence number of the most recently enqueued message.
    tail_seq: u64,
    /// Consumer marked the queue sleeping; next producer must schedule.
    sleeping: bool,
    /// Edge-triggered notification flag.
    notify: bool,
}

/// Multi-producer single-consumer message queue with a sleep/wake protocol.
#[derive(Debug)]
pub(crate) struct MessageQueue {
    inner: Mutex<QueueInner>,
}

impl MessageQueue {
    /// Creates an empty queue in the sleeping state.
    ///
    /// A fresh cown is unscheduled, so its first message must wake it.
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                messages: VecDeque::new(),
                tail_seq: 0,
                sleeping: true,
                notify: false,
            }),
        }
    }

    /// Enqueues a message, stamping its sequence number.
    ///
    /// Returns true if the queue was sleeping. In that case this producer
    /// owns the wake: it must either schedule the cown or, on the
    /// multi-message fast path, consume the message itself.
    pub(crate) fn enqueue(&self, message: Arc<MultiMessage>) -> bool {
        let mut inner = self.inner.lock().expect("message queue lock poisoned");
        inner.tail_seq += 1;
        message.set_seq(inner.tail_seq);
        let was_sleeping = inner.sleeping;
        debug_assert!(!was_sleeping || inner.messages.is_empty());
        inner.sleeping = false;
        inner.messages.push_back(message);
        was_sleeping
    }

    /// Dequeues the next message.
    ///
    /// When a message is returned, the second element surfaces the
    /// edge-triggered notify flag, cleared by the observation. An empty
    /// dequeue leaves the flag alone: it surfaces through the failed
    /// sleep attempt instead, so a notification can never be observed
    /// without the queue having been awake for it.
    pub(crate) fn dequeue(&self) -> (Option<Arc<MultiMessage>>, bool) {
        let mut inner = self.inner.lock().expect("message queue lock poisoned");
        debug_assert!(!inner.sleeping, "dequeue from a sleeping queue");
        match inner.messages.pop_front() {
            Some(message) => {
                let notify = inner.notify;
                inner.notify = false;
                (Some(message), notify)
            }
            None => (None, false),
        }
    }

    /// Pops the head without touching the notify flag.
    ///
    /// Fast-path only: the caller just won the sleeping-queue race on its
    /// own enqueue, so the head is its message and any pending
    /// notification is left for the real run loop.
    pub(crate) fn dequeue_head(&self) -> Option<Arc<MultiMessage>> {
        let mut inner = self.inner.lock().expect("message queue lock poisoned");
        debug_assert!(!inner.sleeping, "dequeue from a sleeping queue");
        inner.messages.pop_front()
    }

    /// Snapshots the tail sequence number.
    ///
    /// The run loop ends its batch after processing the message stamped
    /// with this value.
    pub(crate) fn peek_back(&self) -> u64 {
        self.inner
            .lock()
            .expect("message queue lock poisoned")
            .tail_seq
    }

    /// Attempts to put the queue to sleep.
    ///
    /// Fails (returns `false`) if a message is pending or the notify flag
    /// is set; a set notify flag is cleared and surfaced through the
    /// second element so the caller can run the notification and continue.
    /// On success the caller must stop consuming: the next producer owns
    /// the wake.
    pub(crate) fn mark_sleeping(&self) -> (bool, bool) {
        let mut inner = self.inner.lock().expect("message queue lock poisoned");
        debug_assert!(!inner.sleeping, "mark_sleeping on a sleeping queue");
        if inner.notify {
            inner.notify = false;
            return (false, true);
        }
        if !inner.messages.is_empty() {
            return (false, false);
        }
        inner.sleeping = true;
        (true, false)
    }

    /// Wakes the queue without scheduling.
    ///
    /// Returns true if the queue was sleeping; the caller then owns the
    /// schedule.
    pub(crate) fn wake(&self) -> bool {
        let mut inner = self.inner.lock().expect("message queue lock poisoned");
        let was_sleeping = inner.sleeping;
        inner.sleeping = false;
        was_sleeping
    }

    /// Sets the notify flag and wakes the queue.
    ///
    /// Returns true if the queue was sleeping; the caller then owns the
    /// schedule.
    pub(crate) fn mark_notify(&self) -> bool {
        let mut inner = self.inner.lock().expect("message queue lock poisoned");
        inner.notify = true;
        let was_sleeping = inner.sleeping;
        inner.sleeping = false;
        was_sleeping
    }

    /// Returns true if the queue is currently sleeping.
    pub(crate) fn is_sleeping(&self) -> bool {
        self.inner
            .lock()
            .expect("message queue lock poisoned")
            .sleeping
    }

    /// Drains all pending messages (teardown only).
    pub(crate) fn drain(&self) -> Vec<Arc<MultiMessage>> {
        let mut inner = self.inner.lock().expect("message queue lock poisoned");
        inner.messages.drain(..).collect()
    }

    /// Destroys the queue at collection time.
    ///
    /// # Panics
    ///
    /// Panics if any message is still pending: a cown body must not be
    /// collected with work in its queue.
    pub(crate) fn destroy(&self) {
        let inner = self.inner.lock().expect("message queue lock poisoned");
        assert!(
            inner.messages.is_empty(),
            "cown collected with non-empty queue"
        );
    }
}
