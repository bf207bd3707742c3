//! Scheduler workers and the thread-local worker context.
//!
//! A worker owns a runqueue of scheduled cowns, the list of cowns created
//! on it (for sweeping and teardown), and a mute map parking low-priority
//! senders under the overloaded cown that muted them.
//!
//! While a thread drives a worker it installs a thread-local context;
//! the core reads the context for the per-run slots the protocol needs:
//! the body of the behaviour currently executing (for backpressure scans)
//! and the mutor it selected (applied when the behaviour completes).

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use smallvec::SmallVec;

use crate::runtime::backpressure::Priority;
use crate::runtime::cown::{Cown, CownRef, CownWeak};
use crate::runtime::message::MessageBody;
use crate::runtime::pool::RuntimeInner;
use crate::tracing_compat::{debug, trace};

/// Senders parked under one mutor.
#[derive(Debug)]
struct MuteEntry {
    mutor: CownWeak,
    muted: SmallVec<[CownRef; 4]>,
}

/// One scheduler worker.
#[derive(Debug)]
pub(crate) struct Worker {
    /// Index within the runtime's worker set.
    pub(crate) index: usize,
    /// Scheduled cowns. FIFO for ordinary schedules; the front doubles as
    /// the LIFO end for latency-sensitive wakes.
    runq: Mutex<VecDeque<CownRef>>,
    /// Parking for idle worker threads.
    pub(crate) parker: Parker,
    /// Cowns created on this worker, for sweep and teardown walks.
    list: Mutex<Vec<Weak<Cown>>>,
    /// Mutor id -> parked senders.
    mute_map: parking_lot::Mutex<std::collections::HashMap<u64, MuteEntry>>,
    /// Stubs reclaimed and awaiting accounting.
    pub(crate) free_cowns: AtomicUsize,
    /// Cowns ever created on this worker.
    pub(crate) total_cowns: AtomicUsize,
}

impl Worker {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            runq: Mutex::new(VecDeque::new()),
            parker: Parker::new(),
            list: Mutex::new(Vec::new()),
            mute_map: parking_lot::Mutex::new(std::collections::HashMap::new()),
            free_cowns: AtomicUsize::new(0),
            total_cowns: AtomicUsize::new(0),
        }
    }

    /// Appends a cown to the runqueue.
    pub(crate) fn schedule_fifo(&self, cown: CownRef) {
        trace!(worker = self.index, cown = %cown.id(), "schedule fifo");
        self.runq
            .lock()
            .expect("runqueue lock poisoned")
            .push_back(cown);
        self.parker.unpark();
    }

    /// Pops the next scheduled cown.
    pub(crate) fn pop(&self) -> Option<CownRef> {
        self.runq
            .lock()
            .expect("runqueue lock poisoned")
            .pop_front()
    }

    /// Returns true if no cown is scheduled on this worker.
    pub(crate) fn runq_is_empty(&self) -> bool {
        self.runq.lock().expect("runqueue lock poisoned").is_empty()
    }

    /// Drops every scheduled cown (teardown).
    pub(crate) fn drain_runq(&self) -> Vec<CownRef> {
        self.runq
            .lock()
            .expect("runqueue lock poisoned")
            .drain(..)
            .collect()
    }

    /// Records a cown created on this worker.
    pub(crate) fn add_local_cown(&self, cown: Weak<Cown>) {
        self.list
            .lock()
            .expect("cown list lock poisoned")
            .push(cown);
    }

    /// Prunes reclaimed stubs from the local list and unregisters them.
    pub(crate) fn collect_cown_stubs(&self, rt: &RuntimeInner) {
        let mut list = self.list.lock().expect("cown list lock poisoned");
        list.retain(|entry| match entry.upgrade() {
            None => false,
            Some(cown) => {
                if cown.weak_count() == 0 {
                    rt.unregister_cown(cown.id);
                    false
                } else {
                    true
                }
            }
        });
    }

    /// Parks the senders of a completed behaviour under `mutor`.
    ///
    /// Senders that have been escalated are kept runnable: muting them
    /// would undermine the deadlock-avoidance raise. Returns true if the
    /// currently running cown (`current`) was muted.
    pub(crate) fn mute(&self, mutor: CownWeak, body: &MessageBody, current: crate::types::CownId) -> bool {
        let mutor_id = mutor.id();
        let mut current_muted = false;
        let mut parked: SmallVec<[CownRef; 4]> = SmallVec::new();

        for sender in &body.cowns {
            if sender.priority().is_high() {
                if sender.id() != current {
                    Cown::schedule(&sender.inner);
                }
                continue;
            }
            let prev = Cown::backpressure_transition(&sender.inner, Priority::Low, false);
            if prev == Priority::Low {
                // Already parked under another mutor.
                continue;
            }
            debug!(worker = self.index, cown = %sender.id(), mutor = %mutor_id, "muted");
            if sender.id() == current {
                current_muted = true;
            }
            parked.push(sender.clone());
        }

        let leftover_mutor = {
            let mut map = self.mute_map.lock();
            if let Some(entry) = map.get_mut(&mutor_id.as_u64()) {
                entry.muted.extend(parked);
                Some(mutor)
            } else {
                map.insert(
                    mutor_id.as_u64(),
                    MuteEntry {
                        mutor,
                        muted: parked,
                    },
                );
                None
            }
        };
        drop(leftover_mutor);

        current_muted
    }

    /// Unmutes every set whose mutor has stopped triggering muting.
    ///
    /// Each unmuted cown transitions `Low -> Normal`, which wakes its
    /// queue and schedules it exactly once.
    pub(crate) fn check_mute_sets(&self) {
        let released: Vec<MuteEntry> = {
            let mut map = self.mute_map.lock();
            if map.is_empty() {
                return;
            }
            let release_keys: Vec<u64> = map
                .iter()
                .filter_map(|(key, entry)| {
                    let still_muting = entry
                        .mutor
                        .upgrade()
                        .is_some_and(|mutor| mutor.inner.triggers_muting());
                    (!still_muting).then_some(*key)
                })
                .collect();
            release_keys
                .into_iter()
                .filter_map(|key| map.remove(&key))
                .collect()
        };

        for entry in released {
            debug!(worker = self.index, mutor = %entry.mutor.id(), count = entry.muted.len(), "unmuting");
            for cown in entry.muted {
                Cown::backpressure_transition(&cown.inner, Priority::Normal, false);
                drop(cown);
            }
            drop(entry.mutor);
        }
    }

    /// Drops every mute entry (teardown).
    pub(crate) fn drain_mute_map(&self) {
        let entries: Vec<MuteEntry> = {
            let mut map = self.mute_map.lock();
            map.drain().map(|(_, entry)| entry).collect()
        };
        drop(entries);
    }
}

/// A mechanism for parking and unparking a worker thread.
#[derive(Debug, Clone)]
pub(crate) struct Parker {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Parker {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// Parks the current thread with a timeout.
    pub(crate) fn park_timeout(&self, duration: Duration) {
        let (lock, cvar) = &*self.inner;
        let mut notified = lock.lock().expect("parker lock poisoned");
        if !*notified {
            let (guard, _) = cvar
                .wait_timeout(notified, duration)
                .expect("parker lock poisoned");
            notified = guard;
        }
        *notified = false;
    }

    /// Unparks a parked thread.
    pub(crate) fn unpark(&self) {
        let (lock, cvar) = &*self.inner;
        {
            let mut notified = lock.lock().expect("parker lock poisoned");
            *notified = true;
        }
        cvar.notify_one();
    }
}

// ---- thread-local worker context ----

thread_local! {
    static ACTIVE: RefCell<Option<(Arc<Worker>, Arc<RuntimeInner>)>> = const { RefCell::new(None) };
    static MESSAGE_BODY: RefCell<Option<Arc<MessageBody>>> = const { RefCell::new(None) };
    static MUTOR: RefCell<Option<CownWeak>> = const { RefCell::new(None) };
    static IN_SWEEP: Cell<bool> = const { Cell::new(false) };
}

/// Guard keeping a worker context installed on the current thread.
pub(crate) struct ActiveGuard;

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let prev_active = ACTIVE.with(|c| c.borrow_mut().take());
        let prev_body = MESSAGE_BODY.with(|c| c.borrow_mut().take());
        let prev_mutor = MUTOR.with(|c| c.borrow_mut().take());
        IN_SWEEP.with(|c| c.set(false));
        drop(prev_body);
        drop(prev_mutor);
        drop(prev_active);
    }
}

/// Installs `worker` as the current thread's worker.
pub(crate) fn enter(worker: Arc<Worker>, rt: Arc<RuntimeInner>) -> ActiveGuard {
    ACTIVE.with(|c| {
        let mut slot = c.borrow_mut();
        debug_assert!(slot.is_none(), "worker context already installed");
        *slot = Some((worker, rt));
    });
    ActiveGuard
}

/// The current thread's worker, if it is driving one.
pub(crate) fn current_worker() -> Option<Arc<Worker>> {
    ACTIVE.with(|c| c.borrow().as_ref().map(|(w, _)| Arc::clone(w)))
}

/// The current worker's index, if any.
pub(crate) fn current_worker_index() -> Option<usize> {
    ACTIVE.with(|c| c.borrow().as_ref().map(|(w, _)| w.index))
}

/// Records the body of the behaviour now executing.
pub(crate) fn set_message_body(body: Arc<MessageBody>) {
    let prev = MESSAGE_BODY.with(|c| c.borrow_mut().replace(body));
    drop(prev);
}

/// Clears the executing-behaviour slot.
pub(crate) fn clear_message_body() {
    let prev = MESSAGE_BODY.with(|c| c.borrow_mut().take());
    drop(prev);
}

/// The body of the behaviour currently executing on this thread.
pub(crate) fn current_message_body() -> Option<Arc<MessageBody>> {
    MESSAGE_BODY.with(|c| c.borrow().clone())
}

/// Stores the mutor selected by a backpressure scan.
pub(crate) fn set_mutor(mutor: CownWeak) {
    let prev = MUTOR.with(|c| c.borrow_mut().replace(mutor));
    debug_assert!(prev.is_none(), "mutor already set for this behaviour");
    drop(prev);
}

/// True if a mutor has been selected for the executing behaviour.
pub(crate) fn has_mutor() -> bool {
    MUTOR.with(|c| c.borrow().is_some())
}

/// Takes the selected mutor, if any.
pub(crate) fn take_mutor() -> Option<CownWeak> {
    MUTOR.with(|c| c.borrow_mut().take())
}

/// True while the current thread is sweeping for the leak detector.
pub(crate) fn in_sweep() -> bool {
    IN_SWEEP.with(Cell::get)
}

/// Marks the current thread as (not) sweeping.
pub(crate) fn set_in_sweep(value: bool) {
    IN_SWEEP.with(|c| c.set(value));
}
