//! The runtime: worker set, cown registry, and global coordination.
//!
//! The runtime owns the scheduler workers, the injection queue for
//! external-thread schedules, and the registry resolving cown ids to live
//! records (used by blocker-chain walks). It also carries the global
//! state the leak detector coordinates through: the current epoch, the
//! phase machine, and the in-flight message counter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_queue::SegQueue;

use crate::config::RuntimeConfig;
use crate::error::BuildError;
use crate::object::CownState;
use crate::runtime::cown::{Cown, CownRef};
use crate::runtime::worker::{self, Worker};
use crate::tracing_compat::{debug, info};
use crate::types::{CownId, EpochMark, LdPhase};

/// Shared state behind a [`Runtime`] handle.
pub(crate) struct RuntimeInner {
    workers: Vec<Arc<Worker>>,
    /// Cowns scheduled from threads that are not workers.
    injector: SegQueue<CownRef>,
    /// Id -> live record, for blocker resolution and sweeps.
    registry: parking_lot::Mutex<HashMap<u64, Weak<Cown>>>,
    /// Current scan epoch (`EpochA`/`EpochB`).
    epoch: AtomicU8,
    /// Leak-detector phase machine.
    ld_phase: AtomicU8,
    /// Messages in flight across the current epoch boundary.
    inflight: AtomicIsize,
    /// Teardown flag: release paths stop collecting once set.
    teardown: AtomicBool,
    /// Worker loop stop flag.
    stop: AtomicBool,
    round_robin: AtomicUsize,
    pub(crate) config: RuntimeConfig,
}

impl std::fmt::Debug for RuntimeInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeInner")
            .field("workers", &self.workers.len())
            .field("epoch", &self.epoch())
            .field("ld_phase", &self.ld_phase())
            .finish_non_exhaustive()
    }
}

impl RuntimeInner {
    pub(crate) fn worker(&self, index: usize) -> &Arc<Worker> {
        &self.workers[index]
    }

    pub(crate) fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    /// The current scan epoch.
    pub(crate) fn epoch(&self) -> EpochMark {
        EpochMark::from_u8(self.epoch.load(Ordering::Acquire))
    }

    pub(crate) fn ld_phase(&self) -> LdPhase {
        LdPhase::from_u8(self.ld_phase.load(Ordering::Acquire))
    }

    /// True while workers must scan the cowns they run.
    pub(crate) fn should_scan(&self) -> bool {
        self.ld_phase() == LdPhase::Scan
    }

    /// True while in-flight messages are being counted.
    pub(crate) fn in_prescan(&self) -> bool {
        self.ld_phase() == LdPhase::PreScan
    }

    pub(crate) fn is_teardown_in_progress(&self) -> bool {
        self.teardown.load(Ordering::Acquire)
    }

    /// The epoch stamped onto messages sent now. During pre-scan this is
    /// `EpochNone`, so such messages are counted as in flight.
    pub(crate) fn send_epoch(&self) -> EpochMark {
        if self.in_prescan() {
            EpochMark::EpochNone
        } else {
            self.epoch()
        }
    }

    /// The mark given to newly created cowns.
    ///
    /// While a pass is forming (pre-scan/scan), new cowns are born
    /// scheduled-for-scan: they are live and the sweep fixes the mark.
    pub(crate) fn alloc_mark(&self) -> EpochMark {
        match self.ld_phase() {
            LdPhase::PreScan | LdPhase::Scan => EpochMark::ScheduledForScan,
            LdPhase::Idle | LdPhase::Sweep => self.epoch(),
        }
    }

    pub(crate) fn record_inflight_message(&self) {
        self.inflight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn recv_inflight_message(&self) {
        let prev = self.inflight.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "in-flight message accounting underflow");
    }

    pub(crate) fn inflight_messages(&self) -> isize {
        self.inflight.load(Ordering::Acquire)
    }

    pub(crate) fn register_cown(&self, id: CownId, cown: Weak<Cown>) {
        self.registry.lock().insert(id.as_u64(), cown);
    }

    pub(crate) fn unregister_cown(&self, id: CownId) {
        self.registry.lock().remove(&id.as_u64());
    }

    /// Resolves an id to a live record. Fails after the stub is reclaimed,
    /// which safely terminates blocker-chain walks that race with
    /// reclamation.
    pub(crate) fn resolve_cown(&self, id: CownId) -> Option<Arc<Cown>> {
        self.registry
            .lock()
            .get(&id.as_u64())
            .and_then(Weak::upgrade)
    }

    /// Hands a runqueue entry to the workers from an external thread.
    pub(crate) fn inject(&self, cown: CownRef) {
        self.injector.push(cown);
        let target = self.round_robin.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[target].parker.unpark();
    }

    pub(crate) fn injector_pop(&self) -> Option<CownRef> {
        self.injector.pop()
    }

    /// True if no cown is scheduled anywhere.
    pub(crate) fn runqueues_empty(&self) -> bool {
        self.injector.is_empty() && self.workers.iter().all(|w| w.runq_is_empty())
    }

    fn cleanup_registry(&self) {
        self.registry.lock().retain(|_, entry| {
            entry
                .upgrade()
                .is_some_and(|cown| cown.weak_count() > 0)
        });
    }

    /// Live records currently registered.
    fn registry_snapshot(&self) -> Vec<Arc<Cown>> {
        self.registry
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

/// Handle to a cown runtime.
///
/// The runtime can be driven two ways: by spawned worker threads
/// ([`Runtime::spawn_workers`]) or deterministically on the caller's
/// thread through [`LabRuntime`](crate::lab::LabRuntime).
#[derive(Debug, Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Creates a runtime with the given configuration. No threads are
    /// spawned until [`spawn_workers`](Self::spawn_workers).
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid.
    pub fn new(config: RuntimeConfig) -> Result<Self, BuildError> {
        config.validate()?;
        let workers = (0..config.worker_threads)
            .map(|index| Arc::new(Worker::new(index)))
            .collect();
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                workers,
                injector: SegQueue::new(),
                registry: parking_lot::Mutex::new(HashMap::new()),
                epoch: AtomicU8::new(EpochMark::EpochA as u8),
                ld_phase: AtomicU8::new(LdPhase::Idle as u8),
                inflight: AtomicIsize::new(0),
                teardown: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                round_robin: AtomicUsize::new(0),
                config,
            }),
        })
    }

    /// Creates a runtime with the default configuration.
    ///
    /// # Panics
    ///
    /// Never panics: the default configuration is valid.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RuntimeConfig::default()).expect("default config is valid")
    }

    pub(crate) fn inner(&self) -> &Arc<RuntimeInner> {
        &self.inner
    }

    /// Creates a cown owning `data`, registered to the current worker if
    /// the calling thread is one.
    #[must_use]
    pub fn create_cown<T: CownState>(&self, data: T) -> CownRef {
        Cown::create(&self.inner, Box::new(data))
    }

    /// The current scan epoch.
    #[must_use]
    pub fn epoch(&self) -> EpochMark {
        self.inner.epoch()
    }

    /// The current leak-detector phase.
    #[must_use]
    pub fn ld_phase(&self) -> LdPhase {
        self.inner.ld_phase()
    }

    /// Schedules a cown to be scanned in the current epoch.
    pub fn mark_for_scan(&self, cown: &CownRef) {
        Cown::mark_for_scan(&cown.inner, self.inner.epoch());
    }

    /// Sweep-phase collection attempt against the current epoch.
    ///
    /// For leak-detector drivers: collects the body if the cown was not
    /// reached in this epoch, fixes a stale scheduled-for-scan mark
    /// otherwise. Returns true if the body was (or already had been)
    /// collected. [`ld_sweep`](Self::ld_sweep) applies this to every
    /// registered cown.
    pub fn try_collect(&self, cown: &CownRef) -> bool {
        Cown::try_collect(&cown.inner, self.inner.epoch())
    }

    /// Spawns the configured worker threads.
    ///
    /// # Panics
    ///
    /// Panics if a worker thread cannot be spawned.
    pub fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        self.inner
            .workers()
            .iter()
            .map(|w| {
                let worker = Arc::clone(w);
                let rt = Arc::clone(&self.inner);
                std::thread::Builder::new()
                    .name(format!("{}-{}", rt.config.thread_name_prefix, worker.index))
                    .spawn(move || worker_loop(&worker, &rt))
                    .expect("failed to spawn worker thread")
            })
            .collect()
    }

    /// Signals worker loops to stop and wakes them.
    pub fn stop_workers(&self) {
        self.inner.stop.store(true, Ordering::Release);
        for w in self.inner.workers() {
            w.parker.unpark();
        }
    }

    /// Tears down the runtime.
    ///
    /// Phase 1 drops every scheduled entry and pending message; phase 2
    /// drops cown bodies without running collection, so remaining releases
    /// are pure count decrements and the stubs drain to zero as the last
    /// references go away.
    ///
    /// Worker threads must have been stopped and joined first.
    pub fn teardown(&self) {
        info!("runtime teardown");
        let rt = &self.inner;
        rt.teardown.store(true, Ordering::Release);
        self.stop_workers();

        // Phase 1: no more dispatch; drop scheduled entries.
        for w in rt.workers() {
            drop(w.drain_runq());
            w.drain_mute_map();
        }
        while let Some(entry) = rt.injector_pop() {
            drop(entry);
        }

        // Phase 2: drop pending messages and bodies.
        let cowns = rt.registry_snapshot();
        for cown in &cowns {
            Cown::teardown_collect(cown);
        }
        drop(cowns);
        rt.registry.lock().clear();
    }

    // ---- leak-detector pass driving ----

    /// Enters the pre-scan phase: messages sent from here on are tagged
    /// `EpochNone` and counted as in flight.
    pub fn ld_prescan(&self) {
        debug!("leak detector: prescan");
        self.inner
            .ld_phase
            .store(LdPhase::PreScan as u8, Ordering::Release);
    }

    /// Advances the epoch and enters the scan phase, marking the given
    /// roots for scanning.
    pub fn ld_scan(&self, roots: &[CownRef]) {
        let next = self.inner.epoch().flipped();
        debug!(epoch = ?next, "leak detector: scan");
        self.inner.epoch.store(next as u8, Ordering::Release);
        self.inner
            .ld_phase
            .store(LdPhase::Scan as u8, Ordering::Release);
        for root in roots {
            Cown::mark_for_scan(&root.inner, next);
        }
    }

    /// Sweeps: collects every cown not reached in the current epoch, then
    /// reclaims dead stubs and returns to idle.
    pub fn ld_sweep(&self) {
        debug!("leak detector: sweep");
        let rt = &self.inner;
        rt.ld_phase.store(LdPhase::Sweep as u8, Ordering::Release);
        let epoch = rt.epoch();

        worker::set_in_sweep(true);
        let cowns = rt.registry_snapshot();
        for cown in &cowns {
            Cown::try_collect(cown, epoch);
        }
        drop(cowns);
        worker::set_in_sweep(false);

        for w in rt.workers() {
            w.collect_cown_stubs(rt);
        }
        rt.cleanup_registry();
        rt.ld_phase.store(LdPhase::Idle as u8, Ordering::Release);
    }

    /// Messages currently counted as in flight (observability).
    #[doc(hidden)]
    #[must_use]
    pub fn debug_inflight_messages(&self) -> isize {
        self.inner.inflight_messages()
    }

    /// Number of registered cown records (observability).
    #[doc(hidden)]
    #[must_use]
    pub fn debug_registry_len(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Per-worker (cowns created, stubs reclaimed) counters (observability).
    #[doc(hidden)]
    #[must_use]
    pub fn debug_worker_cown_counts(&self, index: usize) -> (usize, usize) {
        let w = self.inner.worker(index);
        (
            w.total_cowns.load(Ordering::Relaxed),
            w.free_cowns.load(Ordering::Relaxed),
        )
    }
}

/// Runs one scheduled cown, rescheduling it if its run loop asks for it.
pub(crate) fn run_one(worker: &Arc<Worker>, cown: CownRef) {
    let record = Arc::clone(&cown.inner);
    if Cown::run(&record) {
        worker.schedule_fifo(cown);
    } else {
        drop(cown);
    }
}

fn worker_loop(worker: &Arc<Worker>, rt: &Arc<RuntimeInner>) {
    let _guard = worker::enter(Arc::clone(worker), Arc::clone(rt));
    debug!(worker = worker.index, "worker loop started");
    let mute_interval = rt.config.mute_check_interval.max(1);
    let mut iteration: usize = 0;

    while !rt.stop.load(Ordering::Acquire) {
        iteration = iteration.wrapping_add(1);
        if iteration % mute_interval == 0 {
            worker.check_mute_sets();
        }

        match worker.pop().or_else(|| rt.injector_pop()) {
            Some(cown) => run_one(worker, cown),
            None => worker.parker.park_timeout(Duration::from_millis(1)),
        }
    }
    debug!(worker = worker.index, "worker loop stopped");
}
