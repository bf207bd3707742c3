//! Cowns: concurrent owners.
//!
//! A cown encapsulates state that may be accessed by a single scheduler
//! worker at a time. A cown is in exactly one of three states:
//!
//! 1. Unscheduled (queue sleeping)
//! 2. Scheduled, in the runqueue of a single worker
//! 3. Running on a single worker
//!
//! Once running, a cown executes a batch of multi-message behaviours. Each
//! message either acquires the running cown for a future behaviour, or
//! executes the behaviour if this cown is the last participant. An
//! acquired cown is descheduled until that behaviour completes.
//!
//! This module carries the four tightly-coupled concerns of the core: the
//! reference-count lifecycle, the multi-message acquisition protocol, the
//! run loop, and the leak-detector hooks. The backpressure and status
//! words live in sibling modules but are driven from here.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use smallvec::SmallVec;

use crate::error::ScheduleError;
use crate::lab::systematic;
use crate::object::{AnyCownState, CownState, TraceStack, Traced};
use crate::runtime::backpressure::{BackpressureWord, Priority};
use crate::runtime::message::{Behaviour, FnBehaviour, MessageBody, MultiMessage};
use crate::runtime::pool::RuntimeInner;
use crate::runtime::queue::MessageQueue;
use crate::runtime::status::StatusWord;
use crate::runtime::worker;
use crate::tracing_compat::{debug, trace};
use crate::types::{CownId, EpochMark};

const OWNER_COLLECTED_BIT: usize = 1;

/// The cown record.
///
/// Mutated only by the worker currently running it, except for: queue
/// enqueues, backpressure CAS updates, refcount updates, and epoch marking
/// during scans.
pub(crate) struct Cown {
    /// Stable identity; the multi-message sort key.
    pub(crate) id: CownId,
    /// The owning runtime.
    pub(crate) rt: Arc<RuntimeInner>,
    /// The message queue with its sleep/wake protocol.
    pub(crate) queue: MessageQueue,
    /// Strong count: reaching zero collects the body.
    strong: AtomicUsize,
    /// Weak count: reaching zero reclaims the stub. The strong count owns
    /// one weak reference.
    weak: AtomicUsize,
    /// Packed (blocker, priority).
    bp: BackpressureWord,
    /// Packed load / token / overload word.
    pub(crate) status: StatusWord,
    /// Leak-detector epoch mark.
    mark: AtomicU8,
    /// Packed (owning worker index + 1) << 1 | collected flag; 0 upper
    /// bits for externally created cowns. The collected bit is set once
    /// and never cleared.
    owner: AtomicUsize,
    /// User state. `None` once the body has been collected.
    data: Mutex<Option<Box<dyn AnyCownState>>>,
}

impl std::fmt::Debug for Cown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cown")
            .field("id", &self.id)
            .field("strong", &self.strong.load(Ordering::Relaxed))
            .field("weak", &self.weak.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

thread_local! {
    /// Work list bounding the recursion of `queue_collect`.
    static COLLECT_QUEUE: RefCell<Option<Vec<Arc<Cown>>>> = const { RefCell::new(None) };
}

impl Cown {
    /// Creates a cown owned by the current worker (if any) and registers
    /// it with the runtime.
    pub(crate) fn create(rt: &Arc<RuntimeInner>, data: Box<dyn AnyCownState>) -> CownRef {
        let id = CownId::next();
        let owner_index = worker::current_worker_index();
        let cown = Arc::new(Self {
            id,
            rt: Arc::clone(rt),
            queue: MessageQueue::new(),
            strong: AtomicUsize::new(1),
            weak: AtomicUsize::new(1),
            bp: BackpressureWord::new(),
            status: StatusWord::new(),
            mark: AtomicU8::new(rt.alloc_mark() as u8),
            owner: AtomicUsize::new(owner_index.map_or(0, |i| (i + 1) << 1)),
            data: Mutex::new(Some(data)),
        });
        rt.register_cown(id, Arc::downgrade(&cown));
        if let Some(index) = owner_index {
            let w = rt.worker(index);
            w.add_local_cown(Arc::downgrade(&cown));
            w.total_cowns.fetch_add(1, Ordering::Relaxed);
        }
        trace!(cown = %id, "cown created");
        CownRef { inner: cown }
    }

    // ---- identity and small state accessors ----

    pub(crate) fn priority(&self) -> Priority {
        self.bp.priority()
    }

    pub(crate) fn blocker(&self) -> Option<CownId> {
        self.bp.blocker()
    }

    /// Resolves the blocker id to a live record through the registry.
    fn blocker_cown(&self) -> Option<Arc<Cown>> {
        self.bp.blocker().and_then(|id| self.rt.resolve_cown(id))
    }

    pub(crate) fn epoch_mark(&self) -> EpochMark {
        EpochMark::from_u8(self.mark.load(Ordering::Acquire))
    }

    pub(crate) fn set_epoch_mark(&self, mark: EpochMark) {
        self.mark.store(mark as u8, Ordering::Release);
    }

    pub(crate) fn is_collected(&self) -> bool {
        self.owner.load(Ordering::Relaxed) & OWNER_COLLECTED_BIT != 0
    }

    fn mark_collected(&self) {
        self.owner.fetch_or(OWNER_COLLECTED_BIT, Ordering::Relaxed);
    }

    fn owning_worker(&self) -> Option<usize> {
        let packed = self.owner.load(Ordering::Relaxed) >> 1;
        packed.checked_sub(1)
    }

    pub(crate) fn strong_count(&self) -> usize {
        self.strong.load(Ordering::Acquire)
    }

    pub(crate) fn weak_count(&self) -> usize {
        self.weak.load(Ordering::Acquire)
    }

    /// True if this cown is live in the given epoch: scheduled for a scan
    /// or already traced there.
    pub(crate) fn is_live(&self, epoch: EpochMark) -> bool {
        let mark = self.epoch_mark();
        mark == EpochMark::ScheduledForScan || mark == epoch
    }

    // ---- reference counting ----

    pub(crate) fn acquire(&self) {
        let prev = self.strong.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "acquire on a dead cown");
    }

    /// Releases one strong reference.
    ///
    /// On the last release, collection depends on context: teardown and
    /// sweep defer to the respective reclaimers, otherwise the body is
    /// collected via the depth-bounded work list.
    pub(crate) fn release(this: &Arc<Cown>) {
        trace!(cown = %this.id, "release");
        let last = this.strong.fetch_sub(1, Ordering::AcqRel) == 1;
        systematic::yield_point();
        if !last {
            return;
        }

        // All paths from this point release the weak count owned by the
        // strong count.
        if this.rt.is_teardown_in_progress() {
            // Teardown phase 2 reclaims the stub.
            this.weak.fetch_sub(1, Ordering::AcqRel);
            return;
        }

        if worker::in_sweep() && !this.is_live(this.rt.epoch()) {
            trace!(cown = %this.id, "release deferred to sweeper");
            // The sweeper's stub collection deals with the rest.
            this.weak.fetch_sub(1, Ordering::AcqRel);
            return;
        }

        if this.is_collected() {
            Cown::weak_release(this);
        } else {
            Cown::queue_collect(this);
        }
    }

    pub(crate) fn weak_acquire(&self) {
        let prev = self.weak.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "weak acquire on a reclaimed stub");
    }

    /// Releases one weak reference; the last one reclaims the stub.
    pub(crate) fn weak_release(this: &Arc<Cown>) {
        trace!(cown = %this.id, "weak release");
        if this.weak.fetch_sub(1, Ordering::AcqRel) == 1 {
            let owner = this.owning_worker();
            systematic::yield_point();
            this.rt.unregister_cown(this.id);
            if let Some(index) = owner {
                // Tell the owning worker it has a free cown to account.
                this.rt.worker(index).free_cowns.fetch_add(1, Ordering::Relaxed);
                systematic::yield_point();
            }
        }
    }

    /// Promotes a weak reference to a strong one if the body is alive.
    pub(crate) fn acquire_strong_from_weak(&self) -> bool {
        let mut n = self.strong.load(Ordering::Acquire);
        loop {
            if n == 0 {
                return false;
            }
            match self
                .strong
                .compare_exchange_weak(n, n + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(observed) => n = observed,
            }
        }
    }

    // ---- scheduling ----

    /// Schedules this cown, acquiring a strong reference for the runqueue
    /// entry. Routes through the current worker, or the runtime's
    /// injection queue for external threads.
    pub(crate) fn schedule(this: &Arc<Cown>) {
        this.acquire();
        let entry = CownRef {
            inner: Arc::clone(this),
        };
        match worker::current_worker() {
            Some(w) => w.schedule_fifo(entry),
            None => this.rt.inject(entry),
        }
    }

    /// Wakes the queue and schedules if it was sleeping.
    pub(crate) fn reschedule(this: &Arc<Cown>) {
        if this.queue.wake() {
            Cown::schedule(this);
        }
    }

    /// Sets the notify flag; schedules the cown if it was sleeping.
    pub(crate) fn mark_notify(this: &Arc<Cown>) {
        if this.queue.mark_notify() {
            Cown::schedule(this);
        }
        systematic::yield_point();
    }

    // ---- backpressure ----

    /// Transitions the priority (see [`BackpressureWord::transition`]).
    ///
    /// A transition out of `Low` wakes the queue and schedules the cown:
    /// muted cowns are kept off every runqueue, so leaving `Low` must put
    /// the cown back.
    pub(crate) fn backpressure_transition(
        this: &Arc<Cown>,
        target: Priority,
        exact: bool,
    ) -> Priority {
        let outcome = this.bp.transition(target, exact);
        if !outcome.applied {
            return outcome.prev;
        }
        debug!(
            cown = %this.id,
            prev = ?outcome.prev,
            next = ?target,
            "backpressure transition"
        );
        systematic::yield_point();
        if outcome.prev == Priority::Low {
            let was_sleeping = this.queue.wake();
            debug_assert!(!was_sleeping, "muted cown had a sleeping queue");
            Cown::schedule(this);
        }
        outcome.prev
    }

    /// Raises this cown and every cown along its blocker chain to `High`.
    ///
    /// The chain is acyclic (participants are acquired in sorted order),
    /// so the walk terminates.
    pub(crate) fn backpressure_unblock(start: Arc<Cown>) {
        let mut cursor = Some(start);
        while let Some(cown) = cursor {
            trace!(cown = %cown.id, "unblock");
            Cown::backpressure_transition(&cown, Priority::High, false);
            cursor = cown.blocker_cown();
        }
    }

    /// True if a sender to this cown should become low priority: the cown
    /// is not at normal priority and has pending work.
    pub(crate) fn triggers_muting(&self) -> bool {
        let priority = self.priority();
        let sleeping = self.queue.is_sleeping();
        systematic::yield_point();
        priority != Priority::Normal && !sleeping
    }

    /// Designates a mutor for the in-flight behaviour if any receiver
    /// warrants muting. Self-sends never mute.
    fn backpressure_scan(senders: &MessageBody, receivers: &MessageBody) {
        if worker::has_mutor() {
            return;
        }
        for sender in &senders.cowns {
            for receiver in &receivers.cowns {
                if sender.id() == receiver.id() {
                    return;
                }
            }
        }
        for receiver in &receivers.cowns {
            if receiver.inner.triggers_muting() || systematic::coin(5) {
                debug!(mutor = %receiver.id(), "backpressure scan selected mutor");
                worker::set_mutor(receiver.downgrade());
                return;
            }
        }
    }

    /// Applies the mutor chosen during the behaviour, if any.
    ///
    /// Returns `None` when no mutor was set (senders are rescheduled
    /// normally). Otherwise the senders have been parked and the value
    /// reports whether the current cown was among them.
    fn apply_backpressure(this: &Arc<Cown>, body: &Arc<MessageBody>) -> Option<bool> {
        let mutor = worker::take_mutor()?;
        match worker::current_worker() {
            Some(w) => Some(w.mute(mutor, body, this.id)),
            None => {
                // Behaviours only run on workers; nothing to park against.
                drop(mutor);
                None
            }
        }
    }

    /// Updates backpressure state for one dequeued message. Returns true
    /// if the message is a token.
    ///
    /// A fresh first-hop message with no token in flight starts a new load
    /// interval and plants a token behind the current batch; the token
    /// surfacing ends the interval and may demote the priority.
    fn check_message_token(this: &Arc<Cown>, message: &MultiMessage) -> bool {
        let mut stat = this.status.load();
        systematic::yield_point();

        let Some(body) = message.body.as_ref() else {
            trace!(cown = %this.id, "reached message token");
            debug_assert!(stat.has_token());
            stat.set_has_token(false);
            this.status.store(stat);

            let priority = this.priority();
            if stat.overloaded() {
                Cown::backpressure_unblock(Arc::clone(this));
            } else if priority == Priority::High {
                Cown::backpressure_transition(this, Priority::MaybeHigh, false);
            } else if priority == Priority::MaybeHigh {
                Cown::backpressure_transition(this, Priority::Normal, false);
            }
            return true;
        };

        if (!stat.has_token() && body.index() == 0) || stat.current_load() == 0xFF {
            stat.reset_load();
        }
        if !stat.has_token() {
            trace!(cown = %this.id, "enqueue message token");
            this.queue.enqueue(MultiMessage::token(EpochMark::EpochNone));
        }
        stat.inc_load();
        stat.set_has_token(true);

        if systematic::coin(5) {
            let flipped = !stat.overloaded();
            stat.set_overloaded(flipped);
        }

        this.status.store(stat);
        if stat.overloaded() {
            Cown::backpressure_unblock(Arc::clone(this));
        }
        false
    }

    // ---- multi-message protocol ----

    /// Sequentially acquires cowns `[index, count)` without going through
    /// the scheduler where possible.
    ///
    /// Acquisition stops when a target's queue is awake (the message will
    /// be handled when that cown runs) or when the last participant has
    /// been acquired (it is scheduled to run the behaviour). Each
    /// intermediate hop records the next participant as the previous one's
    /// blocker; observing a high priority anywhere escalates the rest of
    /// the hop so the raise propagates along the chain.
    pub(crate) fn fast_send(body: &Arc<MessageBody>, epoch: EpochMark) {
        let last = body.count() - 1;
        debug_assert!(body.index() <= last);

        let mut high_priority = false;
        if body.index() == 0 {
            // If priority is needed anywhere in this message, start
            // unmuting participants so they can drain their queues.
            high_priority = body
                .cowns
                .iter()
                .any(|c| c.inner.priority().is_high());
        }

        while body.index() <= last {
            let index = body.index();
            let message = MultiMessage::new(Arc::clone(body), epoch);
            let next = &body.cowns[index];
            trace!(next = %next.id(), index, "fast send requesting");

            if index > 0 {
                // Double check the priority of the most recently acquired
                // cown to prevent deadlock.
                let cur = &body.cowns[index - 1];
                high_priority =
                    high_priority || cur.inner.priority().is_high() || systematic::coin(3);
                systematic::yield_point();
                if !high_priority {
                    high_priority = cur.inner.bp.set_blocker(Some(next.id()));
                }
            }

            let was_sleeping = next.inner.queue.enqueue(Arc::clone(&message));
            systematic::yield_point();

            if !was_sleeping {
                trace!(next = %next.id(), "fast send interrupted");
                if high_priority {
                    Cown::backpressure_unblock(Arc::clone(&next.inner));
                }
                return;
            }

            trace!(next = %next.id(), "fast acquired");
            if index == last {
                // Acquired the last cown: schedule it so it runs the
                // behaviour (rescheduling keeps long behaviours fair).
                Cown::schedule(&next.inner);
                return;
            }

            // The queue was sleeping, so this worker owns `next` and the
            // just-enqueued message is at the head. Consume it and keep
            // acquiring. The notify flag is left for the real run loop.
            let head = next.inner.queue.dequeue_head();
            debug_assert!(
                head.is_some_and(|h| Arc::ptr_eq(&h, &message)),
                "fast path message not at queue head"
            );
            body.advance_index();
        }
    }

    /// Handles a multi-message surfacing at its current participant.
    ///
    /// Returns false if this cown was acquired for a future behaviour (the
    /// run loop must stop without rescheduling); true if the behaviour ran.
    pub(crate) fn run_step(rt: &Arc<RuntimeInner>, message: &Arc<MultiMessage>) -> bool {
        let body = message.body.clone().expect("run_step on a token message");
        let last = body.count() - 1;
        let index = body.index();
        let mut epoch = message.epoch;
        let send_epoch = rt.send_epoch();

        trace!(cown = %body.cowns[index].id(), index, epoch = ?epoch, "run step");

        // If we should scan and observe a message in this epoch, all
        // future messages were sent in at least pre-scan; scan the cown
        // now so later messages can be trusted.
        if rt.should_scan() && epoch == send_epoch {
            let cown = &body.cowns[index];
            if cown.inner.epoch_mark() != send_epoch {
                Cown::scan(&cown.inner, send_epoch);
                cown.inner.set_epoch_mark(send_epoch);
            }
        }

        if index < last {
            if epoch != send_epoch {
                // Cross-epoch messages only appear during pre-scan/scan.
                debug_assert!(rt.should_scan() || rt.in_prescan());
                if epoch != EpochMark::EpochNone {
                    trace!("message from a previous epoch, counted inflight");
                    rt.record_inflight_message();
                    epoch = EpochMark::EpochNone;
                }
            } else if rt.should_scan()
                && body.cowns[index].inner.epoch_mark() != send_epoch
            {
                trace!("message reaches an unscanned cown, counted inflight");
                rt.record_inflight_message();
                epoch = EpochMark::EpochNone;
            }

            // Try to acquire as many cowns as possible without
            // rescheduling, starting from the next one.
            body.advance_index();
            Cown::fast_send(&body, epoch);
            return false;
        }

        if epoch == EpochMark::EpochNone {
            // Balanced against the increment recorded at send.
            rt.recv_inflight_message();
        }

        if rt.should_scan() && epoch != send_epoch {
            trace!("scanning participants and closure before running");
            for cown in &body.cowns {
                Cown::scan(&cown.inner, send_epoch);
            }
            let mut stack = TraceStack::new();
            body.trace_behaviour(&mut stack);
            Cown::scan_stack(send_epoch, &mut stack);
        }

        worker::set_message_body(Arc::clone(&body));

        // The message is complete: no participant is blocked on another.
        for cown in &body.cowns {
            cown.inner.bp.set_blocker(None);
        }

        let behaviour = body.take_behaviour();
        behaviour.run();
        trace!(cown = %body.cowns[last].id(), "behaviour complete");
        true
    }

    /// Runs the notify hook, outside of any message context.
    fn cown_notified(this: &Arc<Cown>) {
        // Not a message: a send from the handler must not run a
        // backpressure scan against a stale body. Known limitation: a
        // notification to an overloaded cown therefore never mutes.
        worker::clear_message_body();
        let mut data = this.data.lock().expect("cown data lock poisoned");
        if let Some(state) = data.as_mut() {
            state.notified();
        }
    }

    // ---- run loop ----

    /// Processes a batch of messages on this cown.
    ///
    /// Returns false if the cown must not be rescheduled: it went to
    /// sleep, was acquired by a multi-message, or was muted. Notifications
    /// are surfaced at most once per call.
    pub(crate) fn run(this: &Arc<Cown>) -> bool {
        let rt = Arc::clone(&this.rt);
        let until = this.queue.peek_back();
        systematic::yield_point();

        let stat = this.status.load();
        debug_assert!(this.priority() != Priority::Low, "muted cown dispatched");

        // Batch limit between 100 and 251, depending on sustained load.
        let batch_limit = (100 + (stat.total_load() >> 3)).min(251) as usize;
        trace!(cown = %this.id, load = stat.total_load(), batch_limit, "run batch");

        let mut notified_called = false;
        let mut batch_size: usize = 0;

        loop {
            debug_assert!(!this.queue.is_sleeping());
            let (message, notify) = this.queue.dequeue();

            if notify && !notified_called {
                notified_called = true;
                Cown::cown_notified(this);
            }

            let Some(message) = message else {
                if rt.should_scan() {
                    // Queue hit empty during a scan: everything sent later
                    // is covered by pre-scan accounting.
                    let send_epoch = rt.send_epoch();
                    Cown::scan(this, send_epoch);
                    this.set_epoch_mark(send_epoch);
                }

                // Keep busy cowns scheduled. This also guarantees a
                // mark-for-scan wake-up cannot be missed while the cown is
                // held by a pre-scan worker.
                if batch_size != 0 {
                    return true;
                }

                Cown::backpressure_transition(this, Priority::Normal, true);

                let (slept, notify) = this.queue.mark_sleeping();
                if !slept {
                    if notify {
                        debug_assert!(!notified_called);
                        Cown::cown_notified(this);
                        // Treat the notification as a message: stay scheduled.
                    }
                    return true;
                }

                trace!(cown = %this.id, "no work, sleeping");
                return false;
            };

            debug_assert!(!this.queue.is_sleeping());

            if Cown::check_message_token(this, &message) {
                return true;
            }
            batch_size += 1;

            let body = message
                .body
                .clone()
                .expect("non-token message has a body");

            if !Cown::run_step(&rt, &message) {
                // Acquisition hand-off: this cown now belongs to the
                // in-flight multi-message.
                return false;
            }
            worker::clear_message_body();

            match Cown::apply_backpressure(this, &body) {
                Some(true) => return false,
                Some(false) => return true,
                None => {}
            }

            // Reschedule the other participants; the last one is this
            // cown, already holding the thread.
            let count = body.count();
            for sender in &body.cowns[..count - 1] {
                Cown::schedule(&sender.inner);
            }

            if message.seq() == until || batch_size >= batch_limit {
                return true;
            }
        }
    }

    // ---- leak detector hooks ----

    /// Schedules a cown to be scanned by a worker. Idempotent within an
    /// epoch.
    pub(crate) fn mark_for_scan(this: &Arc<Cown>, epoch: EpochMark) {
        let mark = this.epoch_mark();
        if mark == EpochMark::ScheduledForScan || mark == epoch {
            trace!(cown = %this.id, mark = ?mark, "already marked");
            return;
        }
        systematic::yield_point();
        // Racing over the mark may re-mark something already scanned; the
        // extra scan is harmless.
        this.set_epoch_mark(EpochMark::ScheduledForScan);
        systematic::yield_point();
        Cown::reschedule(this);
    }

    /// Traces this cown's data, recursing through regions and immutables
    /// and marking reached cowns for scanning.
    pub(crate) fn scan(this: &Arc<Cown>, epoch: EpochMark) {
        if this.epoch_mark() == epoch {
            return;
        }
        this.set_epoch_mark(epoch);
        trace!(cown = %this.id, epoch = ?epoch, "scan");
        let mut stack = TraceStack::new();
        {
            let data = this.data.lock().expect("cown data lock poisoned");
            if let Some(state) = data.as_ref() {
                state.trace(&mut stack);
            }
        }
        Cown::scan_stack(epoch, &mut stack);
    }

    /// Drains a trace stack, dispatching each reachable object on its kind.
    pub(crate) fn scan_stack(epoch: EpochMark, stack: &mut TraceStack) {
        while let Some(entry) = stack.pop() {
            match entry {
                Traced::Region(region) => region.cown_scan(epoch, stack),
                Traced::Imm(imm) => imm.mark_and_scan(epoch, stack),
                Traced::Cown(cown) => Cown::mark_for_scan(&cown.inner, epoch),
            }
        }
    }

    /// Sweep-phase collection attempt. Returns true if the body was (or
    /// had been) collected.
    pub(crate) fn try_collect(this: &Arc<Cown>, epoch: EpochMark) -> bool {
        trace!(cown = %this.id, mark = ?this.epoch_mark(), "try_collect");

        if this.epoch_mark() == EpochMark::ScheduledForScan {
            // Racing schedulers can leave a stale mark; fix it for the
            // next pass and treat the cown as live.
            this.set_epoch_mark(epoch);
            return false;
        }

        if this.epoch_mark() == epoch {
            return false;
        }

        if !this.is_collected() {
            systematic::yield_point();
            debug_assert!(this.priority() != Priority::Low);
            debug!(cown = %this.id, "collecting unreachable cown");
            Cown::collect(this);
        }
        true
    }

    /// Collection entry point for a strong count reaching zero outside of
    /// a sweep. A thread-local work list bounds the recursion, so
    /// arbitrarily deep cown chains cannot overflow the stack.
    fn queue_collect(this: &Arc<Cown>) {
        let deferred = COLLECT_QUEUE.with(|q| {
            let mut q = q.borrow_mut();
            match q.as_mut() {
                Some(list) => {
                    list.push(Arc::clone(this));
                    true
                }
                None => {
                    *q = Some(Vec::new());
                    false
                }
            }
        });
        if deferred {
            return;
        }

        Cown::collect(this);
        systematic::yield_point();
        Cown::weak_release(this);

        loop {
            let next = COLLECT_QUEUE.with(|q| {
                q.borrow_mut()
                    .as_mut()
                    .and_then(Vec::pop)
            });
            let Some(cown) = next else { break };
            Cown::collect(&cown);
            systematic::yield_point();
            Cown::weak_release(&cown);
        }
        COLLECT_QUEUE.with(|q| q.borrow_mut().take());
    }

    /// Collects the cown body: finaliser, data release, queue teardown.
    ///
    /// Idempotent: a body already collected by the leak detector is not
    /// collected again when its count later reaches zero.
    fn collect(this: &Arc<Cown>) {
        if this.is_collected() {
            return;
        }
        this.mark_collected();
        debug!(cown = %this.id, "collect body");

        let data = this.data.lock().expect("cown data lock poisoned").take();
        if let Some(mut state) = data {
            state.finalise();
            // Dropping the state releases everything it reaches; deep
            // chains are bounded by the collect work list.
            drop(state);
        }

        systematic::yield_point();
        debug_assert!(this.priority() != Priority::Low);
        this.queue.destroy();
    }

    /// Teardown phase 2: drop pending work and the body without running
    /// collection, so remaining releases are pure count decrements.
    pub(crate) fn teardown_collect(this: &Arc<Cown>) {
        let pending = this.queue.drain();
        drop(pending);
        if !this.is_collected() {
            this.mark_collected();
            let data = this.data.lock().expect("cown data lock poisoned").take();
            if let Some(mut state) = data {
                state.finalise();
                drop(state);
            }
        }
    }
}

/// A strong reference to a cown.
///
/// Cloning acquires, dropping releases. When the last strong reference is
/// gone the cown body is collected (its data finalised and dropped); the
/// record itself lives until the last weak reference is gone.
pub struct CownRef {
    pub(crate) inner: Arc<Cown>,
}

impl CownRef {
    /// The cown's stable identity.
    #[must_use]
    pub fn id(&self) -> CownId {
        self.inner.id
    }

    /// Current scheduling priority.
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.inner.priority()
    }

    /// Sets the edge-triggered notify flag, scheduling the cown if it was
    /// asleep. The cown's [`CownState::notified`] hook runs at most once
    /// per run-loop batch.
    pub fn notify(&self) {
        Cown::mark_notify(&self.inner);
    }

    /// Downgrades to a weak reference.
    #[must_use]
    pub fn downgrade(&self) -> CownWeak {
        self.inner.weak_acquire();
        CownWeak {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Mutable access to the cown's state.
    ///
    /// The caller must hold the cown: either this is the worker currently
    /// running a behaviour that acquired it, or no behaviour on the cown
    /// is in flight.
    ///
    /// # Panics
    ///
    /// Panics if the state is not of type `T` or the body has been
    /// collected.
    pub fn with_mut<T: CownState, R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut data = self.inner.data.lock().expect("cown data lock poisoned");
        let state = data
            .as_mut()
            .expect("cown body has been collected")
            .as_any_mut()
            .downcast_mut::<T>()
            .expect("cown state type mismatch");
        f(state)
    }

    /// Shared access to the cown's state.
    ///
    /// # Panics
    ///
    /// Panics if the state is not of type `T` or the body has been
    /// collected.
    pub fn with<T: CownState, R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let data = self.inner.data.lock().expect("cown data lock poisoned");
        let state = data
            .as_ref()
            .expect("cown body has been collected")
            .as_any()
            .downcast_ref::<T>()
            .expect("cown state type mismatch");
        f(state)
    }

    /// Current strong count (observability; racy by nature).
    #[doc(hidden)]
    #[must_use]
    pub fn debug_strong_count(&self) -> usize {
        self.inner.strong_count()
    }

    /// Current weak count (observability; racy by nature).
    #[doc(hidden)]
    #[must_use]
    pub fn debug_weak_count(&self) -> usize {
        self.inner.weak_count()
    }

    /// Current blocker id, if any.
    #[doc(hidden)]
    #[must_use]
    pub fn debug_blocker(&self) -> Option<CownId> {
        self.inner.blocker()
    }

    /// Whether the queue is currently sleeping.
    #[doc(hidden)]
    #[must_use]
    pub fn debug_queue_sleeping(&self) -> bool {
        self.inner.queue.is_sleeping()
    }

    /// Whether the body has been collected.
    #[doc(hidden)]
    #[must_use]
    pub fn debug_is_collected(&self) -> bool {
        self.inner.is_collected()
    }

    /// Current epoch mark.
    #[doc(hidden)]
    #[must_use]
    pub fn debug_epoch_mark(&self) -> EpochMark {
        self.inner.epoch_mark()
    }

    /// Whether a token message is currently circulating in the queue.
    #[doc(hidden)]
    #[must_use]
    pub fn debug_has_token(&self) -> bool {
        self.inner.status.load().has_token()
    }

    /// Current-interval load counter.
    #[doc(hidden)]
    #[must_use]
    pub fn debug_current_load(&self) -> u8 {
        self.inner.status.load().current_load()
    }

    /// Forces the overloaded flag, standing in for the load policy.
    #[doc(hidden)]
    pub fn debug_set_overloaded(&self, overloaded: bool) {
        let mut stat = self.inner.status.load();
        stat.set_overloaded(overloaded);
        self.inner.status.store(stat);
    }
}

impl Clone for CownRef {
    fn clone(&self) -> Self {
        self.inner.acquire();
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for CownRef {
    fn drop(&mut self) {
        Cown::release(&self.inner);
    }
}

impl std::fmt::Debug for CownRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CownRef({})", self.inner.id)
    }
}

/// A weak reference to a cown.
///
/// Keeps the record (the "stub") alive but not the data it reaches. Can be
/// promoted back to a strong reference while the body is alive.
pub struct CownWeak {
    pub(crate) inner: Arc<Cown>,
}

impl CownWeak {
    /// The cown's stable identity.
    #[must_use]
    pub fn id(&self) -> CownId {
        self.inner.id
    }

    /// Promotes to a strong reference if the body is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<CownRef> {
        if self.inner.acquire_strong_from_weak() {
            Some(CownRef {
                inner: Arc::clone(&self.inner),
            })
        } else {
            None
        }
    }
}

impl Clone for CownWeak {
    fn clone(&self) -> Self {
        self.inner.weak_acquire();
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Drop for CownWeak {
    fn drop(&mut self) {
        Cown::weak_release(&self.inner);
    }
}

impl std::fmt::Debug for CownWeak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CownWeak({})", self.inner.id)
    }
}

/// Posts a behaviour onto an ordered set of cowns.
///
/// The participants are copied, sorted by id, and acquired sequentially;
/// the behaviour runs on the worker that acquires the last one. If the
/// calling worker is itself running a behaviour, a backpressure scan
/// compares its participants against the receivers and may mute them.
///
/// # Errors
///
/// Fails if the runtime is tearing down or `cowns` is empty.
///
/// # Panics
///
/// Panics if the same cown appears twice in `cowns`.
pub fn schedule<B: Behaviour>(cowns: &[CownRef], behaviour: B) -> Result<(), ScheduleError> {
    schedule_boxed(cowns, Box::new(behaviour))
}

/// Posts a plain closure onto an ordered set of cowns.
///
/// Closure behaviours report no captures to the leak detector; implement
/// [`Behaviour`] with a `trace` when the closure holds cown references.
///
/// # Errors
///
/// Fails if the runtime is tearing down or `cowns` is empty.
pub fn schedule_fn<F>(cowns: &[CownRef], f: F) -> Result<(), ScheduleError>
where
    F: FnOnce() + Send + 'static,
{
    schedule_boxed(cowns, Box::new(FnBehaviour(f)))
}

fn schedule_boxed(cowns: &[CownRef], behaviour: Box<dyn Behaviour>) -> Result<(), ScheduleError> {
    let Some(first) = cowns.first() else {
        return Err(ScheduleError::NoParticipants);
    };
    let rt = Arc::clone(&first.inner.rt);
    if rt.is_teardown_in_progress() {
        return Err(ScheduleError::Teardown);
    }

    let mut sorted: SmallVec<[CownRef; 4]> = cowns.iter().cloned().collect();
    sorted.sort_by_key(CownRef::id);
    assert!(
        sorted.windows(2).all(|w| w[0].id() != w[1].id()),
        "a cown may participate in a behaviour only once"
    );

    let body = MessageBody::new(sorted, behaviour);
    trace!(participants = body.count(), "schedule behaviour");

    let epoch = rt.send_epoch();
    if epoch == EpochMark::EpochNone {
        rt.record_inflight_message();
    }

    if let Some(sender_body) = worker::current_message_body() {
        Cown::backpressure_scan(&sender_body, &body);
    }

    Cown::fast_send(&body, epoch);
    Ok(())
}
