//! Leak-detector end-to-end: epoch marking, scanning, and cycle collection.

#[macro_use]
mod common;

use common::*;
use cowns::{schedule_fn, Behaviour, CownRef, TraceStack};

/// Two cowns holding strong references to each other, with no external
/// references, are found unreachable and collected: bodies dropped, weak
/// counts drained, stubs reclaimed.
#[test]
fn cycle_is_collected() {
    init_test("cycle_is_collected");
    let mut lab = test_lab();
    let c1 = lab.create_cown(Links::default());
    let c2 = lab.create_cown(Links::default());

    c1.with_mut(|l: &mut Links| l.0.push(c2.clone()));
    c2.with_mut(|l: &mut Links| l.0.push(c1.clone()));

    let (w1, w2) = (c1.downgrade(), c2.downgrade());
    let registered = lab.runtime().debug_registry_len();
    drop(c1);
    drop(c2);

    // Strong counts are 1 each (the cycle), so nothing was collected yet.
    assert!(w1.upgrade().is_some(), "cycle keeps the bodies alive");

    lab.collect_garbage(&[]);

    assert!(w1.upgrade().is_none(), "first body collected");
    assert!(w2.upgrade().is_none(), "second body collected");

    // Our weak handles are the last ones; dropping them reclaims the stubs.
    drop(w1);
    drop(w2);
    assert_eq!(
        lab.runtime().debug_registry_len(),
        registered - 2,
        "stubs unregistered"
    );
    test_complete!("cycle_is_collected");
}

/// Cowns reachable from a root survive the pass, and marking is idempotent
/// within an epoch.
#[test]
fn roots_keep_reachable_cowns_alive() {
    init_test("roots_keep_reachable_cowns_alive");
    let mut lab = test_lab();
    let root = lab.create_cown(Links::default());
    let kept = lab.create_cown(Slot(5));
    let doomed = lab.create_cown(Links::default());

    root.with_mut(|l: &mut Links| l.0.push(kept.clone()));
    let (w_kept, w_doomed) = (kept.downgrade(), doomed.downgrade());
    drop(kept);
    // `doomed` references itself, so refcounting alone cannot free it.
    doomed.with_mut(|l: &mut Links| l.0.push(doomed.clone()));
    drop(doomed);

    lab.collect_garbage(&[root.clone()]);

    assert!(w_kept.upgrade().is_some(), "reachable from the root");
    assert!(w_doomed.upgrade().is_none(), "unreachable cycle collected");

    // Marking the root again in the same epoch is a no-op.
    let mark = root.debug_epoch_mark();
    lab.runtime().mark_for_scan(&root);
    lab.run_until_quiescent();
    assert_eq!(root.debug_epoch_mark(), mark);
    test_complete!("roots_keep_reachable_cowns_alive");
}

/// A message posted during pre-scan is tagged as in flight, counted, and
/// the count drains back to zero once the final participant runs it.
#[test]
fn prescan_messages_are_counted_inflight() {
    init_test("prescan_messages_are_counted_inflight");
    let mut lab = test_lab();
    let a = lab.create_cown(Slot(0));
    let b = lab.create_cown(Slot(0));
    let rt = lab.runtime().clone();

    rt.ld_prescan();
    assert_eq!(rt.debug_inflight_messages(), 0);

    let target = b.clone();
    schedule_fn(&[a.clone(), b.clone()], move || {
        target.with_mut(|s: &mut Slot| s.0 = 1);
    })
    .unwrap();
    assert_eq!(
        rt.debug_inflight_messages(),
        1,
        "pre-scan send counted as in flight"
    );

    rt.ld_scan(&[a.clone(), b.clone()]);
    lab.run_until_quiescent();
    assert_eq!(rt.debug_inflight_messages(), 0, "credit consumed on delivery");
    assert_eq!(b.with(|s: &Slot| s.0), 1);

    rt.ld_sweep();
    assert!(a.debug_queue_sleeping());
    test_complete!("prescan_messages_are_counted_inflight");
}

/// The epoch flips between passes and survivors are re-marked each time.
#[test]
fn epochs_alternate_across_passes() {
    init_test("epochs_alternate_across_passes");
    let mut lab = test_lab();
    let root = lab.create_cown(Slot(0));
    let rt = lab.runtime().clone();

    let first = rt.epoch();
    lab.collect_garbage(&[root.clone()]);
    assert_eq!(rt.epoch(), first.flipped());
    assert_eq!(root.debug_epoch_mark(), rt.epoch(), "survivor re-marked");

    lab.collect_garbage(&[root.clone()]);
    assert_eq!(rt.epoch(), first);
    assert_eq!(root.debug_epoch_mark(), rt.epoch());
    test_complete!("epochs_alternate_across_passes");
}

/// References captured by a behaviour closure are visible to the scanner
/// through the behaviour's trace hook.
#[test]
fn behaviour_captures_are_traced() {
    struct KeepAlive {
        held: CownRef,
        gate: CownRef,
    }
    impl Behaviour for KeepAlive {
        fn trace(&self, stack: &mut TraceStack) {
            stack.push_cown(&self.held);
            stack.push_cown(&self.gate);
        }
        fn run(self: Box<Self>) {
            self.gate.with_mut(|s: &mut Slot| s.0 = self.held.with(|h: &Slot| h.0));
        }
    }

    init_test("behaviour_captures_are_traced");
    let mut lab = test_lab();
    let gate = lab.create_cown(Slot(0));
    let held = lab.create_cown(Slot(41));
    let rt = lab.runtime().clone();

    // Post during pre-scan so the behaviour is still in flight when the
    // scan runs; its captures must be traced, not collected.
    rt.ld_prescan();
    cowns::schedule(
        &[gate.clone()],
        KeepAlive {
            held: held.clone(),
            gate: gate.clone(),
        },
    )
    .unwrap();
    let w_held = held.downgrade();
    drop(held);

    rt.ld_scan(&[gate.clone()]);
    lab.run_until_quiescent();
    rt.ld_sweep();

    assert!(w_held.upgrade().is_some(), "capture survived the pass");
    assert_eq!(gate.with(|s: &Slot| s.0), 41, "behaviour ran with its capture");
    test_complete!("behaviour_captures_are_traced");
}
