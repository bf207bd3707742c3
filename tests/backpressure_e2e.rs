//! Backpressure end-to-end: load metering, muting, and priority recovery.

#[macro_use]
mod common;

use std::sync::{Arc, Mutex};

use common::*;
use cowns::{schedule_fn, Priority};

/// Token circulation meters load: a long burst is processed across several
/// batches, and once the queue drains the token has been consumed.
#[test]
fn token_meters_load_over_burst() {
    init_test("token_meters_load_over_burst");
    let mut lab = test_lab();
    let cown = lab.create_cown(Slot(0));

    for _ in 0..300 {
        let target = cown.clone();
        schedule_fn(&[cown.clone()], move || {
            target.with_mut(|s: &mut Slot| s.0 += 1);
        })
        .unwrap();
    }

    lab.run_until_quiescent();
    assert_eq!(cown.with(|s: &Slot| s.0), 300);
    assert!(!cown.debug_has_token(), "token consumed after the drain");
    assert!(cown.debug_queue_sleeping());
    test_complete!("token_meters_load_over_burst");
}

/// An overloaded receiver escalates itself when the token cycle observes
/// the flag; the escalation is visible to behaviours running in the same
/// burst, and the priority resets once the queue drains.
#[test]
fn overload_escalates_during_burst() {
    init_test("overload_escalates_during_burst");
    let mut lab = test_lab();
    let r = lab.create_cown(Slot(0));
    r.debug_set_overloaded(true);

    let seen = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..3 {
        let probe = r.clone();
        let sink = Arc::clone(&seen);
        schedule_fn(&[r.clone()], move || {
            sink.lock().unwrap().push(probe.priority());
        })
        .unwrap();
    }
    lab.run_until_quiescent();

    let seen = seen.lock().unwrap().clone();
    assert!(
        seen.iter().copied().any(Priority::is_high),
        "escalation visible during the burst: {seen:?}"
    );
    assert_eq!(r.priority(), Priority::Normal, "priority reset on sleep");
    test_complete!("overload_escalates_during_burst");
}

/// Muting under backpressure: a sender whose behaviour feeds an
/// overloaded, loaded receiver is transitioned to Low and parked under it;
/// once the receiver quiets down, the sender is rescheduled exactly once
/// and its pending work runs.
#[test]
fn sender_is_muted_and_recovers() {
    init_test("sender_is_muted_and_recovers");
    let mut lab = test_lab();
    let s = lab.create_cown(Slot(0));
    let r = lab.create_cown(Slot(0));
    r.debug_set_overloaded(true);

    // Priority of the sender as observed by the receiver mid-storm.
    let observed = Arc::new(Mutex::new(Vec::new()));

    // Behaviour chain on the sender:
    //   b1 primes the receiver (token cycle escalates it to High),
    //   b2 sends again while the receiver is High with a pending queue,
    //      which selects it as mutor and parks the sender,
    //   b3 (pending while muted) proves the sender was rescheduled.
    let (s1, r1) = (s.clone(), r.clone());
    let (s_seen, r_seen) = (s.clone(), Arc::clone(&observed));
    let b3_ran = s.clone();
    schedule_fn(&[s.clone()], move || {
        // b1: wake the receiver with an empty message.
        schedule_fn(&[r1.clone()], || {}).unwrap();

        let (s2, r2) = (s1.clone(), r1.clone());
        let (s_probe, sink) = (s_seen.clone(), r_seen.clone());
        let b3_flag = b3_ran.clone();
        schedule_fn(&[s1.clone()], move || {
            // b2: the receiver is High (overloaded token cycle) and its
            // queue holds the circulating token, so this send mutes us.
            let probe = s_probe.clone();
            let sink_inner = sink.clone();
            schedule_fn(&[r2.clone()], move || {
                sink_inner.lock().unwrap().push(probe.priority());
            })
            .unwrap();

            // b3: queued behind the mute; runs only after the unmute
            // reschedules the sender.
            let flag = b3_flag.clone();
            schedule_fn(&[s2.clone()], move || {
                flag.with_mut(|slot: &mut Slot| slot.0 = 7);
            })
            .unwrap();
        })
        .unwrap();
    })
    .unwrap();

    lab.run_until_quiescent();

    let observed = observed.lock().unwrap().clone();
    assert_eq!(
        observed,
        vec![Priority::Low],
        "receiver saw the sender muted"
    );
    assert_eq!(s.priority(), Priority::Normal, "sender recovered");
    assert_eq!(s.with(|slot: &Slot| slot.0), 7, "pending work ran after unmute");
    assert!(s.debug_queue_sleeping());
    test_complete!("sender_is_muted_and_recovers");
}

/// Self-sends never mute: a behaviour whose receivers include one of its
/// own participants skips the backpressure scan entirely.
#[test]
fn self_send_does_not_mute() {
    init_test("self_send_does_not_mute");
    let mut lab = test_lab();
    let s = lab.create_cown(Slot(0));
    s.debug_set_overloaded(true);

    // Prime so the token cycle escalates the cown while it still has the
    // recursive sends in its queue.
    let outer = s.clone();
    schedule_fn(&[s.clone()], move || {
        let inner = outer.clone();
        schedule_fn(&[outer.clone()], move || {
            inner.with_mut(|slot: &mut Slot| slot.0 += 1);
        })
        .unwrap();
    })
    .unwrap();

    lab.run_until_quiescent();
    assert_eq!(s.with(|slot: &Slot| slot.0), 1, "recursive send ran");
    assert_eq!(s.priority(), Priority::Normal);
    test_complete!("self_send_does_not_mute");
}

/// Priority transition rules: a drained cycle always lands back at Normal,
/// and re-running an idle cown does not disturb it (idempotence).
#[test]
fn normal_transition_is_noop_from_normal() {
    init_test("normal_transition_is_noop_from_normal");
    let mut lab = test_lab();
    let cown = lab.create_cown(Slot(0));

    schedule_fn(&[cown.clone()], || {}).unwrap();
    lab.run_until_quiescent();
    assert_eq!(cown.priority(), Priority::Normal);

    cown.notify();
    lab.run_until_quiescent();
    assert_eq!(cown.priority(), Priority::Normal);
    test_complete!("normal_transition_is_noop_from_normal");
}

/// A chain interrupted at a busy participant still completes, and the
/// blocker bookkeeping is cleaned up behind it.
#[test]
fn interrupted_chain_completes_and_clears() {
    init_test("interrupted_chain_completes_and_clears");
    let mut lab = test_lab();
    let mut cowns: Vec<_> = (0..3).map(|_| lab.create_cown(Slot(0))).collect();
    cowns.sort_by_key(cowns::CownRef::id);
    let (a, b, c) = (cowns[0].clone(), cowns[1].clone(), cowns[2].clone());

    schedule_fn(&[b.clone()], || {}).unwrap();
    b.debug_set_overloaded(true);
    schedule_fn(&[a.clone(), b.clone(), c.clone()], || {}).unwrap();
    assert_eq!(a.debug_blocker(), Some(b.id()));

    lab.run_until_quiescent();
    assert_eq!(a.debug_blocker(), None, "chain completed and cleared");
    for cown in [&a, &b, &c] {
        assert!(cown.debug_queue_sleeping());
        assert_eq!(cown.priority(), Priority::Normal);
    }
    test_complete!("interrupted_chain_completes_and_clears");
}
