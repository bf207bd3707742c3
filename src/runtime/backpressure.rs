//! The packed backpressure word: priority plus blocker.
//!
//! A single atomic word carries a cown's scheduling priority in its low
//! two bits and the id of the cown it is currently blocked on in the
//! upper bits, so the pair transitions atomically under CAS.
//!
//! The priorities form a lattice `Low < Normal < MaybeHigh < High` with
//! controlled transitions:
//!
//! - `-> High` always wins.
//! - `-> MaybeHigh` only succeeds from `High` (token-driven demotion).
//! - `-> Normal` only succeeds from `Low`, unless the caller passes the
//!   *exact* flag, which overwrites anything.
//! - `-> Low` is performed only by the worker muting a sender.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::lab::systematic;
use crate::types::CownId;

/// Scheduling priority of a cown.
///
/// The encoding reserves bit `0b10` as the "high" bit so `High` and
/// `MaybeHigh` can be tested with a single mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Priority {
    /// Default priority.
    Normal = 0b00,
    /// Muted: the cown is kept off every runqueue.
    Low = 0b01,
    /// Escalated for deadlock avoidance or overload.
    High = 0b10,
    /// Recently high; one more quiet token interval demotes to normal.
    MaybeHigh = 0b11,
}

impl Priority {
    const MASK: u64 = 0b11;
    const HIGH_BIT: u64 = 0b10;

    /// Returns true for `High` and `MaybeHigh`.
    #[must_use]
    pub const fn is_high(self) -> bool {
        (self as u64) & Self::HIGH_BIT != 0
    }

    const fn from_bits(bits: u64) -> Self {
        match bits & Self::MASK {
            0b00 => Self::Normal,
            0b01 => Self::Low,
            0b10 => Self::High,
            _ => Self::MaybeHigh,
        }
    }
}

/// Outcome of a priority transition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transition {
    /// Priority observed before the attempt.
    pub(crate) prev: Priority,
    /// Whether the word was actually updated.
    pub(crate) applied: bool,
}

/// The packed (blocker, priority) word.
#[derive(Debug)]
pub(crate) struct BackpressureWord {
    bits: AtomicU64,
}

fn pack(blocker: Option<CownId>, priority: Priority) -> u64 {
    (blocker.map_or(0, CownId::as_u64) << 2) | priority as u64
}

fn unpack(bits: u64) -> (Option<CownId>, Priority) {
    (CownId::from_u64(bits >> 2), Priority::from_bits(bits))
}

impl BackpressureWord {
    /// A fresh word: normal priority, no blocker.
    pub(crate) fn new() -> Self {
        Self {
            bits: AtomicU64::new(pack(None, Priority::Normal)),
        }
    }

    /// Reads the current priority.
    pub(crate) fn priority(&self) -> Priority {
        Priority::from_bits(self.bits.load(Ordering::Acquire))
    }

    /// Reads the current blocker id.
    pub(crate) fn blocker(&self) -> Option<CownId> {
        unpack(self.bits.load(Ordering::Acquire)).0
    }

    /// Transitions the priority, preserving the blocker.
    ///
    /// Encodes the lattice rules: a transition to `Normal` is a no-op
    /// unless the previous priority was `Low` or `exact` is set; a
    /// transition to `MaybeHigh` is a no-op unless the previous priority
    /// was `High`. A CAS retry under a chaotic lab context may spuriously
    /// repeat, mirroring contended hardware.
    pub(crate) fn transition(&self, target: Priority, exact: bool) -> Transition {
        let mut bits = self.bits.load(Ordering::Acquire);
        loop {
            systematic::yield_point();
            let (blocker, prev) = unpack(bits);

            if target == Priority::Normal && prev != Priority::Low && !exact {
                return Transition {
                    prev,
                    applied: false,
                };
            }
            if target == Priority::MaybeHigh && prev != Priority::High {
                return Transition {
                    prev,
                    applied: false,
                };
            }
            if prev == target {
                return Transition {
                    prev,
                    applied: false,
                };
            }

            if !systematic::coin(9) {
                match self.bits.compare_exchange_weak(
                    bits,
                    pack(blocker, target),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        return Transition {
                            prev,
                            applied: true,
                        }
                    }
                    Err(observed) => bits = observed,
                }
            }
        }
    }

    /// Attempts to record the blocker, preserving the priority.
    ///
    /// A failed exchange means another thread changed the word
    /// concurrently; the only transition racing with an acquisition hop is
    /// a priority raise, so the blocker is deliberately not retried.
    /// Returns true if the cown's priority is (now) high, in which case
    /// the caller must escalate the hop.
    pub(crate) fn set_blocker(&self, blocker: Option<CownId>) -> bool {
        let bits = self.bits.load(Ordering::Relaxed);
        systematic::yield_point();
        let (_, priority) = unpack(bits);
        match self.bits.compare_exchange(
            bits,
            pack(blocker, priority),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                systematic::yield_point();
                priority.is_high()
            }
            Err(observed) => {
                let (_, now) = unpack(observed);
                debug_assert!(now.is_high(), "blocker CAS lost to a non-raise");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_word_is_normal_unblocked() {
        let word = BackpressureWord::new();
        assert_eq!(word.priority(), Priority::Normal);
        assert_eq!(word.blocker(), None);
    }

    #[test]
    fn high_always_wins() {
        let word = BackpressureWord::new();
        for start in [Priority::Normal, Priority::Low, Priority::MaybeHigh] {
            word.transition(start, true);
            let t = word.transition(Priority::High, false);
            assert_eq!(t.prev, start);
            assert_eq!(word.priority(), Priority::High);
        }
    }

    #[test]
    fn normal_requires_low_or_exact() {
        let word = BackpressureWord::new();
        word.transition(Priority::High, false);

        let t = word.transition(Priority::Normal, false);
        assert!(!t.applied, "Normal over High needs exact");
        assert_eq!(word.priority(), Priority::High);

        let t = word.transition(Priority::Normal, true);
        assert!(t.applied);
        assert_eq!(word.priority(), Priority::Normal);

        word.transition(Priority::Low, false);
        let t = word.transition(Priority::Normal, false);
        assert!(t.applied, "Normal from Low is the unmute path");
        assert_eq!(t.prev, Priority::Low);
    }

    #[test]
    fn maybe_high_only_from_high() {
        let word = BackpressureWord::new();
        let t = word.transition(Priority::MaybeHigh, false);
        assert!(!t.applied);
        assert_eq!(word.priority(), Priority::Normal);

        word.transition(Priority::High, false);
        let t = word.transition(Priority::MaybeHigh, false);
        assert!(t.applied);
        assert_eq!(word.priority(), Priority::MaybeHigh);
    }

    #[test]
    fn transition_preserves_blocker() {
        let word = BackpressureWord::new();
        let blocker = CownId::new_for_test(17);
        assert!(!word.set_blocker(Some(blocker)));
        word.transition(Priority::High, false);
        assert_eq!(word.blocker(), Some(blocker));

        word.transition(Priority::Normal, true);
        assert_eq!(word.blocker(), Some(blocker));
    }

    #[test]
    fn set_blocker_reports_high() {
        let word = BackpressureWord::new();
        word.transition(Priority::High, false);
        assert!(word.set_blocker(Some(CownId::new_for_test(3))));

        word.transition(Priority::Normal, true);
        assert!(!word.set_blocker(None));
        assert_eq!(word.blocker(), None);
    }

    #[test]
    fn priority_high_mask() {
        assert!(Priority::High.is_high());
        assert!(Priority::MaybeHigh.is_high());
        assert!(!Priority::Normal.is_high());
        assert!(!Priority::Low.is_high());
    }
}
