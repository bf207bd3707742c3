//! Systematic-testing injection points.
//!
//! The scheduling core calls [`yield_point`] around every atomic
//! transition and [`coin`] at every randomized decision. In production
//! both are no-ops. When a lab context is installed on the current thread
//! (see [`LabRuntime`](crate::lab::LabRuntime)), `yield_point` counts
//! interleaving opportunities and `coin` draws from the lab's
//! deterministic RNG, so a seed fully determines every perturbed
//! decision: spurious CAS retries, forced priority escalations, and
//! overload flips.

use std::cell::RefCell;

use crate::util::DetRng;

thread_local! {
    static CONTEXT: RefCell<Option<SystematicContext>> = const { RefCell::new(None) };
}

#[derive(Debug)]
struct SystematicContext {
    rng: DetRng,
    chaos: bool,
    steps: u64,
}

/// Installs a systematic context on the current thread.
///
/// `chaos` enables the randomized perturbations; without it the context
/// only counts yield points.
pub(crate) fn install(seed: u64, chaos: bool) {
    CONTEXT.with(|ctx| {
        *ctx.borrow_mut() = Some(SystematicContext {
            rng: DetRng::new(seed),
            chaos,
            steps: 0,
        });
    });
}

/// Removes the systematic context from the current thread.
pub(crate) fn clear() {
    CONTEXT.with(|ctx| ctx.borrow_mut().take());
}

/// Returns the number of yield points observed since install.
#[allow(dead_code)]
pub(crate) fn steps() -> u64 {
    CONTEXT.with(|ctx| ctx.borrow().as_ref().map_or(0, |c| c.steps))
}

/// An interleaving opportunity.
///
/// No-op in production. Under a lab context, counts the step so traces
/// can be aligned across runs with the same seed.
#[inline]
pub(crate) fn yield_point() {
    CONTEXT.with(|ctx| {
        if let Some(c) = ctx.borrow_mut().as_mut() {
            c.steps += 1;
        }
    });
}

/// Draws a coin that lands heads with probability `1 / 2^bits`.
///
/// Always false in production and in labs without chaos enabled.
#[inline]
pub(crate) fn coin(bits: u32) -> bool {
    CONTEXT.with(|ctx| {
        ctx.borrow_mut()
            .as_mut()
            .is_some_and(|c| c.chaos && c.rng.coin(bits))
    })
}
