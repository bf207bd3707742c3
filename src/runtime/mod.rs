//! The cown scheduling core.
//!
//! Layout mirrors the coupling in the design: the atomic words
//! ([`backpressure`], [`status`]) and the queue facade ([`queue`]) are
//! leaves; [`message`] carries the multi-message data model; [`cown`]
//! ties them together with the acquisition protocol, the run loop, and
//! the leak-detector hooks; [`worker`] and [`pool`] provide the scheduler
//! the cowns run on.

pub(crate) mod backpressure;
pub(crate) mod cown;
pub(crate) mod message;
pub(crate) mod pool;
pub(crate) mod queue;
pub(crate) mod status;
pub(crate) mod worker;

pub use backpressure::Priority;
pub use cown::{schedule, schedule_fn, CownRef, CownWeak};
pub use message::Behaviour;
pub use pool::Runtime;
