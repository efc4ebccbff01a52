//! Single-shot completion events and the rendezvous that own them.
//!
//! This crate is the heart of the moot runtime: reference-counted events
//! that complete exactly once (as a trigger or a cancellation), rendezvous
//! that collect those completions, and the protocol by which suspended
//! computations ([`Step`]s) are parked on a rendezvous and resumed through
//! the unblocked queue.
//!
//! Everything here is single-threaded and cooperative. A [`Core`] holds the
//! whole object graph; drivers own one and drain its unblocked queue
//! between I/O waits.
//!
//! # Modules
//! - events: [`Event`], [`Slot`], [`Outcome`], the [`distribute`] combinator.
//! - rendezvous: [`Rendezvous`], [`Gather`], [`Functional`], [`Mode`].
//! - suspension: [`Step`].
#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    clippy::missing_safety_doc
)]

mod arena;
mod event;
mod rendezvous;
mod state;
mod step;

pub use event::{distribute, Event, Outcome, Slot, SlotGroup};
pub use rendezvous::{Functional, Gather, Mode, Rendezvous};
pub use state::Core;
pub use step::Step;
