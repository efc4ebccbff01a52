//! Cooperative synchronisation for the moot runtime.
//!
//! Nothing here blocks a thread: a [`Mutex`] is a FIFO queue of completion
//! events, handed the lock one at a time on the driver thread. Higher-level
//! wrappers (file descriptors in particular) use it to serialise reads and
//! writes issued by independent suspended computations.
#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    clippy::missing_safety_doc
)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use moot_event::Event;

/// A cooperative mutual-exclusion queue.
///
/// [`acquire`](Mutex::acquire) takes a completion event that fires once the
/// caller holds the lock — immediately if it is free, or when every earlier
/// waiter has released. Waiters whose events have been cancelled in the
/// meantime are skipped at release time.
///
/// Clones share the same lock.
#[derive(Clone)]
pub struct Mutex {
    shared: Rc<Shared>,
}

struct Shared {
    locked: Cell<bool>,
    waiters: RefCell<VecDeque<Event>>,
}

impl Mutex {
    /// Create an unlocked mutex.
    pub fn new() -> Self {
        Self {
            shared: Rc::new(Shared {
                locked: Cell::new(false),
                waiters: RefCell::new(VecDeque::new()),
            }),
        }
    }

    /// Request the lock, firing `ready` once it is held.
    ///
    /// If the lock is free it is taken and `ready` fires before this call
    /// returns; otherwise `ready` joins the wait queue. Cancelling `ready`
    /// withdraws the request.
    pub fn acquire(&self, ready: Event) {
        if !self.shared.locked.get() {
            self.shared.locked.set(true);
            ready.trigger(());
        } else {
            self.shared.waiters.borrow_mut().push_back(ready);
        }
    }

    /// Take the lock if it is free.
    pub fn try_acquire(&self) -> bool {
        if self.shared.locked.get() {
            false
        } else {
            self.shared.locked.set(true);
            true
        }
    }

    /// Release the lock, handing it to the next live waiter.
    ///
    /// Must only be called by the current holder.
    pub fn release(&self) {
        debug_assert!(self.shared.locked.get(), "release of an unlocked mutex");
        loop {
            let next = self.shared.waiters.borrow_mut().pop_front();
            match next {
                Some(waiter) if waiter.is_live() => {
                    // Ownership passes directly; the lock never unlocks.
                    waiter.trigger(());
                    return;
                }
                Some(_) => continue,
                None => {
                    self.shared.locked.set(false);
                    return;
                }
            }
        }
    }

    /// True while some caller holds the lock.
    pub fn is_locked(&self) -> bool {
        self.shared.locked.get()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Mutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.shared.locked.get())
            .field("waiters", &self.shared.waiters.borrow().len())
            .finish()
    }
}
