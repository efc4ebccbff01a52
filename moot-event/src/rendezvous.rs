use std::fmt;
use std::rc::Rc;

use crate::arena::Id;
use crate::event::{Event, Outcome, SlotGroup};
use crate::state::{Core, Kind};
use crate::step::Step;

/// Whether a rendezvous tolerates its events being dropped live.
///
/// A normal rendezvous logs a warning when an event is dropped without
/// completing; a volatile one treats that as ordinary cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Warn on events dropped before completion.
    #[default]
    Normal,
    /// Dropped-live events are expected; stay quiet.
    Volatile,
}

/// Counted handle to a rendezvous record. The last drop destroys the
/// record: all waiting events are cancelled and a still-blocked step is
/// handed to its `abandoned` hook.
pub(crate) struct RdvHandle {
    core: Core,
    id: Id,
}

impl RdvHandle {
    fn new(core: &Core, kind: Kind, mode: Mode) -> Self {
        let id = core.new_rdv(kind, mode == Mode::Volatile, false);
        Self {
            core: core.clone(),
            id,
        }
    }

    fn event<S: SlotGroup>(&self, rid: usize, slots: S) -> Event<S> {
        let id = self.core.new_event(self.id, rid);
        Event::new(self.core.clone(), id, slots)
    }
}

impl Clone for RdvHandle {
    fn clone(&self) -> Self {
        self.core.rdv_use(self.id);
        Self {
            core: self.core.clone(),
            id: self.id,
        }
    }
}

impl Drop for RdvHandle {
    fn drop(&mut self) {
        self.core.rdv_unuse(self.id);
    }
}

macro_rules! queue_api {
    () => {
        /// True if a completed rid is waiting to be consumed.
        pub fn has_ready(&self) -> bool {
            self.inner.core.rdv_has_ready(self.inner.id)
        }

        /// Consume the next completed rid, in completion order.
        pub fn pop_ready(&self) -> Option<usize> {
            self.inner.core.rdv_pop_ready(self.inner.id)
        }

        /// Cancel all waiting events and drop all ready events.
        ///
        /// The rendezvous stays usable; a blocked step stays blocked.
        pub fn clear(&self) {
            self.inner.core.rdv_clear(self.inner.id)
        }

        /// Park `step` here until a completion unblocks it.
        ///
        /// At most one step may be blocked at a time. `at` is handed back
        /// to [`Step::resume`] when the step runs again.
        pub fn block(&self, step: Box<dyn Step>, at: u32) {
            self.inner.core.block(self.inner.id, step, at)
        }

        /// Number of events still waiting on this rendezvous.
        pub fn waiting(&self) -> usize {
            self.inner.core.rdv_waiting(self.inner.id)
        }
    };
}

/// Rendezvous with caller-controlled completion identifiers.
///
/// Each event is created with an explicit rid; completed rids are consumed
/// in completion order with [`pop_ready`](Rendezvous::pop_ready).
#[derive(Clone)]
pub struct Rendezvous {
    inner: RdvHandle,
}

impl Rendezvous {
    /// Create a rendezvous on `core`.
    pub fn new(core: &Core, mode: Mode) -> Self {
        Self {
            inner: RdvHandle::new(core, Kind::Queue, mode),
        }
    }

    /// Create an event carrying no output, identified by `rid`.
    pub fn event(&self, rid: usize) -> Event {
        self.inner.event(rid, ())
    }

    /// Create an event writing `slots` when it fires, identified by `rid`.
    pub fn event_to<S: SlotGroup>(&self, rid: usize, slots: S) -> Event<S> {
        self.inner.event(rid, slots)
    }

    queue_api!();
}

impl fmt::Debug for Rendezvous {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rendezvous")
            .field("waiting", &self.waiting())
            .field("has_ready", &self.has_ready())
            .finish()
    }
}

/// Rendezvous that assigns completion identifiers itself.
///
/// Events receive rids in creation order, counting from 1.
#[derive(Clone)]
pub struct Gather {
    inner: RdvHandle,
}

impl Gather {
    /// Create a gather rendezvous on `core`.
    pub fn new(core: &Core, mode: Mode) -> Self {
        Self {
            inner: RdvHandle::new(core, Kind::Queue, mode),
        }
    }

    /// Create an event carrying no output.
    pub fn event(&self) -> Event {
        let rid = self.inner.core.rdv_next_rid(self.inner.id);
        self.inner.event(rid, ())
    }

    /// Create an event writing `slots` when it fires.
    pub fn event_to<S: SlotGroup>(&self, slots: S) -> Event<S> {
        let rid = self.inner.core.rdv_next_rid(self.inner.id);
        self.inner.event(rid, slots)
    }

    queue_api!();
}

impl fmt::Debug for Gather {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gather")
            .field("waiting", &self.waiting())
            .field("has_ready", &self.has_ready())
            .finish()
    }
}

/// Rendezvous that runs a hook per completion instead of queueing.
///
/// The hook receives the completed event's rid and outcome. There is no
/// ready queue and nothing to pop.
#[derive(Clone)]
pub struct Functional {
    inner: RdvHandle,
}

impl Functional {
    /// Create a functional rendezvous on `core` with the given hook.
    pub fn new(core: &Core, mode: Mode, hook: impl Fn(usize, Outcome) + 'static) -> Self {
        Self {
            inner: RdvHandle::new(core, Kind::Functional(Rc::new(hook)), mode),
        }
    }

    /// Create an event carrying no output, identified by `rid`.
    pub fn event(&self, rid: usize) -> Event {
        self.inner.event(rid, ())
    }

    /// Create an event writing `slots` when it fires, identified by `rid`.
    ///
    /// Slots are written before the hook runs.
    pub fn event_to<S: SlotGroup>(&self, rid: usize, slots: S) -> Event<S> {
        self.inner.event(rid, slots)
    }

    /// Number of events still waiting on this rendezvous.
    pub fn waiting(&self) -> usize {
        self.inner.core.rdv_waiting(self.inner.id)
    }
}

impl fmt::Debug for Functional {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Functional")
            .field("waiting", &self.waiting())
            .finish()
    }
}
