use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::rc::Rc;

use log::warn;
use smallvec::SmallVec;

use crate::arena::{Arena, Id};
use crate::event::Outcome;
use crate::step::Step;

const LOG: &str = "moot_event";

/// Sentinel for "no neighbour" in the intrusive waiting lists.
pub(crate) const NIL: u32 = u32::MAX;

/// One single-shot completion record.
///
/// `owner` is cleared exactly once, when the record completes; an event with
/// `owner == None` is inert. While `owner` is set the record sits on that
/// rendezvous' waiting list, doubly linked through `prev`/`next` indices.
pub(crate) struct EventRecord {
    refs: u32,
    owner: Option<Id>,
    rid: usize,
    prev: u32,
    next: u32,
    chain: SmallVec<[Chain; 1]>,
    tag: Option<&'static str>,
}

/// One deferred action fired when an event completes.
pub(crate) enum Chain {
    /// Fire another event with the source's outcome.
    Event(Id),
    /// Fire another event only if the source cancels; release it otherwise.
    Cancel(Id),
    /// Invoke a callback with the source's outcome.
    Func(Box<dyn FnOnce(Outcome)>),
}

/// Completion behaviour of a rendezvous; the only polymorphic part.
pub(crate) enum Kind {
    /// Completed events queue up for `pop_ready` in completion order.
    Queue,
    /// Each completion invokes the hook with `(rid, outcome)`.
    Functional(Rc<dyn Fn(usize, Outcome)>),
    /// A completion fans out to the downstream events, in order.
    Distribute(Vec<Id>),
}

pub(crate) struct RdvRecord {
    refs: u32,
    /// Combinator-owned records free themselves once their waiting list
    /// empties instead of waiting on a handle drop.
    auto_free: bool,
    volatile: bool,
    kind: Kind,
    waiting: u32,
    blocked: Option<(Box<dyn Step>, u32)>,
    enqueued: bool,
    ready: VecDeque<Id>,
    next_rid: usize,
}

struct State {
    events: Arena<EventRecord>,
    rdvs: Arena<RdvRecord>,
    unblocked: VecDeque<Id>,
}

/// Shared event and rendezvous state.
///
/// One `Core` backs one driver; handles created from it (events,
/// rendezvous) point back into it. Cores are cheap to clone and
/// single-threaded by contract: reference counts are plain integers and
/// nothing here is `Send`.
#[derive(Clone)]
pub struct Core {
    state: Rc<RefCell<State>>,
}

impl Default for Core {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core").finish()
    }
}

enum Completion {
    Nothing,
    Unblock(Id),
    Hook(Rc<dyn Fn(usize, Outcome)>, usize),
    Fan(Vec<Id>),
}

impl Core {
    /// Create a fresh, empty core.
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(State {
                events: Arena::new(),
                rdvs: Arena::new(),
                unblocked: VecDeque::new(),
            })),
        }
    }

    pub(crate) fn same_core(&self, other: &Core) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }

    // --- rendezvous records ---

    pub(crate) fn new_rdv(&self, kind: Kind, volatile: bool, auto_free: bool) -> Id {
        self.state.borrow_mut().rdvs.insert(RdvRecord {
            refs: if auto_free { 0 } else { 1 },
            auto_free,
            volatile,
            kind,
            waiting: NIL,
            blocked: None,
            enqueued: false,
            ready: VecDeque::new(),
            next_rid: 1,
        })
    }

    pub(crate) fn rdv_use(&self, id: Id) {
        if let Some(r) = self.state.borrow_mut().rdvs.get_mut(id) {
            r.refs += 1;
        }
    }

    pub(crate) fn rdv_unuse(&self, id: Id) {
        let destroy = {
            let mut st = self.state.borrow_mut();
            match st.rdvs.get_mut(id) {
                Some(r) => {
                    debug_assert!(r.refs > 0);
                    r.refs -= 1;
                    r.refs == 0
                }
                None => false,
            }
        };
        if destroy {
            self.cancel_waiting(id);
            self.free_rdv(id);
        }
    }

    /// Cancel every event still on the waiting list. Each cancellation
    /// unlinks the list head, so this simply re-reads the head until the
    /// list is empty.
    fn cancel_waiting(&self, id: Id) {
        loop {
            let head = {
                let st = self.state.borrow();
                match st.rdvs.get(id) {
                    Some(r) if r.waiting != NIL => Some(st.events.id_at(r.waiting)),
                    _ => None,
                }
            };
            let Some(eid) = head else { break };
            self.simple_trigger(eid, Outcome::Cancelled);
        }
    }

    /// Remove the record and release everything it still holds: queued
    /// ready events, undelivered fan-out targets, and the blocked step.
    fn free_rdv(&self, id: Id) {
        let Some(record) = self.state.borrow_mut().rdvs.remove(id) else {
            return;
        };
        debug_assert!(record.waiting == NIL);
        for eid in record.ready {
            self.event_unuse_clean(eid);
        }
        if let Kind::Distribute(targets) = record.kind {
            for t in targets {
                self.event_unuse(t);
            }
        }
        if let Some((step, _)) = record.blocked {
            step.abandoned();
        }
    }

    // --- event records ---

    pub(crate) fn new_event(&self, owner: Id, rid: usize) -> Id {
        let mut st = self.state.borrow_mut();
        let st = &mut *st;
        let head = st
            .rdvs
            .get(owner)
            .expect("event created on a destroyed rendezvous")
            .waiting;
        let eid = st.events.insert(EventRecord {
            refs: 1,
            owner: Some(owner),
            rid,
            prev: NIL,
            next: head,
            chain: SmallVec::new(),
            tag: None,
        });
        if head != NIL {
            st.events.index_mut(head).prev = eid.index;
        }
        st.rdvs.get_mut(owner).unwrap().waiting = eid.index;
        eid
    }

    pub(crate) fn event_use(&self, id: Id) {
        if let Some(e) = self.state.borrow_mut().events.get_mut(id) {
            e.refs += 1;
        }
    }

    /// Drop one reference. Dropping the last reference to a still-live
    /// event completes it as a cancellation first.
    pub(crate) fn event_unuse(&self, id: Id) {
        let premature = {
            let mut st = self.state.borrow_mut();
            let st = &mut *st;
            let Some(e) = st.events.get_mut(id) else { return };
            debug_assert!(e.refs > 0);
            e.refs -= 1;
            if e.refs > 0 {
                return;
            }
            let owner = e.owner;
            let tag = e.tag;
            match owner {
                None => {
                    st.events.remove(id);
                    return;
                }
                Some(owner) => {
                    let quiet = st.rdvs.get(owner).map(|r| r.volatile).unwrap_or(true);
                    (tag, quiet)
                }
            }
        };
        let (tag, quiet) = premature;
        if !quiet {
            warn!(
                target: LOG,
                "event {} dropped before completing",
                tag.unwrap_or("<unannotated>")
            );
        }
        self.simple_trigger(id, Outcome::Cancelled);
        let mut st = self.state.borrow_mut();
        if let Some(e) = st.events.get(id) {
            debug_assert_eq!(e.refs, 0);
            debug_assert!(e.owner.is_none());
            st.events.remove(id);
        }
    }

    /// Drop one reference with no side effect at zero. Used for events that
    /// are known to be complete already (the ready queue's references).
    pub(crate) fn event_unuse_clean(&self, id: Id) {
        let mut st = self.state.borrow_mut();
        let Some(e) = st.events.get_mut(id) else { return };
        debug_assert!(e.refs > 0);
        e.refs -= 1;
        if e.refs == 0 {
            debug_assert!(e.owner.is_none());
            st.events.remove(id);
        }
    }

    pub(crate) fn event_live(&self, id: Id) -> bool {
        self.state
            .borrow()
            .events
            .get(id)
            .is_some_and(|e| e.owner.is_some())
    }

    pub(crate) fn event_annotate(&self, id: Id, tag: &'static str) {
        if let Some(e) = self.state.borrow_mut().events.get_mut(id) {
            e.tag = Some(tag);
        }
    }

    /// Complete an event.
    ///
    /// Idempotent: completing a stale or already-complete event does
    /// nothing. This is the single path through which every event leaves
    /// its waiting list, so completion from either side (trigger, cancel,
    /// handle drop, rendezvous destruction) behaves identically.
    pub(crate) fn simple_trigger(&self, id: Id, outcome: Outcome) {
        let (completion, chain, free_owner) = {
            let mut st = self.state.borrow_mut();
            let st = &mut *st;
            let Some(rec) = st.events.get_mut(id) else { return };
            let Some(owner) = rec.owner.take() else { return };
            let rid = rec.rid;
            let chain = mem::take(&mut rec.chain);
            let prev = rec.prev;
            let next = rec.next;
            rec.prev = NIL;
            rec.next = NIL;

            if prev != NIL {
                st.events.index_mut(prev).next = next;
            }
            if next != NIL {
                st.events.index_mut(next).prev = prev;
            }
            let rdv = st
                .rdvs
                .get_mut(owner)
                .expect("live event with a destroyed owner");
            if prev == NIL {
                rdv.waiting = next;
            }

            let completion = match &mut rdv.kind {
                Kind::Queue => {
                    if outcome == Outcome::Fired {
                        // The ready queue keeps the record alive until the
                        // rid is consumed.
                        rdv.ready.push_back(id);
                        st.events.index_mut(id.index).refs += 1;
                        Completion::Unblock(owner)
                    } else {
                        Completion::Nothing
                    }
                }
                Kind::Functional(hook) => Completion::Hook(Rc::clone(hook), rid),
                Kind::Distribute(targets) => Completion::Fan(mem::take(targets)),
            };
            let free_owner =
                (rdv.auto_free && rdv.refs == 0 && rdv.waiting == NIL).then_some(owner);
            (completion, chain, free_owner)
        };

        match completion {
            Completion::Nothing => {}
            Completion::Unblock(owner) => self.unblock(owner),
            Completion::Hook(hook, rid) => hook(rid, outcome),
            Completion::Fan(targets) => {
                for t in targets {
                    self.simple_trigger(t, outcome);
                    self.event_unuse(t);
                }
            }
        }
        if let Some(owner) = free_owner {
            self.free_rdv(owner);
        }
        for link in chain {
            self.fire_chain(link, outcome);
        }
    }

    fn fire_chain(&self, link: Chain, outcome: Outcome) {
        match link {
            Chain::Event(t) => {
                self.simple_trigger(t, outcome);
                self.event_unuse(t);
            }
            Chain::Cancel(t) => {
                if outcome == Outcome::Cancelled {
                    self.simple_trigger(t, Outcome::Fired);
                }
                self.event_unuse(t);
            }
            Chain::Func(f) => f(outcome),
        }
    }

    /// Register a chain link on `id`. The link's event reference is donated
    /// by the caller. Registering on an already-complete event cancels the
    /// target immediately.
    pub(crate) fn event_at(&self, id: Id, link: Chain) {
        let leftover = {
            let mut st = self.state.borrow_mut();
            match st.events.get_mut(id) {
                Some(rec) if rec.owner.is_some() => {
                    if matches!(link, Chain::Cancel(_)) {
                        debug_assert!(
                            !rec.chain.iter().any(|c| matches!(c, Chain::Cancel(_))),
                            "cancel hook registered twice"
                        );
                    }
                    rec.chain.push(link);
                    None
                }
                _ => Some(link),
            }
        };
        if let Some(link) = leftover {
            match link {
                Chain::Event(t) | Chain::Cancel(t) => {
                    self.simple_trigger(t, Outcome::Cancelled);
                    self.event_unuse(t);
                }
                Chain::Func(_) => {}
            }
        }
    }

    // --- blocking and the unblocked queue ---

    pub(crate) fn block(&self, id: Id, step: Box<dyn Step>, at: u32) {
        let enqueue = {
            let mut st = self.state.borrow_mut();
            let r = st.rdvs.get_mut(id).expect("block on a destroyed rendezvous");
            debug_assert!(r.blocked.is_none(), "rendezvous blocked twice");
            r.blocked = Some((step, at));
            r.enqueued = false;
            // Completions that happened before the step blocked must still
            // wake it.
            !r.ready.is_empty()
        };
        if enqueue {
            self.unblock(id);
        }
    }

    pub(crate) fn unblock(&self, id: Id) {
        let mut st = self.state.borrow_mut();
        let st = &mut *st;
        if let Some(r) = st.rdvs.get_mut(id) {
            if r.blocked.is_some() && !r.enqueued {
                r.enqueued = true;
                st.unblocked.push_back(id);
            }
        }
    }

    /// Resume every unblocked step, to fixpoint.
    ///
    /// Resumed steps may trigger further events and re-block; draining
    /// continues until the queue is empty. Entries for rendezvous destroyed
    /// since they were enqueued are skipped.
    pub fn drain_unblocked(&self) {
        loop {
            let next = self.state.borrow_mut().unblocked.pop_front();
            let Some(id) = next else { break };
            let resumed = {
                let mut st = self.state.borrow_mut();
                match st.rdvs.get_mut(id) {
                    Some(r) => {
                        r.enqueued = false;
                        r.blocked.take()
                    }
                    None => None,
                }
            };
            if let Some((step, at)) = resumed {
                step.resume(at);
            }
        }
    }

    /// True if any step is waiting to be resumed.
    pub fn has_unblocked(&self) -> bool {
        !self.state.borrow().unblocked.is_empty()
    }

    // --- queue-rendezvous operations ---

    pub(crate) fn rdv_has_ready(&self, id: Id) -> bool {
        self.state
            .borrow()
            .rdvs
            .get(id)
            .is_some_and(|r| !r.ready.is_empty())
    }

    pub(crate) fn rdv_pop_ready(&self, id: Id) -> Option<usize> {
        let eid = self
            .state
            .borrow_mut()
            .rdvs
            .get_mut(id)
            .and_then(|r| r.ready.pop_front())?;
        let rid = self.state.borrow().events.get(eid).map(|e| e.rid);
        self.event_unuse_clean(eid);
        rid
    }

    /// Cancel all waiting events and drop all ready events. The rendezvous
    /// itself stays usable.
    pub(crate) fn rdv_clear(&self, id: Id) {
        self.cancel_waiting(id);
        let ready = self
            .state
            .borrow_mut()
            .rdvs
            .get_mut(id)
            .map(|r| mem::take(&mut r.ready))
            .unwrap_or_default();
        for eid in ready {
            self.event_unuse_clean(eid);
        }
    }

    pub(crate) fn rdv_next_rid(&self, id: Id) -> usize {
        let mut st = self.state.borrow_mut();
        let r = st.rdvs.get_mut(id).expect("rendezvous gone");
        let rid = r.next_rid;
        r.next_rid += 1;
        rid
    }

    /// Number of events still waiting on the rendezvous.
    pub(crate) fn rdv_waiting(&self, id: Id) -> usize {
        let st = self.state.borrow();
        let Some(r) = st.rdvs.get(id) else { return 0 };
        let mut n = 0;
        let mut ix = r.waiting;
        while ix != NIL {
            n += 1;
            ix = st
                .events
                .get(st.events.id_at(ix))
                .map(|e| e.next)
                .unwrap_or(NIL);
        }
        n
    }

    #[cfg(test)]
    pub(crate) fn live_events(&self) -> usize {
        self.state.borrow().events.len()
    }
}
