use std::cell::RefCell;
use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr;
use std::rc::Rc;

use crate::arena::Id;
use crate::state::{Chain, Core, Kind};

/// How an event completed.
///
/// Cancellation is an outcome, not an error: it flows through chains and
/// hooks as a first-class value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The event was triggered normally.
    Fired,
    /// The event was cancelled, or dropped without completing.
    Cancelled,
}

/// A caller-owned output location written when a typed event fires.
///
/// Slots are cheap to clone; all clones refer to the same cell. They stand
/// in for out-parameters: the caller keeps one clone and reads it after the
/// event has fired.
pub struct Slot<T> {
    cell: Rc<RefCell<T>>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Rc::clone(&self.cell),
        }
    }
}

impl<T> Slot<T> {
    /// Create a slot holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            cell: Rc::new(RefCell::new(value)),
        }
    }

    /// Overwrite the slot.
    pub fn set(&self, value: T) {
        *self.cell.borrow_mut() = value;
    }

    /// Read a copy of the slot.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.cell.borrow().clone()
    }

    /// Swap `value` into the slot, returning the previous contents.
    pub fn replace(&self, value: T) -> T {
        self.cell.replace(value)
    }

    /// Take the contents, leaving the default.
    pub fn take(&self) -> T
    where
        T: Default,
    {
        self.cell.take()
    }
}

impl<T: Default> Default for Slot<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Slot").field(&self.cell.borrow()).finish()
    }
}

/// The output destinations of a typed event: zero to four [`Slot`]s.
///
/// Implemented for `()`, a bare `Slot<T>`, and tuples of slots up to four
/// wide. [`Event::trigger`] takes the matching
/// [`Values`](SlotGroup::Values) and writes each slot.
pub trait SlotGroup: 'static {
    /// The values written into this group when the event fires.
    type Values;

    /// Write `values` into the slots.
    fn store(&self, values: Self::Values);
}

impl SlotGroup for () {
    type Values = ();

    fn store(&self, _values: ()) {}
}

impl<A: 'static> SlotGroup for Slot<A> {
    type Values = A;

    fn store(&self, values: A) {
        self.set(values);
    }
}

impl<A: 'static> SlotGroup for (Slot<A>,) {
    type Values = (A,);

    fn store(&self, values: (A,)) {
        self.0.set(values.0);
    }
}

impl<A: 'static, B: 'static> SlotGroup for (Slot<A>, Slot<B>) {
    type Values = (A, B);

    fn store(&self, values: (A, B)) {
        self.0.set(values.0);
        self.1.set(values.1);
    }
}

impl<A: 'static, B: 'static, C: 'static> SlotGroup for (Slot<A>, Slot<B>, Slot<C>) {
    type Values = (A, B, C);

    fn store(&self, values: (A, B, C)) {
        self.0.set(values.0);
        self.1.set(values.1);
        self.2.set(values.2);
    }
}

impl<A: 'static, B: 'static, C: 'static, D: 'static> SlotGroup
    for (Slot<A>, Slot<B>, Slot<C>, Slot<D>)
{
    type Values = (A, B, C, D);

    fn store(&self, values: (A, B, C, D)) {
        self.0.set(values.0);
        self.1.set(values.1);
        self.2.set(values.2);
        self.3.set(values.3);
    }
}

/// Counted reference to an event record.
pub(crate) struct EventRef {
    core: Core,
    id: Id,
}

impl EventRef {
    /// Disassemble without releasing the reference; the caller takes over
    /// the count this handle held.
    fn into_parts(self) -> (Core, Id) {
        let this = ManuallyDrop::new(self);
        // Safety: the field is moved out exactly once and Drop is
        // suppressed, so the reference count transfers rather than leaks.
        let core = unsafe { ptr::read(&this.core) };
        (core, this.id)
    }
}

impl Clone for EventRef {
    fn clone(&self) -> Self {
        self.core.event_use(self.id);
        Self {
            core: self.core.clone(),
            id: self.id,
        }
    }
}

impl Drop for EventRef {
    fn drop(&mut self) {
        self.core.event_unuse(self.id);
    }
}

/// A single-shot completion handle.
///
/// An event completes at most once, either by [`trigger`](Event::trigger)
/// or by [`cancel`](Event::cancel); afterwards it is inert and every
/// further operation on it is a silent no-op. Dropping the last clone of a
/// still-live event counts as cancellation.
///
/// The type parameter is the event's [`SlotGroup`]; the default `()`
/// carries no output.
pub struct Event<S: SlotGroup = ()> {
    inner: Option<EventRef>,
    slots: S,
}

impl<S: SlotGroup> Event<S> {
    pub(crate) fn new(core: Core, id: Id, slots: S) -> Self {
        Self {
            inner: Some(EventRef { core, id }),
            slots,
        }
    }

    pub(crate) fn into_raw(self) -> Option<(Core, Id)> {
        // Slots are dropped here; the record reference is handed over.
        let mut this = self;
        this.inner.take().map(EventRef::into_parts)
    }

    /// True while the event has not yet completed.
    ///
    /// Empty handles and completed events test false.
    pub fn is_live(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|r| r.core.event_live(r.id))
    }

    /// Complete the event, writing `values` into its slots.
    ///
    /// No-op if the event has already completed: the slots keep the values
    /// of the first trigger and no chain fires twice.
    pub fn trigger(&self, values: S::Values) {
        let Some(r) = &self.inner else { return };
        if !r.core.event_live(r.id) {
            return;
        }
        self.slots.store(values);
        r.core.simple_trigger(r.id, Outcome::Fired);
    }

    /// Complete the event as a cancellation. Slots are left untouched.
    pub fn cancel(&self) {
        if let Some(r) = &self.inner {
            r.core.simple_trigger(r.id, Outcome::Cancelled);
        }
    }

    /// Fire `target` when this event completes, with the same outcome.
    ///
    /// Chains fire in registration order. If this event has already
    /// completed (or is empty), `target` is cancelled instead.
    pub fn at_trigger(&self, target: Event) {
        match &self.inner {
            Some(r) => {
                if let Some((_, tid)) = target.into_raw() {
                    r.core.event_at(r.id, Chain::Event(tid));
                }
            }
            None => target.cancel(),
        }
    }

    /// Invoke `f` with the outcome when this event completes.
    pub fn at_trigger_fn(&self, f: impl FnOnce(Outcome) + 'static) {
        if let Some(r) = &self.inner {
            r.core.event_at(r.id, Chain::Func(Box::new(f)));
        }
    }

    /// Fire `target` if and only if this event is cancelled.
    ///
    /// When this event fires normally, `target` is released instead. At
    /// most one cancel hook may be registered per event.
    pub fn at_cancel(&self, target: Event) {
        match &self.inner {
            Some(r) => {
                if let Some((_, tid)) = target.into_raw() {
                    r.core.event_at(r.id, Chain::Cancel(tid));
                }
            }
            None => target.cancel(),
        }
    }

    /// Attach a diagnostic tag, reported if the event is dropped live.
    pub fn annotate(&self, tag: &'static str) {
        if let Some(r) = &self.inner {
            r.core.event_annotate(r.id, tag);
        }
    }
}

impl Event<()> {
    /// The "no completion desired" handle: never live, and every operation
    /// on it is a silent no-op.
    pub fn empty() -> Self {
        Self {
            inner: None,
            slots: (),
        }
    }
}

impl Default for Event<()> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<S: SlotGroup + Clone> Clone for Event<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            slots: self.slots.clone(),
        }
    }
}

impl<S: SlotGroup> fmt::Debug for Event<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").field("live", &self.is_live()).finish()
    }
}

/// Combine two completion handles into one that fires both.
///
/// Completing the returned event forwards its outcome to `a` then `b`. If
/// either input is already complete (or empty) the other is returned
/// directly.
pub fn distribute(a: Event, b: Event) -> Event {
    if !a.is_live() {
        return b;
    }
    if !b.is_live() {
        return a;
    }
    let (core, aid) = a.into_raw().expect("live event");
    let (bcore, bid) = b.into_raw().expect("live event");
    debug_assert!(core.same_core(&bcore), "events from different cores");
    let rdv = core.new_rdv(Kind::Distribute(vec![aid, bid]), false, true);
    let id = core.new_event(rdv, 0);
    Event::new(core, id, ())
}
