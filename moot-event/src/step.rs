/// A suspendable computation in state-machine form.
///
/// A `Step` parks itself on a rendezvous with
/// [`block`](crate::Rendezvous::block), recording a numeric resume label.
/// When the rendezvous is unblocked, the driver takes the boxed step back
/// out and calls [`Step::resume`] with that label. The body is expected to
/// consult `has_ready`/`pop_ready` (or the slots of the event that fired)
/// and then either block again or finish.
///
/// The code between two suspension points runs to completion with no other
/// step interleaved; there is no preemption.
pub trait Step: 'static {
    /// Run the computation from the resume point recorded when it blocked.
    fn resume(self: Box<Self>, at: u32);

    /// Called instead of [`Step::resume`] when the rendezvous this step was
    /// blocked on is destroyed. The default simply drops the step.
    fn abandoned(self: Box<Self>) {}
}

impl<F> Step for F
where
    F: FnOnce(u32) + 'static,
{
    fn resume(self: Box<Self>, at: u32) {
        (*self)(at)
    }
}
