use std::cell::UnsafeCell;

use crate::Handle;

thread_local! {
    static CURRENT: Context = Context::new();
}

pub(crate) struct Context {
    handle: UnsafeCell<Option<Handle>>,
}

impl Context {
    fn new() -> Self {
        Self {
            handle: UnsafeCell::new(None),
        }
    }

    pub(crate) fn enter(handle: Handle) -> ContextGuard {
        CURRENT.with(|current| {
            // Safety: This context is thread-local and only accessed on the
            // current thread.
            let old = unsafe { &mut *current.handle.get() };
            assert!(old.is_none(), "driver already set");
            *old = Some(handle);
        });
        ContextGuard {}
    }

    /// Returns a handle to the current driver.
    pub(crate) fn handle() -> Option<Handle> {
        CURRENT.with(|c| {
            // Safety: See [`Context::enter`].
            unsafe { (*c.handle.get()).clone() }
        })
    }
}

/// Guard returned by [`Driver::enter`](crate::Driver::enter); leaving drops
/// the thread-local handle.
#[derive(Debug)]
pub struct ContextGuard;

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| {
            // Safety: See [`Context::enter`].
            let handle = unsafe { &mut *current.handle.get() };
            assert!(handle.is_some(), "driver not set");
            *handle = None;
        });
    }
}
