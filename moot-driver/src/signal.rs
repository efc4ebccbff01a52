use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use log::trace;
use moot_event::Event;

use crate::error::Error;

pub(crate) const NSIGNALS: usize = 32;

const LOG: &str = "moot_driver::signal";

// The handler may run at any point, including between computing a wait
// timeout and entering the kernel wait, so everything it touches is
// process-wide atomic state; the per-signal events stay on the driver and
// are only ever fired from the driver thread.
static ANY_ACTIVE: AtomicBool = AtomicBool::new(false);
static ACTIVE: [AtomicBool; NSIGNALS] = [const { AtomicBool::new(false) }; NSIGNALS];
static PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);

/// Async-signal-safe handler: record the signal, nudge the kernel wait
/// through the self-pipe, and keep the signal blocked until the driver has
/// fired its event (responders get a chance to reinstall first).
extern "C" fn bridge_handler(sig: libc::c_int) {
    if !(0..NSIGNALS as libc::c_int).contains(&sig) {
        return;
    }
    ACTIVE[sig as usize].store(true, Ordering::Release);
    ANY_ACTIVE.store(true, Ordering::Release);
    let fd = PIPE_WRITE.load(Ordering::Acquire);
    if fd >= 0 {
        let byte = 0u8;
        // Safety: write(2) is async-signal-safe; the pipe is non-blocking.
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
    // Safety: sigprocmask(2) is async-signal-safe.
    unsafe {
        let mut set = mem::MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigemptyset(set.as_mut_ptr());
        libc::sigaddset(set.as_mut_ptr(), sig);
        libc::sigprocmask(libc::SIG_BLOCK, set.as_ptr(), ptr::null_mut());
    }
}

/// Per-driver signal table plus the self-pipe that steers the kernel wait.
pub(crate) struct Signals {
    handlers: Vec<Event>,
    pipe_read: RawFd,
    pipe_write: RawFd,
}

impl Signals {
    pub(crate) fn new() -> Self {
        Self {
            handlers: vec![Event::empty(); NSIGNALS],
            pipe_read: -1,
            pipe_write: -1,
        }
    }

    /// Fire `event` on the next delivery of `sig`.
    ///
    /// Installs the bridge handler with `SA_RESETHAND`: both the kernel
    /// disposition and the event are one-shot, and responders re-register
    /// from their completion path. An empty `event` restores `SIG_DFL`.
    pub(crate) fn install(&mut self, sig: i32, event: Event) -> io::Result<()> {
        if !(0..NSIGNALS as i32).contains(&sig) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                Error::SignalOutOfRange(sig),
            ));
        }
        let live = event.is_live();
        if live && self.pipe_read < 0 {
            self.create_pipe()?;
        }
        // Replace first so a failed sigaction cannot strand the old event.
        let previous = mem::replace(&mut self.handlers[sig as usize], event);
        // Safety: installing a handler that only performs async-signal-safe
        // operations (see bridge_handler).
        unsafe {
            let mut sa = mem::MaybeUninit::<libc::sigaction>::zeroed().assume_init();
            sa.sa_sigaction = if live {
                bridge_handler as extern "C" fn(libc::c_int) as libc::sighandler_t
            } else {
                libc::SIG_DFL
            };
            sa.sa_flags = libc::SA_RESETHAND;
            libc::sigemptyset(&mut sa.sa_mask);
            if libc::sigaction(sig, &sa, ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        drop(previous);
        Ok(())
    }

    fn create_pipe(&mut self) -> io::Result<()> {
        let mut fds = [0 as libc::c_int; 2];
        // Safety: plain syscalls against a local array.
        unsafe {
            if libc::pipe(fds.as_mut_ptr()) != 0 {
                return Err(io::Error::last_os_error());
            }
            for fd in fds {
                libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        self.pipe_read = fds[0];
        self.pipe_write = fds[1];
        PIPE_WRITE.store(fds[1], Ordering::Release);
        trace!(target: LOG, "self-pipe created {}→{}", fds[1], fds[0]);
        Ok(())
    }

    /// Read end of the self-pipe, once it exists. Always merged into the
    /// kernel wait's read set.
    pub(crate) fn pipe_read(&self) -> Option<RawFd> {
        (self.pipe_read >= 0).then_some(self.pipe_read)
    }

    /// True if any delivery has been recorded since the last service pass.
    pub(crate) fn any_active() -> bool {
        ANY_ACTIVE.load(Ordering::Acquire)
    }

    /// True if any signal still has a live event installed.
    pub(crate) fn any_installed(&self) -> bool {
        self.handlers.iter().any(Event::is_live)
    }

    /// Collect the signals delivered since the last pass.
    ///
    /// Returns the events to fire plus the set to unblock once the caller
    /// has run the responders (see [`Signals::finish_service`]).
    pub(crate) fn begin_service(&mut self) -> Option<(Vec<Event>, libc::sigset_t)> {
        if !ANY_ACTIVE.swap(false, Ordering::AcqRel) {
            return None;
        }
        let mut serviced = mem::MaybeUninit::<libc::sigset_t>::uninit();
        // Safety: sigemptyset initialises the set.
        let mut serviced = unsafe {
            libc::sigemptyset(serviced.as_mut_ptr());
            serviced.assume_init()
        };
        let mut events = Vec::new();
        for sig in 0..NSIGNALS {
            if ACTIVE[sig].swap(false, Ordering::AcqRel) {
                trace!(target: LOG, "signal {} delivered", sig);
                events.push(mem::take(&mut self.handlers[sig]));
                // Safety: sig is within 0..NSIGNALS.
                unsafe {
                    libc::sigaddset(&mut serviced, sig as libc::c_int);
                }
            }
        }
        Some((events, serviced))
    }

    /// Unblock the serviced signals and drain wakeup bytes from the pipe.
    pub(crate) fn finish_service(&self, serviced: libc::sigset_t) {
        // Safety: unblocking a set built by begin_service.
        unsafe {
            libc::sigprocmask(libc::SIG_UNBLOCK, &serviced, ptr::null_mut());
        }
        self.drain_pipe();
    }

    fn drain_pipe(&self) {
        if self.pipe_read < 0 {
            return;
        }
        let mut crap = [0u8; 64];
        loop {
            // Safety: reading into a local buffer from our own pipe.
            let n = unsafe {
                libc::read(
                    self.pipe_read,
                    crap.as_mut_ptr() as *mut libc::c_void,
                    crap.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// Restore default dispositions and tear down the self-pipe. Returns
    /// the replaced events for release outside any borrow.
    pub(crate) fn shutdown(&mut self) -> Vec<Event> {
        let mut replaced = Vec::new();
        for sig in 0..NSIGNALS {
            if self.handlers[sig].is_live() {
                replaced.push(mem::take(&mut self.handlers[sig]));
                // Safety: restoring the default disposition.
                unsafe {
                    let mut sa = mem::MaybeUninit::<libc::sigaction>::zeroed().assume_init();
                    sa.sa_sigaction = libc::SIG_DFL;
                    libc::sigemptyset(&mut sa.sa_mask);
                    libc::sigaction(sig as libc::c_int, &sa, ptr::null_mut());
                }
            }
        }
        if self.pipe_read >= 0 {
            PIPE_WRITE.store(-1, Ordering::Release);
            // Safety: closing descriptors this table owns.
            unsafe {
                libc::close(self.pipe_read);
                libc::close(self.pipe_write);
            }
            self.pipe_read = -1;
            self.pipe_write = -1;
        }
        replaced
    }
}

impl std::fmt::Debug for Signals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signals")
            .field("installed", &self.handlers.iter().filter(|e| e.is_live()).count())
            .finish()
    }
}
