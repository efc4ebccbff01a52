//! The readiness-driven event loop of the moot runtime.
//!
//! A [`Driver`] owns a [`Core`] plus the sources that feed it: a timer
//! heap, a descriptor readiness table, a signal bridge, and an ASAP stack.
//! Each [`run_once`](Driver::run_once) iteration folds all four into event
//! completions around a single kernel wait, then resumes every unblocked
//! computation.
//!
//! Registration happens through a clonable [`Handle`] — or, inside a
//! context entered with [`Driver::enter`], through the module-level free
//! functions ([`at_delay`], [`at_fd_read`], …), which panic when no driver
//! context is set.
//!
//! # Modules
//! - `clock`: system and simulated time sources.
//! - `timer`: the expiry min-heap.
//! - `fdset`: `select`-mask bookkeeping.
//! - `signal`: the self-pipe signal bridge.
#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    clippy::missing_safety_doc
)]

use std::cell::RefCell;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::trace;
use moot_event::{Core, Event};

mod clock;
mod context;
mod error;
mod fdset;
mod signal;
mod timer;

pub use clock::Clock;
pub use context::ContextGuard;
pub use error::Error;

use fdset::{Dir, FdTable};
use signal::Signals;
use timer::TimerHeap;

const LOG: &str = "moot_driver";

/// The event loop: multiplexes descriptor readiness, timers, signals and
/// ASAP work into event completions, and resumes unblocked computations
/// between kernel waits.
///
/// One driver per thread; everything it touches is single-threaded.
pub struct Driver {
    shared: Rc<Shared>,
}

struct Shared {
    core: Core,
    clock: Clock,
    timers: RefCell<TimerHeap>,
    fds: RefCell<FdTable>,
    signals: RefCell<Signals>,
    asap: RefCell<Vec<Event>>,
}

impl Driver {
    /// Create a driver on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Clock::system())
    }

    /// Create a driver on the given clock.
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            shared: Rc::new(Shared {
                core: Core::new(),
                clock,
                timers: RefCell::new(TimerHeap::new()),
                fds: RefCell::new(FdTable::new()),
                signals: RefCell::new(Signals::new()),
                asap: RefCell::new(Vec::new()),
            }),
        }
    }

    /// A handle for registering work with this driver.
    pub fn handle(&self) -> Handle {
        Handle {
            shared: Rc::clone(&self.shared),
        }
    }

    /// The event core this driver drains.
    pub fn core(&self) -> Core {
        self.shared.core.clone()
    }

    /// Make this driver the thread's current one for the guard's lifetime,
    /// enabling [`Handle::current`] and the module-level free functions.
    pub fn enter(&self) -> ContextGuard {
        context::Context::enter(self.handle())
    }

    /// Run one iteration: wait for readiness, fire what completed, resume
    /// what unblocked.
    ///
    /// Returns once the iteration is over, even if nothing fired. `EINTR`
    /// from the kernel wait is absorbed; other wait failures are returned.
    pub fn run_once(&mut self) -> io::Result<()> {
        let shared = Rc::clone(&self.shared);

        // Cancelled timers must not shape the wait timeout.
        shared.timers.borrow_mut().skim_cancelled();

        let now = shared.clock.now();
        let next_timer = shared.timers.borrow().next_expiry();
        let immediate = !shared.asap.borrow().is_empty()
            || Signals::any_active()
            || shared.core.has_unblocked()
            || next_timer.is_some_and(|at| at <= now);
        let timeout = if immediate {
            Some(Duration::ZERO)
        } else {
            next_timer.map(|at| at.saturating_duration_since(now))
        };

        shared.fds.borrow_mut().trim();

        let nready = self.wait(timeout)?;

        // Signals first: fire their events, run the responders to fixpoint
        // so they can re-register, and only then let the signals through
        // again and drain the wakeup bytes.
        let serviced = shared.signals.borrow_mut().begin_service();
        if let Some((events, set)) = serviced {
            for event in events {
                event.trigger(());
            }
            shared.core.drain_unblocked();
            shared.signals.borrow().finish_service(set);
        }

        // ASAP work, newest first. Entries pushed by these triggers land in
        // the next iteration.
        let asap = mem::take(&mut *shared.asap.borrow_mut());
        for event in asap.into_iter().rev() {
            event.trigger(());
        }

        if let Some((rfds, wfds)) = nready {
            let watched = shared.fds.borrow().nfds();
            for fd in 0..watched {
                // Safety: fd is within FD_SETSIZE; the sets came from select.
                if unsafe { libc::FD_ISSET(fd, &rfds) } {
                    let event = shared.fds.borrow_mut().take_ready(fd, Dir::Read);
                    event.trigger(());
                }
                if unsafe { libc::FD_ISSET(fd, &wfds) } {
                    let event = shared.fds.borrow_mut().take_ready(fd, Dir::Write);
                    event.trigger(());
                }
            }
        }

        let now = shared.clock.now();
        loop {
            let due = shared.timers.borrow_mut().pop_due(now);
            match due {
                Some(event) => event.trigger(()),
                None => break,
            }
        }

        shared.core.drain_unblocked();
        Ok(())
    }

    /// Kernel wait. Returns the ready sets, or `None` when nothing is
    /// known to be ready (timeout expiry or `EINTR`).
    fn wait(&self, timeout: Option<Duration>) -> io::Result<Option<(libc::fd_set, libc::fd_set)>> {
        let shared = &self.shared;
        let (mut rfds, mut wfds) = shared.fds.borrow().masks();
        let mut nfds = shared.fds.borrow().nfds();
        if let Some(pipe) = shared.signals.borrow().pipe_read() {
            // Safety: the pipe descriptor is within FD_SETSIZE.
            unsafe { libc::FD_SET(pipe, &mut rfds) };
            nfds = nfds.max(pipe + 1);
        }
        let mut tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        let tv_ptr = match timeout {
            Some(d) => {
                tv.tv_sec = d.as_secs() as libc::time_t;
                tv.tv_usec = d.subsec_micros() as libc::suseconds_t;
                &mut tv as *mut libc::timeval
            }
            None => ptr::null_mut(),
        };
        trace!(target: LOG, "wait nfds={} timeout={:?}", nfds, timeout);
        // Safety: the sets and timeout outlive the call.
        let nready = unsafe { libc::select(nfds, &mut rfds, &mut wfds, ptr::null_mut(), tv_ptr) };
        if nready < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
            // Interrupted: the sets are unspecified, so report nothing
            // ready. The signal pass right after picks up the cause.
            trace!(target: LOG, "wait interrupted");
            return Ok(None);
        }
        Ok((nready > 0).then_some((rfds, wfds)))
    }

    /// Run iterations until no work remains: no pending timer, no watched
    /// descriptor, no ASAP entry, no unblocked computation, no installed or
    /// pending signal.
    pub fn run(&mut self) -> io::Result<()> {
        while self.has_pending() {
            self.run_once()?;
        }
        Ok(())
    }

    fn has_pending(&self) -> bool {
        let shared = &self.shared;
        shared.timers.borrow_mut().skim_cancelled();
        !shared.timers.borrow().is_empty()
            || shared.fds.borrow().any_live()
            || !shared.asap.borrow().is_empty()
            || shared.core.has_unblocked()
            || Signals::any_active()
            || shared.signals.borrow().any_installed()
    }
}

impl Default for Driver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver").finish()
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        // Release every registered event outside the table borrows; the
        // drops cancel still-live events, which may fire chains that call
        // back into the handle API.
        let replaced = self.shared.signals.borrow_mut().shutdown();
        drop(replaced);
        let timers = self.shared.timers.borrow_mut().take_all();
        drop(timers);
        let cells = self.shared.fds.borrow_mut().take_all();
        drop(cells);
        let asap = mem::take(&mut *self.shared.asap.borrow_mut());
        drop(asap);
    }
}

/// A clonable registration handle to a [`Driver`].
#[derive(Clone)]
pub struct Handle {
    shared: Rc<Shared>,
}

impl Handle {
    /// The handle of the driver the current thread has entered.
    ///
    /// ### Panics
    /// Panics outside a [`Driver::enter`] context.
    pub fn current() -> Self {
        context::Context::handle().expect("no driver context")
    }

    /// The driver's event core.
    pub fn core(&self) -> Core {
        self.shared.core.clone()
    }

    /// The driver's clock.
    pub fn clock(&self) -> Clock {
        self.shared.clock.clone()
    }

    /// Fire `event` once `delay` has elapsed.
    pub fn at_delay(&self, delay: Duration, event: Event) {
        self.at_time(self.shared.clock.now() + delay, event);
    }

    /// Fire `event` at the absolute instant `at`.
    ///
    /// Cancelling the event (or dropping its last other handle) cancels
    /// the timer; the record is skimmed lazily.
    pub fn at_time(&self, at: Instant, event: Event) {
        if event.is_live() {
            self.shared.timers.borrow_mut().insert(at, event);
        }
    }

    /// Fire `event` when `fd` becomes readable. One-shot; an empty event
    /// clears the watch, and replacing a watch cancels the previous event.
    pub fn at_fd_read(&self, fd: RawFd, event: Event) {
        self.shared.fds.borrow_mut().set(fd, Dir::Read, event);
    }

    /// Fire `event` when `fd` becomes writable. Same contract as
    /// [`at_fd_read`](Handle::at_fd_read).
    pub fn at_fd_write(&self, fd: RawFd, event: Event) {
        self.shared.fds.borrow_mut().set(fd, Dir::Write, event);
    }

    /// Fire `event` on the next delivery of `signal`.
    pub fn at_signal(&self, signal: i32, event: Event) -> io::Result<()> {
        self.shared.signals.borrow_mut().install(signal, event)
    }

    /// Fire `event` on the next iteration, before descriptor and timer
    /// work. Entries fire newest-first.
    pub fn at_asap(&self, event: Event) {
        self.shared.asap.borrow_mut().push(event);
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").finish()
    }
}

/// Fire `event` once `delay` has elapsed on the current driver.
pub fn at_delay(delay: Duration, event: Event) {
    Handle::current().at_delay(delay, event);
}

/// Fire `event` at the absolute instant `at` on the current driver.
pub fn at_time(at: Instant, event: Event) {
    Handle::current().at_time(at, event);
}

/// Fire `event` when `fd` becomes readable, on the current driver.
pub fn at_fd_read(fd: RawFd, event: Event) {
    Handle::current().at_fd_read(fd, event);
}

/// Fire `event` when `fd` becomes writable, on the current driver.
pub fn at_fd_write(fd: RawFd, event: Event) {
    Handle::current().at_fd_write(fd, event);
}

/// Fire `event` on the next delivery of `signal`, on the current driver.
pub fn at_signal(signal: i32, event: Event) -> io::Result<()> {
    Handle::current().at_signal(signal, event)
}

/// Fire `event` on the current driver's next iteration.
pub fn at_asap(event: Event) {
    Handle::current().at_asap(event);
}
