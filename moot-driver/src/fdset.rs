use std::mem;
use std::os::unix::io::RawFd;

use moot_event::Event;

/// Watch direction for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dir {
    Read,
    Write,
}

/// Sparse table of one-shot readiness events, indexed `fd * 2 + direction`.
///
/// The kernel-facing `fd_set` masks are maintained incrementally alongside
/// the cells; `nfds` is the high-water mark handed to `select`, trimmed of
/// trailing dead cells before each wait.
pub(crate) struct FdTable {
    cells: Vec<Event>,
    readfds: libc::fd_set,
    writefds: libc::fd_set,
    nfds: RawFd,
}

fn empty_set() -> libc::fd_set {
    let mut set = mem::MaybeUninit::<libc::fd_set>::uninit();
    // Safety: FD_ZERO initialises the whole set.
    unsafe {
        libc::FD_ZERO(set.as_mut_ptr());
        set.assume_init()
    }
}

impl FdTable {
    pub(crate) fn new() -> Self {
        Self {
            cells: Vec::new(),
            readfds: empty_set(),
            writefds: empty_set(),
            nfds: 0,
        }
    }

    /// Watch `fd` in `dir`, firing `event` once on readiness.
    ///
    /// An empty `event` clears the watch. Any event previously stored in
    /// the cell is dropped, which cancels it if this was its last handle.
    pub(crate) fn set(&mut self, fd: RawFd, dir: Dir, event: Event) {
        assert!(fd >= 0, "negative file descriptor");
        assert!(
            (fd as usize) < libc::FD_SETSIZE,
            "descriptor beyond FD_SETSIZE"
        );
        let index = cell_index(fd, dir);
        if index >= self.cells.len() {
            let mut len = self.cells.len().max(16);
            while len <= index {
                len *= 2;
            }
            self.cells.resize_with(len, Event::empty);
        }
        let mask = match dir {
            Dir::Read => &mut self.readfds,
            Dir::Write => &mut self.writefds,
        };
        // Safety: fd is within FD_SETSIZE, checked above.
        if event.is_live() {
            unsafe { libc::FD_SET(fd, mask) };
            if fd + 1 > self.nfds {
                self.nfds = fd + 1;
            }
        } else {
            unsafe { libc::FD_CLR(fd, mask) };
        }
        self.cells[index] = event;
    }

    /// Shrink the high-water mark past trailing dead cells.
    pub(crate) fn trim(&mut self) {
        while self.nfds > 0 {
            let fd = self.nfds - 1;
            let live = |dir| {
                self.cells
                    .get(cell_index(fd, dir))
                    .is_some_and(Event::is_live)
            };
            if live(Dir::Read) || live(Dir::Write) {
                break;
            }
            self.nfds -= 1;
        }
    }

    pub(crate) fn nfds(&self) -> RawFd {
        self.nfds
    }

    /// Copies of the interest masks for the kernel wait.
    pub(crate) fn masks(&self) -> (libc::fd_set, libc::fd_set) {
        (self.readfds, self.writefds)
    }

    /// Clear the watch for a descriptor the kernel reported ready and hand
    /// back its event for the caller to fire.
    pub(crate) fn take_ready(&mut self, fd: RawFd, dir: Dir) -> Event {
        let mask = match dir {
            Dir::Read => &mut self.readfds,
            Dir::Write => &mut self.writefds,
        };
        // Safety: fd came from iterating 0..nfds, all within FD_SETSIZE.
        unsafe { libc::FD_CLR(fd, mask) };
        self.cells
            .get_mut(cell_index(fd, dir))
            .map(mem::take)
            .unwrap_or_default()
    }

    /// True if any cell still holds a live event.
    pub(crate) fn any_live(&self) -> bool {
        self.cells.iter().any(Event::is_live)
    }

    /// Empty the table, returning the stored events for release outside
    /// any borrow.
    pub(crate) fn take_all(&mut self) -> Vec<Event> {
        self.readfds = empty_set();
        self.writefds = empty_set();
        self.nfds = 0;
        mem::take(&mut self.cells)
    }
}

fn cell_index(fd: RawFd, dir: Dir) -> usize {
    fd as usize * 2 + (dir == Dir::Write) as usize
}

impl std::fmt::Debug for FdTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdTable").field("nfds", &self.nfds).finish()
    }
}

#[cfg(test)]
mod tests {
    use moot_event::{Core, Mode, Outcome, Rendezvous};
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn grows_and_tracks_high_water() {
        let core = Core::new();
        let r = Rendezvous::new(&core, Mode::Volatile);
        let mut table = FdTable::new();

        table.set(5, Dir::Read, r.event(1));
        assert_eq!(table.nfds(), 6);
        table.set(40, Dir::Write, r.event(2));
        assert_eq!(table.nfds(), 41);
        assert!(table.cells.len() >= 82);
        assert!(table.any_live());
    }

    #[test]
    fn replacement_cancels_previous_event() {
        let core = Core::new();
        let r = Rendezvous::new(&core, Mode::Volatile);
        let mut table = FdTable::new();

        let first = r.event(1);
        let outcome = Rc::new(RefCell::new(None));
        {
            let outcome = Rc::clone(&outcome);
            first.at_trigger_fn(move |o| *outcome.borrow_mut() = Some(o));
        }
        table.set(3, Dir::Read, first);
        table.set(3, Dir::Read, r.event(2));
        assert_eq!(*outcome.borrow(), Some(Outcome::Cancelled));
    }

    #[test]
    fn trim_skips_dead_trailing_cells() {
        let core = Core::new();
        let r = Rendezvous::new(&core, Mode::Volatile);
        let mut table = FdTable::new();

        table.set(2, Dir::Read, r.event(1));
        let tail = r.event(2);
        table.set(9, Dir::Write, tail.clone());
        assert_eq!(table.nfds(), 10);

        tail.cancel();
        table.trim();
        assert_eq!(table.nfds(), 3);
    }

    #[test]
    fn take_ready_fires_once() {
        let core = Core::new();
        let r = Rendezvous::new(&core, Mode::Volatile);
        let mut table = FdTable::new();

        table.set(4, Dir::Read, r.event(7));
        let event = table.take_ready(4, Dir::Read);
        event.trigger(());
        assert_eq!(r.pop_ready(), Some(7));

        // The cell is spent.
        assert!(!table.any_live());
        let again = table.take_ready(4, Dir::Read);
        assert!(!again.is_live());
    }
}
