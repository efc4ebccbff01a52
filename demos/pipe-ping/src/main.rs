//! Round-trips a few bytes over a pipe through the driver: a timer writes,
//! a readiness watch reads, a blocked step counts the exchanges.

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use moot_driver::{Driver, Handle};
use moot_event::{Gather, Mode, Outcome, Rendezvous, Step};

const ROUNDS: usize = 3;

/// Schedule a one-byte write to `wfd` in 50ms.
fn write_later(handle: &Handle, writer: &Rendezvous, wfd: RawFd) {
    let event = writer.event(0);
    event.at_trigger_fn(move |outcome| {
        if outcome == Outcome::Fired {
            let byte = 0x2au8;
            unsafe {
                libc::write(wfd, &byte as *const u8 as *const libc::c_void, 1);
            }
        }
    });
    handle.at_delay(Duration::from_millis(50), event);
}

struct Ping {
    handle: Handle,
    g: Gather,
    writer: Rendezvous,
    rfd: RawFd,
    wfd: RawFd,
    rounds: Rc<RefCell<usize>>,
}

impl Step for Ping {
    fn resume(self: Box<Self>, at: u32) {
        while let Some(round) = self.g.pop_ready() {
            let mut byte = 0u8;
            unsafe {
                libc::read(self.rfd, &mut byte as *mut u8 as *mut libc::c_void, 1);
            }
            println!("round {round}: got {byte:#04x}");
            *self.rounds.borrow_mut() += 1;
        }
        if *self.rounds.borrow() < ROUNDS {
            self.handle.at_fd_read(self.rfd, self.g.event());
            write_later(&self.handle, &self.writer, self.wfd);
            let g = self.g.clone();
            g.block(self, at);
        }
    }
}

fn main() {
    env_logger::init();

    let mut driver = Driver::new();
    let handle = driver.handle();
    let core = driver.core();

    let mut fds = [0 as libc::c_int; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let (rfd, wfd) = (fds[0], fds[1]);

    let g = Gather::new(&core, Mode::Normal);
    let writer = Rendezvous::new(&core, Mode::Volatile);
    let rounds = Rc::new(RefCell::new(0));

    handle.at_fd_read(rfd, g.event());
    write_later(&handle, &writer, wfd);
    g.block(
        Box::new(Ping {
            handle: handle.clone(),
            g: g.clone(),
            writer: writer.clone(),
            rfd,
            wfd,
            rounds: Rc::clone(&rounds),
        }),
        0,
    );

    driver.run().expect("driver failed");
    println!("done after {} rounds", *rounds.borrow());

    unsafe {
        libc::close(rfd);
        libc::close(wfd);
    }
}
