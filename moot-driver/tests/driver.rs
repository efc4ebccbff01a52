use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use moot_driver::{Clock, Driver};
use moot_event::{distribute, Gather, Mode, Rendezvous, Slot, Step};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn make_pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as libc::c_int; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    for fd in fds {
        unsafe {
            libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
        }
    }
    (fds[0], fds[1])
}

fn write_byte(fd: RawFd) {
    let byte = 1u8;
    let n = unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
    assert_eq!(n, 1);
}

fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

#[test]
fn pipe_ping() {
    init();
    let mut driver = Driver::new();
    let handle = driver.handle();
    let core = driver.core();
    let (rfd, wfd) = make_pipe();

    let r = Rendezvous::new(&core, Mode::Normal);
    handle.at_fd_read(rfd, r.event(1));
    write_byte(wfd);

    driver.run_once().unwrap();
    assert_eq!(r.pop_ready(), Some(1));
    assert_eq!(r.pop_ready(), None);

    // No further input: the loop has nothing pending and exits at once.
    driver.run().unwrap();

    close(rfd);
    close(wfd);
}

/// Collects rids from a gather until `want` have been seen, re-blocking in
/// between.
struct FanIn {
    r: Gather,
    want: usize,
    seen: Rc<RefCell<Vec<usize>>>,
    resumes: Rc<RefCell<usize>>,
}

impl Step for FanIn {
    fn resume(self: Box<Self>, at: u32) {
        *self.resumes.borrow_mut() += 1;
        while let Some(rid) = self.r.pop_ready() {
            self.seen.borrow_mut().push(rid);
        }
        if self.seen.borrow().len() < self.want {
            let r = self.r.clone();
            r.block(self, at);
        }
    }
}

#[test]
fn timer_fan_in() {
    init();
    let mut driver = Driver::new();
    let handle = driver.handle();
    let core = driver.core();

    let g = Gather::new(&core, Mode::Normal);
    handle.at_delay(Duration::from_millis(20), g.event());
    handle.at_delay(Duration::from_millis(40), g.event());
    handle.at_delay(Duration::from_millis(60), g.event());

    let seen = Rc::new(RefCell::new(Vec::new()));
    let resumes = Rc::new(RefCell::new(0));
    g.block(
        Box::new(FanIn {
            r: g.clone(),
            want: 3,
            seen: Rc::clone(&seen),
            resumes: Rc::clone(&resumes),
        }),
        0,
    );

    driver.run().unwrap();
    assert_eq!(*seen.borrow(), vec![1, 2, 3]);
    let resumes = *resumes.borrow();
    assert!((1..=3).contains(&resumes), "resumed {} times", resumes);
}

/// Pops whatever is ready once, then cancels everything still pending.
struct TimeoutWatcher {
    r: Rendezvous,
    observed: Rc<RefCell<Vec<usize>>>,
}

impl Step for TimeoutWatcher {
    fn resume(self: Box<Self>, _at: u32) {
        while let Some(rid) = self.r.pop_ready() {
            self.observed.borrow_mut().push(rid);
        }
        self.r.clear();
    }
}

#[test]
fn timeout_cancels_pending_read() {
    const READ: usize = 1;
    const TMO: usize = 2;
    const HOOK: usize = 9;

    init();
    let mut driver = Driver::new();
    let handle = driver.handle();
    let core = driver.core();
    let (rfd, wfd) = make_pipe();

    let r = Rendezvous::new(&core, Mode::Volatile);
    let hooks = Rendezvous::new(&core, Mode::Normal);

    // The watch stands in for a pending read; no data ever arrives.
    let watch = r.event(READ);
    watch.at_cancel(hooks.event(HOOK));
    handle.at_fd_read(rfd, watch);

    // An unfired typed completion whose output must survive the timeout.
    let payload = Slot::new(0u32);
    let _pending = r.event_to(3, payload.clone());

    handle.at_delay(Duration::from_millis(20), r.event(TMO));

    let observed = Rc::new(RefCell::new(Vec::new()));
    r.block(
        Box::new(TimeoutWatcher {
            r: r.clone(),
            observed: Rc::clone(&observed),
        }),
        0,
    );

    driver.run().unwrap();
    // Only the timeout made it to the ready queue; the read was cancelled,
    // firing its cancel hook and leaving the payload slot untouched.
    assert_eq!(*observed.borrow(), vec![TMO]);
    assert_eq!(hooks.pop_ready(), Some(HOOK));
    assert_eq!(payload.get(), 0);

    close(rfd);
    close(wfd);
}

#[test]
fn distribute_through_asap() {
    init();
    let mut driver = Driver::new();
    let handle = driver.handle();
    let core = driver.core();

    let r = Rendezvous::new(&core, Mode::Normal);
    let both = distribute(r.event(1), r.event(2));
    handle.at_asap(both);

    driver.run_once().unwrap();
    assert_eq!(r.pop_ready(), Some(1));
    assert_eq!(r.pop_ready(), Some(2));
    assert_eq!(r.pop_ready(), None);
}

#[test]
fn asap_fires_lifo_and_defers_nested_pushes() {
    init();
    let mut driver = Driver::new();
    let handle = driver.handle();
    let core = driver.core();

    let r = Rendezvous::new(&core, Mode::Normal);
    let e1 = r.event(1);
    let e2 = r.event(2);
    {
        let handle = handle.clone();
        let nested = r.event(3);
        e2.at_trigger_fn(move |_| handle.at_asap(nested));
    }
    handle.at_asap(e1);
    handle.at_asap(e2);

    driver.run_once().unwrap();
    // Newest first; the entry pushed mid-drain waits for the next pass.
    assert_eq!(r.pop_ready(), Some(2));
    assert_eq!(r.pop_ready(), Some(1));
    assert_eq!(r.pop_ready(), None);

    driver.run_once().unwrap();
    assert_eq!(r.pop_ready(), Some(3));
}

#[test]
fn double_trigger_is_inert() {
    init();
    let mut driver = Driver::new();
    let handle = driver.handle();
    let core = driver.core();

    let r = Rendezvous::new(&core, Mode::Normal);
    let x = Slot::new(0);
    let e = r.event_to(1, x.clone());
    let chained = Rc::new(RefCell::new(0));
    {
        let chained = Rc::clone(&chained);
        e.at_trigger_fn(move |_| *chained.borrow_mut() += 1);
    }

    e.trigger(42);
    e.trigger(99);
    handle.at_asap(r.event(7));
    driver.run_once().unwrap();

    assert_eq!(x.get(), 42);
    assert_eq!(*chained.borrow(), 1);
    assert_eq!(r.pop_ready(), Some(1));
    assert_eq!(r.pop_ready(), Some(7));
}

#[test]
fn timers_fire_in_expiry_order_on_simulated_clock() {
    init();
    let clock = Clock::simulated();
    let mut driver = Driver::with_clock(clock.clone());
    let handle = driver.handle();
    let core = driver.core();

    let r = Rendezvous::new(&core, Mode::Normal);
    handle.at_delay(Duration::from_secs(2), r.event(2));
    handle.at_delay(Duration::from_secs(1), r.event(1));

    clock.advance(Duration::from_secs(3));
    driver.run_once().unwrap();
    assert_eq!(r.pop_ready(), Some(1));
    assert_eq!(r.pop_ready(), Some(2));
    assert_eq!(r.pop_ready(), None);
}

#[test]
fn cancelled_timer_never_fires_and_loop_exits() {
    init();
    let clock = Clock::simulated();
    let mut driver = Driver::with_clock(clock.clone());
    let handle = driver.handle();
    let core = driver.core();

    let r = Rendezvous::new(&core, Mode::Volatile);
    let e = r.event(1);
    handle.at_delay(Duration::from_secs(1), e.clone());
    e.cancel();

    clock.advance(Duration::from_secs(2));
    driver.run().unwrap();
    assert!(!r.has_ready());
}

#[test]
fn run_exits_immediately_when_idle() {
    init();
    let mut driver = Driver::new();
    driver.run().unwrap();
}

#[test]
fn free_functions_use_entered_driver() {
    init();
    let mut driver = Driver::new();
    let core = driver.core();
    let r = Rendezvous::new(&core, Mode::Normal);
    {
        let _guard = driver.enter();
        moot_driver::at_asap(r.event(1));
    }
    driver.run_once().unwrap();
    assert_eq!(r.pop_ready(), Some(1));
}

// Signal dispositions and the bridge's flags are process-wide, so both
// signal scenarios share one test body and run sequentially.
#[test]
fn signal_wakeups() {
    init();

    // Delivery between iterations is not lost: the flag forces a zero
    // timeout on the next wait.
    {
        let mut driver = Driver::new();
        let handle = driver.handle();
        let core = driver.core();
        let g = Gather::new(&core, Mode::Normal);
        handle.at_signal(libc::SIGUSR1, g.event()).unwrap();

        let fired = Rc::new(RefCell::new(false));
        {
            let fired = Rc::clone(&fired);
            let g2 = g.clone();
            g.block(
                Box::new(move |_: u32| {
                    assert_eq!(g2.pop_ready(), Some(1));
                    *fired.borrow_mut() = true;
                }),
                0,
            );
        }
        unsafe {
            libc::raise(libc::SIGUSR1);
        }
        driver.run().unwrap();
        assert!(*fired.borrow());
    }

    // Delivery during the kernel wait steers the driver out of it through
    // the self-pipe, with nothing else pending.
    {
        let mut driver = Driver::new();
        let handle = driver.handle();
        let core = driver.core();
        let g = Gather::new(&core, Mode::Normal);
        handle.at_signal(libc::SIGUSR1, g.event()).unwrap();

        let fired = Rc::new(RefCell::new(false));
        {
            let fired = Rc::clone(&fired);
            let g2 = g.clone();
            g.block(
                Box::new(move |_: u32| {
                    assert_eq!(g2.pop_ready(), Some(1));
                    *fired.borrow_mut() = true;
                }),
                0,
            );
        }

        let pid = unsafe { libc::getpid() };
        let poker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            unsafe {
                libc::kill(pid, libc::SIGUSR1);
            }
        });
        driver.run().unwrap();
        poker.join().unwrap();
        assert!(*fired.borrow());
    }
}

#[test]
fn signal_out_of_range_is_rejected() {
    init();
    let driver = Driver::new();
    let handle = driver.handle();
    let core = driver.core();
    let r = Rendezvous::new(&core, Mode::Volatile);
    let err = handle.at_signal(64, r.event(1)).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
}
