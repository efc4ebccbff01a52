use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// A clock for tracking time.
#[derive(Debug, Clone)]
pub struct Clock {
    start: Instant,
    time: TimeSource,
}

impl Clock {
    /// Create a new system clock.
    pub fn system() -> Self {
        Self {
            start: Instant::now(),
            time: TimeSource::System,
        }
    }

    /// Create a new simulated clock.
    ///
    /// The simulated clock starts with frozen time. Time can be advanced by
    /// calling [`Clock::advance`].
    pub fn simulated() -> Self {
        Self {
            start: Instant::now(),
            time: TimeSource::Simulated {
                offset: Rc::new(Cell::new(Duration::from_secs(0))),
            },
        }
    }

    /// Return the current instant.
    pub fn now(&self) -> Instant {
        match &self.time {
            TimeSource::System => Instant::now(),
            TimeSource::Simulated { offset } => self.start + offset.get(),
        }
    }

    /// Advance simulated time.
    ///
    /// ### Panics
    /// Panics if called on a system clock created with [`Clock::system`].
    pub fn advance(&self, duration: Duration) {
        match &self.time {
            TimeSource::System => panic!("Cannot advance system clock"),
            TimeSource::Simulated { offset } => {
                offset.set(offset.get() + duration);
            }
        }
    }
}

#[derive(Debug, Clone)]
enum TimeSource {
    System,
    Simulated { offset: Rc<Cell<Duration>> },
}
