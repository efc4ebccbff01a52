use std::borrow::Cow;
use std::time::Duration;

use bencher::{run_tests_console, Bencher, TestDesc, TestDescAndFn, TestFn, TestOpts};
use moot_driver::{Clock, Driver};
use moot_event::{Mode, Rendezvous};

struct TimerBench {
    timers: usize,
}

impl bencher::TDynBenchFn for TimerBench {
    fn run(&self, b: &mut Bencher) {
        let timers = self.timers;
        b.iter(|| {
            let clock = Clock::simulated();
            let mut driver = Driver::with_clock(clock.clone());
            let handle = driver.handle();
            let core = driver.core();
            let r = Rendezvous::new(&core, Mode::Normal);

            for i in 0..timers {
                handle.at_delay(Duration::from_millis(i as u64 + 1), r.event(i));
            }
            clock.advance(Duration::from_millis(timers as u64 + 1));
            driver.run().unwrap();

            let mut popped = 0;
            while r.pop_ready().is_some() {
                popped += 1;
            }
            assert_eq!(popped, timers);
        });
    }
}

pub fn benches() -> ::std::vec::Vec<TestDescAndFn> {
    let mut benches = vec![];

    for n in [16, 256, 4096] {
        benches.push(TestDescAndFn {
            desc: TestDesc {
                name: Cow::from(format!("bench_timers/n={}", n)),
                ignore: false,
            },
            testfn: TestFn::DynBenchFn(Box::new(TimerBench { timers: n })),
        })
    }
    benches
}

fn main() {
    let mut test_opts = TestOpts::default();
    if let Some(arg) = ::std::env::args().skip(1).find(|arg| *arg != "--bench") {
        test_opts.filter = Some(arg);
    }
    let mut all = Vec::new();
    all.extend(benches());
    run_tests_console(&test_opts, all).unwrap();
}
