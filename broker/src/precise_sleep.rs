// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! A `now`/`sleep-until` abstraction. The broker main loop and the
//! per-client wait workers both need to reason about wall-clock time in
//! nanoseconds since a fixed epoch; tests need to do the same thing without
//! actually blocking. [`Clock`] is the seam between the two.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time;

use lazy_static::lazy_static;

lazy_static! {
    static ref EPOCH: time::Instant = time::Instant::now();
}

/// Nanoseconds since the process-wide epoch.
pub fn now_ns() -> u64 {
    EPOCH.elapsed().as_nanos() as u64
}

pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u64;

    /// Blocks the calling thread until `deadline_ns` (relative to the same
    /// epoch as `now_ns`). Returns immediately if the deadline has passed.
    fn sleep_until_ns(&self, deadline_ns: u64);

    /// Blocks for a fixed duration. Used for the 1ms pickup spin and the
    /// 100ms fence-wait retry interval.
    fn sleep(&self, duration: time::Duration);
}

/// The real wall clock, backed by a `timerfd` for precise wakeups -- the
/// same mechanism the rest of the broker uses for its own scheduling.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ns(&self) -> u64 {
        now_ns()
    }

    fn sleep_until_ns(&self, deadline_ns: u64) {
        let now = self.now_ns();
        if deadline_ns <= now {
            return;
        }

        self.sleep(time::Duration::from_nanos(deadline_ns - now));
    }

    fn sleep(&self, duration: time::Duration) {
        if duration.is_zero() {
            return;
        }

        // A one-shot timerfd is a precise, interruption-free way to sleep
        // without pulling in a full mio::Poll loop just for this thread.
        match mio_timerfd::TimerFd::new(mio_timerfd::ClockId::Monotonic) {
            Ok(mut timer) => {
                if timer.set_timeout(&duration).is_ok() {
                    let _ = timer.read();
                    return;
                }
            }
            Err(_) => {}
        }

        std::thread::sleep(duration);
    }
}

/// A virtual clock for deterministic tests. `sleep` and `sleep_until_ns`
/// never block; they just fast-forward `now` (never backward) so that
/// subsequent `mark_*` calls observe monotonically increasing timestamps.
#[derive(Clone)]
pub struct FakeClock(Arc<AtomicU64>);

impl FakeClock {
    pub fn new(start_ns: u64) -> Self {
        Self(Arc::new(AtomicU64::new(start_ns)))
    }

    pub fn advance(&self, by_ns: u64) -> u64 {
        self.0.fetch_add(by_ns, Ordering::SeqCst) + by_ns
    }

    pub fn set(&self, ns: u64) {
        self.0.fetch_max(ns, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_ns(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    fn sleep_until_ns(&self, deadline_ns: u64) {
        self.set(deadline_ns);
    }

    fn sleep(&self, duration: time::Duration) {
        self.advance(duration.as_nanos() as u64);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fake_clock_never_goes_backward() {
        let clock = FakeClock::new(1000);
        clock.sleep_until_ns(500);
        assert_eq!(clock.now_ns(), 1000);

        clock.sleep_until_ns(2000);
        assert_eq!(clock.now_ns(), 2000);
    }

    #[test]
    fn fake_clock_sleep_advances() {
        let clock = FakeClock::new(0);
        clock.sleep(time::Duration::from_millis(1));
        assert_eq!(clock.now_ns(), 1_000_000);
    }
}
