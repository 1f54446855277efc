//! Monotonic time sources and deadlines for hardware waits.
//!
//! Drivers never count loop iterations to decide that a device is dead.
//! They build a [`Deadline`] from whatever [`Clock`] the kernel injected and
//! spin until either the condition holds or the deadline passes.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;

/// Monotonic microsecond counter.
pub trait Clock {
    fn now_us(&self) -> u64;

    #[inline]
    fn now_ms(&self) -> u64 {
        self.now_us() / 1000
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    #[inline]
    fn now_us(&self) -> u64 {
        (**self).now_us()
    }
}

/// TSC-backed clock.  `cycles_per_us` comes from boot-time calibration.
pub struct TscClock {
    cycles_per_us: u64,
    origin: u64,
}

impl TscClock {
    pub fn new(cycles_per_us: u64) -> Self {
        Self {
            cycles_per_us: cycles_per_us.max(1),
            origin: crate::tsc::rdtsc(),
        }
    }
}

impl Clock for TscClock {
    #[inline]
    fn now_us(&self) -> u64 {
        crate::tsc::rdtsc().wrapping_sub(self.origin) / self.cycles_per_us
    }
}

/// Clock that advances by a fixed step every time it is read.
///
/// Any spin loop driven by it terminates, which makes it the clock of choice
/// for driving drivers against fake hardware.
pub struct SteppingClock {
    now: AtomicU64,
    step_us: u64,
}

impl SteppingClock {
    pub const fn new(step_us: u64) -> Self {
        Self {
            now: AtomicU64::new(0),
            step_us,
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_micros() as u64, Ordering::Relaxed);
    }
}

impl Clock for SteppingClock {
    #[inline]
    fn now_us(&self) -> u64 {
        self.now.fetch_add(self.step_us, Ordering::Relaxed)
    }
}

/// Wait budget for one hardware operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadline {
    expires_us: u64,
}

/// A [`Deadline`] passed before the awaited condition held.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimedOut;

impl Deadline {
    pub fn after(clock: &dyn Clock, timeout: Duration) -> Self {
        Self {
            expires_us: clock.now_us().saturating_add(timeout.as_micros() as u64),
        }
    }

    #[inline]
    pub fn expired(&self, clock: &dyn Clock) -> bool {
        clock.now_us() >= self.expires_us
    }

    pub fn remaining(&self, clock: &dyn Clock) -> Duration {
        Duration::from_micros(self.expires_us.saturating_sub(clock.now_us()))
    }

    /// Spin until `poll` yields `Some`, or fail once the deadline passes.
    ///
    /// `poll` is always evaluated at least once, even on an expired deadline.
    pub fn spin_until<T>(
        &self,
        clock: &dyn Clock,
        mut poll: impl FnMut() -> Option<T>,
    ) -> Result<T, TimedOut> {
        loop {
            if let Some(v) = poll() {
                return Ok(v);
            }
            if self.expired(clock) {
                return Err(TimedOut);
            }
            spin_loop();
        }
    }
}

/// Spin until `cond` is true or `timeout` elapses.
pub fn wait_for(clock: &dyn Clock, timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    Deadline::after(clock, timeout)
        .spin_until(clock, || cond().then_some(()))
        .is_ok()
}

/// Busy-wait for `duration`.
pub fn delay(clock: &dyn Clock, duration: Duration) {
    let deadline = Deadline::after(clock, duration);
    while !deadline.expired(clock) {
        spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spin_until_times_out_on_stepping_clock() {
        let clock = SteppingClock::new(100);
        let deadline = Deadline::after(&clock, Duration::from_millis(1));
        assert_eq!(deadline.spin_until(&clock, || None::<()>), Err(TimedOut));
    }

    #[test]
    fn spin_until_returns_value_when_ready() {
        let clock = SteppingClock::new(10);
        let mut polls = 0;
        let got = Deadline::after(&clock, Duration::from_millis(5)).spin_until(&clock, || {
            polls += 1;
            (polls == 3).then_some(42)
        });
        assert_eq!(got, Ok(42));
    }

    #[test]
    fn advance_moves_time_forward() {
        let clock = SteppingClock::new(0);
        let deadline = Deadline::after(&clock, Duration::from_millis(2));
        assert!(!deadline.expired(&clock));
        clock.advance(Duration::from_millis(2));
        assert!(deadline.expired(&clock));
        assert!(wait_for(&clock, Duration::from_millis(1), || true));
    }
}
