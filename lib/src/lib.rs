#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

#[cfg(test)]
extern crate std;

pub mod clock;
pub mod cmdline;
pub mod cpu;
pub mod klog;
pub mod ports;
pub mod reentry;
pub mod ring_buffer;
pub mod spinlock;

pub mod tsc {
    #[inline(always)]
    pub fn rdtsc() -> u64 {
        // SAFETY: RDTSC has no side effects and is available on every x86_64 CPU.
        unsafe { core::arch::x86_64::_rdtsc() }
    }
}

pub use clock::{Clock, Deadline, SteppingClock, TimedOut, TscClock};
pub use klog::{KlogLevel, klog_get_level, klog_init, klog_register_backend, klog_set_level};
pub use reentry::{ReentryGuard, ReentryToken};
pub use ring_buffer::RingBuffer;
pub use spinlock::{IrqMutex, IrqMutexGuard};
