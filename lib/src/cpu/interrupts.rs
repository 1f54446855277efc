//! Interrupt flag management: irqsave/irqrestore.
//!
//! Bare-metal builds drive RFLAGS.IF through the `x86_64` crate.  Hosted
//! builds (unit tests running as ordinary processes) are not allowed to
//! execute `cli`/`sti`, so there the helpers only report "interrupts off".

/// RFLAGS.IF
const RFLAGS_IF: u64 = 1 << 9;

#[cfg(target_os = "none")]
mod imp {
    use x86_64::instructions::interrupts;
    use x86_64::registers::rflags;

    #[inline(always)]
    pub fn read_rflags() -> u64 {
        rflags::read_raw()
    }

    #[inline(always)]
    pub fn disable_interrupts() {
        interrupts::disable();
    }

    #[inline(always)]
    pub fn enable_interrupts() {
        interrupts::enable();
    }
}

#[cfg(not(target_os = "none"))]
mod imp {
    #[inline(always)]
    pub fn read_rflags() -> u64 {
        0
    }

    #[inline(always)]
    pub fn disable_interrupts() {}

    #[inline(always)]
    pub fn enable_interrupts() {}
}

pub use imp::{disable_interrupts, enable_interrupts, read_rflags};

/// Save RFLAGS and disable interrupts.  Returns the saved value.
#[inline(always)]
pub fn save_flags_cli() -> u64 {
    let flags = read_rflags();
    disable_interrupts();
    flags
}

/// Re-enable interrupts only if they were enabled in `flags`.
#[inline(always)]
pub fn restore_flags(flags: u64) {
    if flags & RFLAGS_IF != 0 {
        enable_interrupts();
    }
}

#[inline(always)]
pub fn are_interrupts_enabled() -> bool {
    (read_rflags() & RFLAGS_IF) != 0
}
