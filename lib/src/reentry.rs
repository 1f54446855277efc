use core::sync::atomic::{AtomicBool, Ordering};

/// Single-entry gate for code paths that callbacks may re-enter.
///
/// [`try_enter`](Self::try_enter) wins the flag with a compare-exchange, so
/// of two concurrent or nested callers exactly one proceeds and the other
/// sees `None` and must back off without touching the guarded state.
pub struct ReentryGuard {
    busy: AtomicBool,
}

pub struct ReentryToken<'a> {
    guard: &'a ReentryGuard,
}

impl ReentryGuard {
    pub const fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn try_enter(&self) -> Option<ReentryToken<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ReentryToken { guard: self })
    }

    #[inline]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Relaxed)
    }
}

impl Default for ReentryGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ReentryToken<'_> {
    #[inline]
    fn drop(&mut self) {
        self.guard.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_entry_is_refused_until_token_drops() {
        let guard = ReentryGuard::new();
        let outer = guard.try_enter().expect("first entry");
        assert!(guard.try_enter().is_none());
        assert!(guard.is_busy());
        drop(outer);
        assert!(guard.try_enter().is_some());
    }
}
