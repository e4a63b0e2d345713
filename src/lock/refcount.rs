//! Atomic reference count (spec.md §4.1, C1).
use core::sync::atomic::{AtomicUsize, Ordering};

/// An atomic counter with `increment`/`decrement`. Used to back inode,
/// block, and physical-page reference counts (spec.md §4.4, "Page
/// reference counts").
#[derive(Debug, Default)]
pub struct RefCount(AtomicUsize);

impl RefCount {
    pub const fn new(initial: usize) -> Self {
        Self(AtomicUsize::new(initial))
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    pub fn increment(&self) -> usize {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the count. Returns `true` if the count reached zero.
    pub fn decrement(&self) -> bool {
        let prev = self.0.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "RefCount underflow");
        prev == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrement_reports_zero_crossing() {
        let rc = RefCount::new(2);
        assert!(!rc.decrement());
        assert!(rc.decrement());
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn decrement_below_zero_panics() {
        let rc = RefCount::new(0);
        rc.decrement();
    }
}
