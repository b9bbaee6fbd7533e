//! Tick counting.

use portable_atomic::{AtomicU64, Ordering};

/// Monotonic tick counter advanced by [`Kernel::tick`](crate::Kernel::tick).
///
/// Reads are lock-free so the clock can be sampled without taking the
/// schedule lock.
pub struct TickCounter {
    /// Number of ticks since the kernel was constructed
    ticks: AtomicU64,
}

impl TickCounter {
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
        }
    }

    /// Advance the counter and return the new tick count.
    ///
    /// Only the tick source may call this.
    pub fn increment(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Get the current tick count.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }
}

impl Default for TickCounter {
    fn default() -> Self {
        Self::new()
    }
}
