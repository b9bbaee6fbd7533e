//! Kernel configuration.

use crate::time::Duration;

/// Number of distinct task priorities. Priority 0 is the highest.
pub const PRIORITIES: usize = 256;

/// Number of eight-priority groups tracked by the ready bitmap.
pub const PRIORITY_GROUPS: usize = PRIORITIES / 8;

/// Maximum number of bytes kept from an object name.
pub const MAX_NAME: usize = 8;

/// Configuration fixed when the kernel is constructed.
///
/// All setters are `const` so a kernel can be built in a `static`:
///
/// ```ignore
/// static KERNEL: Kernel<DefaultArch> =
///     Kernel::new(KernelConfig::new().with_ticks_per_second(1000));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Rate at which the board calls [`Kernel::tick`](crate::Kernel::tick).
    pub ticks_per_second: u32,
    /// Time slice, in ticks, for tasks that do not request one. Zero disables slicing.
    pub default_time_slice: u32,
    /// Verify the current task's stack canary at service entry points.
    pub check_stacks: bool,
}

impl KernelConfig {
    pub const fn new() -> Self {
        Self {
            ticks_per_second: 100,
            default_time_slice: 10,
            check_stacks: true,
        }
    }

    pub const fn with_ticks_per_second(mut self, ticks: u32) -> Self {
        self.ticks_per_second = ticks;
        self
    }

    pub const fn with_default_time_slice(mut self, ticks: u32) -> Self {
        self.default_time_slice = ticks;
        self
    }

    pub const fn with_stack_checking(mut self, enabled: bool) -> Self {
        self.check_stacks = enabled;
        self
    }

    /// Convert a duration to a tick count, rounding up so a non-zero
    /// duration never becomes zero ticks.
    pub fn ticks_for(&self, duration: Duration) -> u32 {
        let nanos_per_tick = (1_000_000_000u64 / u64::from(self.ticks_per_second.max(1))).max(1);
        let ticks = (duration.as_nanos() + nanos_per_tick - 1) / nanos_per_tick;
        u32::try_from(ticks).unwrap_or(u32::MAX)
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_rounds_up_to_whole_ticks() {
        let config = KernelConfig::new().with_ticks_per_second(100);
        assert_eq!(config.ticks_for(Duration::from_millis(10)), 1);
        assert_eq!(config.ticks_for(Duration::from_millis(11)), 2);
        assert_eq!(config.ticks_for(Duration::from_nanos(1)), 1);
        assert_eq!(config.ticks_for(Duration::from_nanos(0)), 0);
    }
}
