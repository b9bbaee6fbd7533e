//! Time keeping: the tick clock, task timers and suspension options.

mod tick;
mod timer;

pub use tick::TickCounter;
pub(crate) use timer::TaskTimers;

use crate::errors::{KernelError, KernelResult};

/// A duration of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration(u64);

impl Duration {
    /// Create a duration from nanoseconds.
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Create a duration from microseconds.
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros * 1_000)
    }

    /// Create a duration from milliseconds.
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis * 1_000_000)
    }

    /// Get nanoseconds in this duration.
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Get milliseconds in this duration.
    pub const fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }
}

/// How long a blocking service may suspend the calling task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suspend {
    /// Fail with [`KernelError::NoResourceAvailable`] instead of suspending.
    NoWait,
    /// Suspend until the request is satisfied or the object is deleted.
    Forever,
    /// Suspend for at most this many ticks.
    Timeout(u32),
}

impl Suspend {
    /// Tick count for the task timer, or `None` when no timer is armed.
    pub(crate) fn timer_ticks(self) -> Option<u32> {
        match self {
            Suspend::Timeout(ticks) => Some(ticks),
            _ => None,
        }
    }

    /// A zero-tick timeout can never be honoured.
    pub(crate) fn validate(self) -> KernelResult<Self> {
        match self {
            Suspend::Timeout(0) => Err(KernelError::InvalidSuspend),
            other => Ok(other),
        }
    }
}
