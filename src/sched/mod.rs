//! Scheduling structures: the ready bitmap, the per-priority ready lists and
//! the schedule lock.

pub mod bitmap;
pub(crate) mod lock;
pub(crate) mod ready;

pub use bitmap::PriorityBitmap;
pub use lock::ScheduleGuard;
