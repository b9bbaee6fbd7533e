//! Blocking synchronization objects built on the suspension protocol.

mod event;
mod queue;
mod semaphore;

pub use event::EventGroupInfo;
pub(crate) use event::EventGroup;
pub use queue::{MessageKind, QueueInfo};
pub(crate) use queue::Queue;
pub use semaphore::SemaphoreInfo;
pub(crate) use semaphore::Semaphore;

use crate::mem::slab::slab_id;

slab_id!(
    /// Identity of a counting semaphore.
    SemaphoreId
);

slab_id!(
    /// Identity of an event group.
    EventGroupId
);

slab_id!(
    /// Identity of a message queue.
    QueueId
);

/// How [`Kernel::retrieve_events`](crate::Kernel::retrieve_events) matches
/// the requested flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOp {
    /// Every requested flag must be set.
    And,
    /// Like `And`, then clear the requested flags.
    AndConsume,
    /// At least one requested flag must be set.
    Or,
    /// Like `Or`, then clear the requested flags.
    OrConsume,
}

impl EventOp {
    pub(crate) fn satisfied(self, current: u32, requested: u32) -> bool {
        match self {
            EventOp::And | EventOp::AndConsume => current & requested == requested,
            EventOp::Or | EventOp::OrConsume => current & requested != 0,
        }
    }

    pub(crate) fn consumes(self) -> bool {
        matches!(self, EventOp::AndConsume | EventOp::OrConsume)
    }
}

/// How [`Kernel::set_events`](crate::Kernel::set_events) combines the given
/// flags with the current ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    And,
    Or,
}
