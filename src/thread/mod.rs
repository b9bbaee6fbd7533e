//! Task control blocks and the task state machine.

pub(crate) mod builder;
pub(crate) mod frame;

pub use builder::TaskBuilder;
pub use frame::STACK_CANARY;

use crate::mem::slab::slab_id;
use crate::mem::MemoryPoolId;
use crate::wait::BlockId;
use alloc::string::String;
use core::ptr::NonNull;
use frame::TaskFrame;

slab_id!(
    /// Identity of a task.
    TaskId
);

/// Task status.
///
/// The suspended variants are mutually exclusive: a task is suspended for
/// exactly one reason, and only a resume naming that reason lifts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Ready,
    PureSuspend,
    SleepSuspend,
    SemaphoreSuspend,
    MailboxSuspend,
    QueueSuspend,
    MemorySuspend,
    PartitionSuspend,
    EventSuspend,
    DebugSuspend,
    /// The entry future completed.
    Finished,
    /// The task was terminated by [`Kernel::terminate_task`](crate::Kernel::terminate_task).
    Terminated,
}

impl TaskStatus {
    pub fn is_suspended(self) -> bool {
        !matches!(
            self,
            TaskStatus::Ready | TaskStatus::Finished | TaskStatus::Terminated
        )
    }

    pub fn is_done(self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Terminated)
    }
}

/// Signature of a task's signal handler. It receives the delivered signals.
pub type SignalHandler = fn(u32);

/// Per-task signal state.
#[derive(Debug, Default)]
pub(crate) struct SignalState {
    pub(crate) enabled: u32,
    pub(crate) pending: u32,
    pub(crate) handler: Option<SignalHandler>,
    /// The signal shell is running for this task.
    pub(crate) active: bool,
    /// The dispatcher must run the signal shell before the next poll.
    pub(crate) due: bool,
    /// Suspension to restore after a delivery that readied a suspended task.
    /// Set to `Ready` when that suspension is lifted during the delivery.
    pub(crate) saved_status: Option<TaskStatus>,
}

impl SignalState {
    pub(crate) fn deliverable(&self) -> bool {
        self.pending & self.enabled != 0 && self.handler.is_some() && !self.active
    }
}

/// Task control block.
pub(crate) struct Tcb {
    pub(crate) name: String,
    pub(crate) priority: u8,
    pub(crate) preemptible: bool,
    pub(crate) time_slice: u32,
    pub(crate) remaining_slice: u32,
    pub(crate) status: TaskStatus,
    /// A pure suspension requested while the task was suspended otherwise.
    pub(crate) delayed_suspend: bool,
    pub(crate) ready_next: Option<TaskId>,
    pub(crate) ready_prev: Option<TaskId>,
    pub(crate) wait_block: Option<BlockId>,
    /// Deadline of the armed task timer.
    pub(crate) timer: Option<u64>,
    pub(crate) signals: SignalState,
    pub(crate) frame: Option<TaskFrame>,
    pub(crate) stack_base: usize,
    pub(crate) stack_size: usize,
    pub(crate) scheduled_count: u64,
    /// Stack allocated from a memory pool, freed when the task is deleted.
    pub(crate) auto_clean: Option<(MemoryPoolId, NonNull<u8>)>,
}

impl Tcb {
    pub(crate) fn new(name: String, builder: &TaskBuilder, time_slice: u32, frame: TaskFrame) -> Self {
        Self {
            name,
            priority: builder.priority,
            preemptible: builder.preemptible,
            time_slice,
            remaining_slice: time_slice,
            status: TaskStatus::PureSuspend,
            delayed_suspend: false,
            ready_next: None,
            ready_prev: None,
            wait_block: None,
            timer: None,
            signals: SignalState::default(),
            stack_base: frame.base(),
            stack_size: frame.size(),
            frame: Some(frame),
            scheduled_count: 0,
            auto_clean: None,
        }
    }
}

/// Snapshot returned by [`Kernel::task_info`](crate::Kernel::task_info).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub name: String,
    pub status: TaskStatus,
    pub priority: u8,
    pub preemptible: bool,
    pub time_slice: u32,
    pub scheduled_count: u64,
    pub stack_base: usize,
    pub stack_size: usize,
    /// Bytes occupied by the entry future at the top of the stack.
    pub stack_used: usize,
}
