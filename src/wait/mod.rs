//! The suspension and resumption protocol shared by every blocking object.
//!
//! A blocking service never parks a task by hand. It describes its request
//! with a [`Request`] and hands it to [`Wait`], which
//!
//! 1. validates the request without the lock,
//! 2. takes the schedule lock and tries to complete at once,
//! 3. otherwise links a [`SuspensionBlock`] into the object's [`WaitList`]
//!    (FIFO or priority ordered), suspends the task with an optional timer
//!    and returns `Pending`,
//! 4. when the task is dispatched again, reads the outcome the satisfying,
//!    deleting or timing-out party stored in the block.

mod list;

pub(crate) use list::WaitList;

use crate::arch::Arch;
use crate::errors::{KernelError, KernelResult};
use crate::kernel::state::KernelState;
use crate::kernel::Kernel;
use crate::mem::slab::{slab_id, Slab};
use crate::mem::{MemoryPoolId, PartitionPoolId};
use crate::sync::{EventGroupId, EventOp, QueueId, SemaphoreId};
use crate::thread::{TaskId, TaskStatus};
use crate::time::Suspend;
use alloc::vec::Vec;
use core::future::Future;
use core::pin::Pin;
use core::ptr::NonNull;
use core::task::{Context, Poll};

slab_id!(
    /// Identity of a suspension block.
    BlockId
);

pub(crate) type BlockSlab = Slab<BlockId, SuspensionBlock>;

/// Order in which an object resumes its waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendPolicy {
    /// Arrival order.
    Fifo,
    /// Task priority, arrival order among equal priorities.
    Priority,
}

/// The object a suspension block is linked into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitObject {
    MemoryPool(MemoryPoolId),
    PartitionPool(PartitionPoolId),
    Semaphore(SemaphoreId),
    EventGroup(EventGroupId),
    Queue(QueueId),
    /// Senders to the front of a full queue.
    QueueUrgent(QueueId),
}

/// What the suspended task asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WaitRequest {
    Memory { size: usize, align: usize },
    Partition,
    Semaphore,
    Events { requested: u32, op: EventOp },
    /// The message travels in the block until a receiver takes it.
    QueueSend { message: Vec<u32> },
    QueueReceive,
}

/// Value handed to a resumed waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WaitValue {
    None,
    Pointer(NonNull<u8>),
    Events(u32),
    Message(Vec<u32>),
}

/// Per-call record linking a suspended task to the object it awaits.
pub(crate) struct SuspensionBlock {
    pub(crate) task: TaskId,
    pub(crate) status: TaskStatus,
    pub(crate) object: WaitObject,
    pub(crate) request: WaitRequest,
    pub(crate) priority: u8,
    pub(crate) next: Option<BlockId>,
    pub(crate) prev: Option<BlockId>,
    pub(crate) linked: bool,
    pub(crate) outcome: Option<KernelResult<WaitValue>>,
}

/// A kernel object that owns a suspension list.
pub(crate) trait WaitTarget {
    fn waiters(&mut self) -> &mut WaitList;
}

/// A blocking request handled by [`Wait`].
pub(crate) trait Request: Unpin {
    type Output;

    /// Status the task carries while suspended on this request.
    const STATUS: TaskStatus;

    fn object(&self) -> WaitObject;

    fn wait_request(&self) -> WaitRequest;

    /// Argument checks that need no kernel state.
    fn validate(&self) -> KernelResult<()> {
        Ok(())
    }

    /// Check the object identity and complete the request if possible.
    /// `Ok(None)` means the caller has to wait.
    fn attempt(&mut self, state: &mut KernelState) -> KernelResult<Option<Self::Output>>;

    /// Convert the value stored by whoever satisfied the wait.
    fn output(value: WaitValue) -> KernelResult<Self::Output>;
}

enum Phase {
    Start,
    Waiting(BlockId),
    Done,
}

/// Future driving one blocking request.
///
/// Dropping it while suspended leaves the block owned by the task; the block
/// is reclaimed on the task's next wait or when the task is deleted.
pub(crate) struct Wait<'k, A: Arch, R: Request> {
    kernel: &'k Kernel<A>,
    request: R,
    suspend: Suspend,
    phase: Phase,
}

impl<'k, A: Arch, R: Request> Wait<'k, A, R> {
    pub(crate) fn new(kernel: &'k Kernel<A>, request: R, suspend: Suspend) -> Self {
        Self {
            kernel,
            request,
            suspend,
            phase: Phase::Start,
        }
    }

    fn start(&mut self) -> Poll<KernelResult<R::Output>> {
        if let Err(err) = self.request.validate() {
            return Poll::Ready(Err(err));
        }
        let suspend = match self.suspend.validate() {
            Ok(suspend) => suspend,
            Err(err) => return Poll::Ready(Err(err)),
        };

        let mut state = self.kernel.enter();
        let task = state.current_task();
        if suspend != Suspend::NoWait && task.is_none() {
            return Poll::Ready(Err(KernelError::InvalidSuspend));
        }
        if task.is_some() && state.executing != task {
            // Preempted since the last await: let the dispatcher switch and
            // start over when this task runs again.
            return Poll::Pending;
        }
        match self.request.attempt(&mut state) {
            Ok(Some(output)) => return Poll::Ready(Ok(output)),
            Ok(None) => {}
            Err(err) => return Poll::Ready(Err(err)),
        }
        let Some(task) = task.filter(|_| suspend != Suspend::NoWait) else {
            return Poll::Ready(Err(KernelError::NoResourceAvailable));
        };

        let block = state.suspend_on(
            task,
            R::STATUS,
            self.request.object(),
            self.request.wait_request(),
            suspend.timer_ticks(),
        );
        log::trace!("task {} suspended on {:?}", task, self.request.object());
        self.phase = Phase::Waiting(block);
        Poll::Pending
    }
}

impl<A: Arch, R: Request> Future for Wait<'_, A, R> {
    type Output = KernelResult<R::Output>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.phase {
            Phase::Start => {
                let poll = this.start();
                if poll.is_ready() {
                    this.phase = Phase::Done;
                }
                poll
            }
            Phase::Waiting(block) => {
                let outcome = this.kernel.enter().take_outcome(block);
                match outcome {
                    Some(outcome) => {
                        this.phase = Phase::Done;
                        Poll::Ready(outcome.and_then(R::output))
                    }
                    None => Poll::Pending,
                }
            }
            Phase::Done => Poll::Ready(Err(KernelError::InvalidSuspend)),
        }
    }
}

/// Future that returns `Pending` exactly once, handing the CPU back to the
/// dispatcher.
#[must_use = "futures do nothing unless you `.await` or poll them"]
#[derive(Debug, Default)]
pub struct YieldNow {
    yielded: bool,
}

impl YieldNow {
    pub(crate) fn new() -> Self {
        Self { yielded: false }
    }
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            Poll::Pending
        }
    }
}

impl KernelState {
    /// Run `f` on the suspension list of `object`, if the object is live.
    pub(crate) fn with_wait_list<T>(
        &mut self,
        object: WaitObject,
        f: impl FnOnce(&mut WaitList, &mut BlockSlab) -> T,
    ) -> Option<T> {
        let KernelState {
            memory_pools,
            partition_pools,
            semaphores,
            event_groups,
            queues,
            blocks,
            ..
        } = self;
        let list = match object {
            WaitObject::MemoryPool(id) => memory_pools.get_mut(id).map(WaitTarget::waiters),
            WaitObject::PartitionPool(id) => partition_pools.get_mut(id).map(WaitTarget::waiters),
            WaitObject::Semaphore(id) => semaphores.get_mut(id).map(WaitTarget::waiters),
            WaitObject::EventGroup(id) => event_groups.get_mut(id).map(WaitTarget::waiters),
            WaitObject::Queue(id) => queues.get_mut(id).map(WaitTarget::waiters),
            WaitObject::QueueUrgent(id) => queues.get_mut(id).map(|queue| &mut queue.urgent),
        }?;
        Some(f(list, blocks))
    }

    /// Link a new suspension block for `task` and suspend it.
    pub(crate) fn suspend_on(
        &mut self,
        task: TaskId,
        status: TaskStatus,
        object: WaitObject,
        request: WaitRequest,
        timeout: Option<u32>,
    ) -> BlockId {
        self.discard_block(task);
        let priority = self.tasks[task].priority;
        let block = self.blocks.insert_with(|_| SuspensionBlock {
            task,
            status,
            object,
            request,
            priority,
            next: None,
            prev: None,
            linked: false,
            outcome: None,
        });
        self.with_wait_list(object, |list, blocks| list.insert(blocks, block));
        self.tasks[task].wait_block = Some(block);
        self.suspend(task, status, timeout);
        block
    }

    /// Complete an already unlinked block and resume its task. Returns
    /// `true` if the resumed task should preempt the caller.
    pub(crate) fn settle(&mut self, block: BlockId, outcome: KernelResult<WaitValue>) -> bool {
        let (task, status) = {
            let entry = &mut self.blocks[block];
            entry.outcome = Some(outcome);
            (entry.task, entry.status)
        };
        self.resume(task, status)
    }

    /// Unlink the first waiter of `object` and complete it.
    pub(crate) fn settle_first(&mut self, object: WaitObject, outcome: KernelResult<WaitValue>) -> Option<bool> {
        let block = self.with_wait_list(object, |list, blocks| {
            let head = list.head();
            if let Some(head) = head {
                list.unlink(blocks, head);
            }
            head
        })??;
        Some(self.settle(block, outcome))
    }

    /// Resume every waiter of a list detached from a deleted object.
    /// Preemption flags are combined so the caller transfers control once.
    pub(crate) fn release_waiters(&mut self, mut list: WaitList, outcome: KernelResult<WaitValue>) -> bool {
        let mut preempt = false;
        while let Some(block) = list.head() {
            list.unlink(&mut self.blocks, block);
            preempt |= self.settle(block, outcome.clone());
        }
        preempt
    }

    /// Unlink the task's pending suspension block, if any, recording
    /// `outcome` without resuming the task.
    pub(crate) fn cleanup_wait(&mut self, task: TaskId, outcome: KernelResult<WaitValue>) {
        let Some(block) = self.tasks.get(task).and_then(|tcb| tcb.wait_block) else {
            return;
        };
        let Some(entry) = self.blocks.get(block) else {
            return;
        };
        if entry.outcome.is_some() {
            return;
        }
        if entry.linked {
            let object = entry.object;
            self.with_wait_list(object, |list, blocks| list.unlink(blocks, block));
        }
        self.blocks[block].outcome = Some(outcome);
    }

    /// Take the outcome of a completed wait, releasing the block.
    pub(crate) fn take_outcome(&mut self, block: BlockId) -> Option<KernelResult<WaitValue>> {
        if self.blocks.get(block)?.outcome.is_none() {
            return None;
        }
        let entry = self.blocks.remove(block)?;
        if let Some(tcb) = self.tasks.get_mut(entry.task) {
            if tcb.wait_block == Some(block) {
                tcb.wait_block = None;
            }
        }
        entry.outcome
    }

    /// Free a block the task no longer awaits.
    pub(crate) fn discard_block(&mut self, task: TaskId) {
        let Some(block) = self.tasks.get_mut(task).and_then(|tcb| tcb.wait_block.take()) else {
            return;
        };
        if self.blocks.get(block).map_or(false, |entry| entry.linked) {
            let object = self.blocks[block].object;
            self.with_wait_list(object, |list, blocks| list.unlink(blocks, block));
        }
        self.blocks.remove(block);
    }
}
