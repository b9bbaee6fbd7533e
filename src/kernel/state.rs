//! Kernel state and the task state machine.
//!
//! Everything the schedule lock protects lives in one [`KernelState`]:
//! created-object lists, the ready queues, the executing task, suspension
//! blocks and task timers. The methods here assume the lock is held and
//! never fail on valid identities; public services check identities first.

use crate::errors::{KernelError, KernelResult, ObjectKind};
use crate::mem::dynamic::DynamicPool;
use crate::mem::partition::PartitionPool;
use crate::mem::slab::{FatalSink, Slab};
use crate::mem::{MemoryPoolId, PartitionPoolId};
use crate::sched::lock::SwitchRequests;
use crate::sched::ready::{ReadyQueues, TaskSlab};
use crate::sync::{EventGroup, EventGroupId, Queue, QueueId, Semaphore, SemaphoreId};
use crate::thread::{TaskId, TaskStatus, Tcb};
use crate::time::TaskTimers;
use crate::wait::BlockSlab;
use alloc::vec::Vec;

/// Thread of control the kernel is currently serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecContext {
    /// Initialization code or the dispatcher between tasks.
    System,
    /// The entry future of this task is being polled.
    Task(TaskId),
    /// Interrupt-level code, which never suspends.
    Interrupt,
}

pub(crate) struct KernelState {
    pub(crate) tasks: TaskSlab,
    pub(crate) created_tasks: Vec<TaskId>,
    pub(crate) ready: ReadyQueues,
    /// Task the dispatcher runs next. Kept in step with every ready-list
    /// change so preemption is decided where readiness changes.
    pub(crate) executing: Option<TaskId>,
    pub(crate) context: ExecContext,
    pub(crate) blocks: BlockSlab,
    pub(crate) memory_pools: Slab<MemoryPoolId, DynamicPool>,
    pub(crate) created_memory_pools: Vec<MemoryPoolId>,
    pub(crate) partition_pools: Slab<PartitionPoolId, PartitionPool>,
    pub(crate) created_partition_pools: Vec<PartitionPoolId>,
    pub(crate) semaphores: Slab<SemaphoreId, Semaphore>,
    pub(crate) created_semaphores: Vec<SemaphoreId>,
    pub(crate) event_groups: Slab<EventGroupId, EventGroup>,
    pub(crate) created_event_groups: Vec<EventGroupId>,
    pub(crate) queues: Slab<QueueId, Queue>,
    pub(crate) created_queues: Vec<QueueId>,
    pub(crate) timers: TaskTimers,
    /// Tick count as of the last tick processed under the lock.
    pub(crate) now: u64,
    switch_requested: bool,
}

impl SwitchRequests for KernelState {
    fn take_switch_request(&mut self) -> bool {
        core::mem::take(&mut self.switch_requested)
    }
}

impl KernelState {
    /// `fatal` receives stale identities met while following internal links.
    pub(crate) const fn new(fatal: FatalSink) -> Self {
        Self {
            tasks: Slab::with_fatal_sink(fatal),
            created_tasks: Vec::new(),
            ready: ReadyQueues::new(),
            executing: None,
            context: ExecContext::System,
            blocks: Slab::with_fatal_sink(fatal),
            memory_pools: Slab::with_fatal_sink(fatal),
            created_memory_pools: Vec::new(),
            partition_pools: Slab::with_fatal_sink(fatal),
            created_partition_pools: Vec::new(),
            semaphores: Slab::with_fatal_sink(fatal),
            created_semaphores: Vec::new(),
            event_groups: Slab::with_fatal_sink(fatal),
            created_event_groups: Vec::new(),
            queues: Slab::with_fatal_sink(fatal),
            created_queues: Vec::new(),
            timers: TaskTimers::new(),
            now: 0,
            switch_requested: false,
        }
    }

    /// Request a transfer to the dispatcher when the lock is released.
    pub(crate) fn control_to_system(&mut self) {
        self.switch_requested = true;
    }

    pub(crate) fn current_task(&self) -> Option<TaskId> {
        match self.context {
            ExecContext::Task(id) => Some(id),
            _ => None,
        }
    }

    pub(crate) fn task(&self, id: TaskId) -> KernelResult<&Tcb> {
        self.tasks.get(id).ok_or(KernelError::InvalidObject(ObjectKind::Task))
    }

    pub(crate) fn task_mut(&mut self, id: TaskId) -> KernelResult<&mut Tcb> {
        self.tasks.get_mut(id).ok_or(KernelError::InvalidObject(ObjectKind::Task))
    }

    /// A change of executing task only preempts someone while a task runs.
    fn preempt(&mut self, preempt: bool) -> bool {
        let preempt = preempt && matches!(self.context, ExecContext::Task(_));
        if preempt {
            self.control_to_system();
        }
        preempt
    }

    /// Link a task into its ready list and decide preemption.
    ///
    /// A newly ready task takes over as the executing task when its priority
    /// is strictly higher than every ready task and the executing task is
    /// preemptible. The result is `true` only when that happens while a task
    /// is running, since only then does someone have to give up the CPU.
    pub(crate) fn make_ready(&mut self, id: TaskId) -> bool {
        self.tasks[id].status = TaskStatus::Ready;
        let priority = self.tasks[id].priority;
        let highest = self.ready.highest();
        if !self.ready.push_back(&mut self.tasks, id) {
            return false;
        }
        if highest.map_or(false, |highest| priority >= highest) {
            return false;
        }
        match self.executing {
            None => {
                self.executing = Some(id);
                false
            }
            Some(current) => {
                let preemptible = self.tasks.get(current).map_or(true, |tcb| tcb.preemptible);
                if preemptible {
                    self.executing = Some(id);
                }
                self.preempt(preemptible)
            }
        }
    }

    /// Lift a suspension of type `kind`.
    ///
    /// Returns whether the resumed task preempts the running one. A resume
    /// for a reason the task is not suspended for only clears a matching
    /// delayed suspension, or marks a suspension saved by an in-progress
    /// signal delivery as lifted.
    pub(crate) fn resume(&mut self, id: TaskId, kind: TaskStatus) -> bool {
        let Some(tcb) = self.tasks.get_mut(id) else {
            return false;
        };
        if tcb.status.is_done() {
            return false;
        }
        if tcb.status == kind {
            log::trace!("task {} ready ({:?} lifted)", id, kind);
            let signal_pending = tcb.signals.saved_status.is_some();
            if tcb.delayed_suspend && kind != TaskStatus::PureSuspend {
                tcb.delayed_suspend = false;
                tcb.status = TaskStatus::PureSuspend;
                if !signal_pending {
                    self.stop_timer(id);
                }
                return false;
            }
            if !signal_pending {
                self.stop_timer(id);
            }
            return self.make_ready(id);
        }

        if kind == TaskStatus::PureSuspend {
            tcb.delayed_suspend = false;
        }
        if tcb.signals.saved_status == Some(kind) {
            tcb.signals.saved_status = Some(TaskStatus::Ready);
            self.stop_timer(id);
        }
        false
    }

    /// Suspend a task for `status`, optionally arming its timer.
    ///
    /// The timer only runs when a ready task actually moves into `status`.
    /// A pure suspension of a task that is already suspended for another
    /// reason is remembered and applied when that suspension is lifted.
    pub(crate) fn suspend(&mut self, id: TaskId, status: TaskStatus, timeout: Option<u32>) {
        let tcb = &mut self.tasks[id];
        if tcb.status == TaskStatus::Ready {
            log::trace!("task {} suspended ({:?})", id, status);
            tcb.status = status;
            tcb.remaining_slice = tcb.time_slice;
            self.ready.remove(&mut self.tasks, id);
            if self.executing == Some(id) {
                self.executing = self.ready.highest_head();
            }
            if self.current_task() == Some(id) {
                self.control_to_system();
            }
            if let Some(ticks) = timeout {
                self.start_timer(id, ticks);
            }
        } else if status == TaskStatus::PureSuspend && tcb.status != TaskStatus::PureSuspend {
            tcb.delayed_suspend = true;
        }
    }

    pub(crate) fn start_timer(&mut self, id: TaskId, ticks: u32) {
        self.stop_timer(id);
        let deadline = self.now + u64::from(ticks);
        self.tasks[id].timer = Some(deadline);
        self.timers.start(deadline, id);
    }

    pub(crate) fn stop_timer(&mut self, id: TaskId) {
        if let Some(deadline) = self.tasks.get_mut(id).and_then(|tcb| tcb.timer.take()) {
            self.timers.stop(deadline, id);
        }
    }

    /// Timer expiry: cancel the task's wait with `Timeout` and resume it.
    pub(crate) fn task_timeout(&mut self, id: TaskId) -> bool {
        let Some(tcb) = self.tasks.get_mut(id) else {
            return false;
        };
        tcb.timer = None;
        if tcb.status.is_done() {
            return false;
        }
        let status = match tcb.signals.saved_status {
            Some(saved) if saved != TaskStatus::Ready => saved,
            _ => tcb.status,
        };
        self.cleanup_wait(id, Err(KernelError::Timeout));
        self.resume(id, status)
    }

    /// Advance to tick `now`, expiring timers and charging the executing
    /// task's time slice.
    pub(crate) fn advance_clock(&mut self, now: u64) {
        self.now = now;
        let before = self.executing;
        for task in self.timers.expire(now) {
            self.task_timeout(task);
        }
        self.charge_time_slice();
        if self.executing != before {
            self.control_to_system();
        }
    }

    fn charge_time_slice(&mut self) {
        let Some(id) = self.executing else {
            return;
        };
        let Some(tcb) = self.tasks.get_mut(id) else {
            return;
        };
        if tcb.status != TaskStatus::Ready || tcb.time_slice == 0 {
            return;
        }
        tcb.remaining_slice = tcb.remaining_slice.saturating_sub(1);
        if tcb.remaining_slice > 0 {
            return;
        }
        tcb.remaining_slice = tcb.time_slice;
        let (priority, preemptible) = (tcb.priority, tcb.preemptible);
        let outranked = self.ready.highest().map_or(false, |highest| highest < priority);
        if preemptible && (outranked || self.ready.has_peers(&self.tasks, id)) {
            self.ready.rotate(&mut self.tasks, id);
            self.executing = self.ready.highest_head();
            log::trace!("time slice of task {} expired", id);
        }
    }

    /// Move the task behind its equal-priority peers and let the highest
    /// ready task run next.
    pub(crate) fn relinquish(&mut self, id: TaskId) {
        if self.tasks[id].status != TaskStatus::Ready {
            return;
        }
        if self.ready.has_peers(&self.tasks, id) {
            self.ready.rotate(&mut self.tasks, id);
        }
        self.executing = self.ready.highest_head();
    }

    /// Re-evaluate the executing task after a priority or preemption change.
    pub(crate) fn refresh_executing(&mut self) -> bool {
        if let Some(current) = self.executing {
            if let Some(tcb) = self.tasks.get(current) {
                if tcb.status == TaskStatus::Ready && !tcb.preemptible {
                    return false;
                }
            }
        }
        let head = self.ready.highest_head();
        if head == self.executing {
            return false;
        }
        self.executing = head;
        self.preempt(true)
    }

    /// Task the dispatcher should poll next.
    pub(crate) fn next_to_run(&mut self) -> Option<TaskId> {
        if let Some(current) = self.executing {
            if self.tasks.get(current).map_or(false, |tcb| tcb.status == TaskStatus::Ready) {
                return Some(current);
            }
        }
        self.executing = self.ready.highest_head();
        self.executing
    }

    /// Move a task to `Terminated`, abandoning any wait.
    pub(crate) fn terminate(&mut self, id: TaskId) {
        if self.tasks[id].status.is_done() {
            return;
        }
        self.stop_timer(id);
        self.cleanup_wait(id, Err(KernelError::ObjectDeleted));
        let tcb = &mut self.tasks[id];
        tcb.signals.saved_status = None;
        tcb.signals.due = false;
        tcb.delayed_suspend = false;
        if tcb.status == TaskStatus::Ready {
            self.suspend(id, TaskStatus::Terminated, None);
        } else {
            tcb.status = TaskStatus::Terminated;
        }
    }

    /// Put a task that was readied for a signal delivery back into its
    /// saved suspension.
    pub(crate) fn resuspend(&mut self, id: TaskId, status: TaskStatus) {
        if self.tasks[id].status != TaskStatus::Ready {
            return;
        }
        self.ready.remove(&mut self.tasks, id);
        self.tasks[id].status = status;
        if self.executing == Some(id) {
            self.executing = self.ready.highest_head();
        }
    }

    /// The entry future completed.
    pub(crate) fn finish(&mut self, id: TaskId) {
        if self.tasks[id].status.is_done() {
            return;
        }
        self.terminate(id);
        self.tasks[id].status = TaskStatus::Finished;
    }

    /// Change a task's priority, relinking it if it is ready.
    pub(crate) fn set_priority(&mut self, id: TaskId, priority: u8) -> bool {
        let ready = self.tasks[id].status == TaskStatus::Ready;
        if ready {
            self.ready.remove(&mut self.tasks, id);
        }
        self.tasks[id].priority = priority;
        if ready {
            self.ready.push_back(&mut self.tasks, id);
        }
        self.refresh_executing()
    }
}
