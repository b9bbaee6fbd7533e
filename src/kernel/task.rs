//! Task services.

use super::Kernel;
use crate::arch::Arch;
use crate::errors::{KernelError, KernelResult, ObjectKind};
use crate::mem::region::Region;
use crate::mem::MemoryPoolId;
use crate::thread::frame::TaskFrame;
use crate::thread::{TaskBuilder, TaskId, TaskInfo, TaskStatus, Tcb};
use crate::wait::YieldNow;
use alloc::vec::Vec;
use core::future::Future;
use core::pin::Pin;
use core::ptr::NonNull;
use core::task::{Context, Poll};

impl<A: Arch> Kernel<A> {
    /// Create a task running `entry` on `stack`.
    ///
    /// The entry future is moved to the top of the stack region and a canary
    /// is written at its base. Unless the builder says otherwise the task is
    /// readied at once, and it preempts the caller if it outranks it.
    pub fn create_task<F>(&self, builder: TaskBuilder, stack: Region, entry: F) -> KernelResult<TaskId>
    where
        F: Future<Output = ()> + 'static,
    {
        let frame = TaskFrame::place(stack, entry)?;
        Ok(self.install_task(builder, frame, None))
    }

    /// Create a task whose stack is allocated from `pool` and released when
    /// the task is deleted. The task deletes itself once its entry completes.
    pub fn create_auto_clean_task<F>(
        &self,
        builder: TaskBuilder,
        pool: MemoryPoolId,
        stack_size: usize,
        entry: F,
    ) -> KernelResult<TaskId>
    where
        F: Future<Output = ()> + 'static,
    {
        let stack = self.try_allocate_aligned_memory(pool, stack_size, core::mem::align_of::<u64>())?;
        // Safety: the block is at least `stack_size` bytes and stays ours
        // until the task is deleted.
        let region = unsafe { Region::from_raw_parts(stack, stack_size) };
        let frame = match TaskFrame::place(region, entry) {
            Ok(frame) => frame,
            Err(err) => {
                let _ = self.deallocate_memory(stack);
                return Err(err);
            }
        };
        Ok(self.install_task(builder, frame, Some((pool, stack))))
    }

    fn install_task(&self, builder: TaskBuilder, frame: TaskFrame, auto_clean: Option<(MemoryPoolId, NonNull<u8>)>) -> TaskId {
        let time_slice = builder.time_slice.unwrap_or(self.config.default_time_slice);
        let mut state = self.enter();
        let id = state.tasks.insert_with(|_| {
            let mut tcb = Tcb::new(builder.name.clone(), &builder, time_slice, frame);
            tcb.auto_clean = auto_clean;
            tcb
        });
        state.created_tasks.push(id);
        debug_assert_eq!(state.tasks.len(), state.created_tasks.len());
        log::debug!("created task {} '{}' at priority {}", id, builder.name, builder.priority);
        if builder.auto_start {
            state.resume(id, TaskStatus::PureSuspend);
        }
        id
    }

    /// Delete a finished or terminated task, dropping its entry future and
    /// releasing an auto-clean stack.
    pub fn delete_task(&self, task: TaskId) -> KernelResult<()> {
        let tcb = {
            let mut state = self.enter();
            let done = state.task(task)?.status.is_done();
            if !done || state.current_task() == Some(task) {
                return Err(KernelError::InvalidDelete);
            }
            state.stop_timer(task);
            state.discard_block(task);
            state.created_tasks.retain(|&id| id != task);
            state.tasks.remove(task)
        };
        let Some(mut tcb) = tcb else {
            return Err(KernelError::InvalidObject(ObjectKind::Task));
        };
        if let Some(mut frame) = tcb.frame.take() {
            // Safety: the task is not current, so its entry is not being polled.
            unsafe { frame.drop_entry() };
        }
        if let Some((pool, stack)) = tcb.auto_clean {
            if let Err(err) = self.deallocate_memory(stack) {
                log::warn!("stack of task {} not returned to memory pool {}: {}", task, pool, err);
            }
        }
        log::debug!("deleted task {}", task);
        Ok(())
    }

    /// Pure-suspend a task. A task suspended for another reason picks the
    /// suspension up once that reason is lifted.
    pub fn suspend_task(&self, task: TaskId) -> KernelResult<()> {
        let mut state = self.enter();
        if state.task(task)?.status.is_done() {
            return Err(KernelError::InvalidSuspend);
        }
        state.suspend(task, TaskStatus::PureSuspend, None);
        Ok(())
    }

    /// Lift a pure suspension (or a pending delayed one).
    pub fn resume_task(&self, task: TaskId) -> KernelResult<()> {
        let mut state = self.enter();
        let tcb = state.task(task)?;
        let suspended = tcb.status == TaskStatus::PureSuspend
            || tcb.delayed_suspend
            || tcb.signals.saved_status == Some(TaskStatus::PureSuspend);
        if !suspended {
            log::warn!("resume of task {} which is {:?}", task, tcb.status);
            return Err(KernelError::InvalidResume);
        }
        state.resume(task, TaskStatus::PureSuspend);
        Ok(())
    }

    /// Terminate a task. A waiting task is dequeued from its object. A task
    /// terminating itself stops at its next await point.
    pub fn terminate_task(&self, task: TaskId) -> KernelResult<()> {
        let mut state = self.enter();
        state.task(task)?;
        state.terminate(task);
        log::debug!("terminated task {}", task);
        Ok(())
    }

    /// Suspend the calling task for `ticks` ticks. Zero ticks relinquishes.
    pub fn sleep(&self, ticks: u32) -> Sleep<'_, A> {
        Sleep {
            kernel: self,
            ticks,
            started: false,
        }
    }

    /// Move the calling task behind its equal-priority peers. Await the
    /// returned future to hand the CPU to the dispatcher.
    pub fn relinquish(&self) -> YieldNow {
        let mut state = self.enter();
        if let Some(task) = state.current_task() {
            state.relinquish(task);
        }
        YieldNow::new()
    }

    /// Hand the CPU to the dispatcher once without changing ready order.
    pub fn yield_now(&self) -> YieldNow {
        YieldNow::new()
    }

    /// Returns the previous priority.
    pub fn change_priority(&self, task: TaskId, priority: u8) -> KernelResult<u8> {
        let mut state = self.enter();
        let previous = state.task(task)?.priority;
        if previous != priority {
            state.set_priority(task, priority);
            log::debug!("task {} priority {} -> {}", task, previous, priority);
        }
        Ok(previous)
    }

    /// Change the calling task's preemption posture. Returns the previous one.
    pub fn change_preemption(&self, preemptible: bool) -> KernelResult<bool> {
        let mut state = self.enter();
        let task = state.current_task().ok_or(KernelError::InvalidObject(ObjectKind::Task))?;
        let previous = core::mem::replace(&mut state.task_mut(task)?.preemptible, preemptible);
        if preemptible && !previous {
            state.refresh_executing();
        }
        Ok(previous)
    }

    /// Returns the previous time slice. Zero turns slicing off for the task.
    pub fn change_time_slice(&self, task: TaskId, ticks: u32) -> KernelResult<u32> {
        let mut state = self.enter();
        let tcb = state.task_mut(task)?;
        let previous = core::mem::replace(&mut tcb.time_slice, ticks);
        tcb.remaining_slice = ticks;
        Ok(previous)
    }

    pub fn task_status(&self, task: TaskId) -> KernelResult<TaskStatus> {
        Ok(self.enter().task(task)?.status)
    }

    pub fn task_info(&self, task: TaskId) -> KernelResult<TaskInfo> {
        let state = self.enter();
        let tcb = state.task(task)?;
        Ok(TaskInfo {
            name: tcb.name.clone(),
            status: tcb.status,
            priority: tcb.priority,
            preemptible: tcb.preemptible,
            time_slice: tcb.time_slice,
            scheduled_count: tcb.scheduled_count,
            stack_base: tcb.stack_base,
            stack_size: tcb.stack_size,
            stack_used: tcb.frame.as_ref().map_or(0, TaskFrame::used),
        })
    }

    /// Tasks in creation order.
    pub fn created_tasks(&self) -> Vec<TaskId> {
        self.enter().created_tasks.clone()
    }
}

/// Future returned by [`Kernel::sleep`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Sleep<'k, A: Arch> {
    kernel: &'k Kernel<A>,
    ticks: u32,
    started: bool,
}

impl<A: Arch> Future for Sleep<'_, A> {
    type Output = KernelResult<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.started {
            // Only a ready task is polled, so the sleep is over.
            return Poll::Ready(Ok(()));
        }
        let mut state = this.kernel.enter();
        let Some(task) = state.current_task() else {
            return Poll::Ready(Err(KernelError::InvalidSuspend));
        };
        if state.executing != Some(task) {
            // Suspended, terminated or preempted since the last await: only
            // start sleeping once the dispatcher runs this task again.
            return Poll::Pending;
        }
        if this.ticks == 0 {
            state.relinquish(task);
        } else {
            state.suspend(task, TaskStatus::SleepSuspend, Some(this.ticks));
            log::trace!("task {} sleeping for {} ticks", task, this.ticks);
        }
        this.started = true;
        Poll::Pending
    }
}
