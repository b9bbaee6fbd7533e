//! The dispatcher: picks the task to run and polls its entry future.

use super::state::ExecContext;
use super::Kernel;
use crate::arch::Arch;
use crate::thread::frame::TaskFrame;
use core::ptr;
use core::task::{Context, RawWaker, RawWakerVTable, Waker};

/// Entry futures are never woken: the kernel readies tasks itself and the
/// dispatcher polls whatever is ready.
fn noop_waker() -> Waker {
    fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(ptr::null(), &VTABLE)
    }
    fn noop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
    // Safety: the vtable functions ignore the data pointer.
    unsafe { Waker::from_raw(RawWaker::new(ptr::null(), &VTABLE)) }
}

impl<A: Arch> Kernel<A> {
    /// Give the CPU to the task that should run next.
    ///
    /// The executing task keeps the CPU while it is ready and nobody
    /// preempted it; otherwise the head of the highest-priority ready list
    /// runs. Pending signal deliveries run before the entry future is
    /// polled. Returns `false` when no task is ready, or when called from
    /// anything but system context.
    pub fn dispatch_once(&self) -> bool {
        let (task, entry, signals_due) = {
            let mut state = self.enter();
            if state.context != ExecContext::System {
                return false;
            }
            self.lock.nest().clear_switch_pending();
            let Some(task) = state.next_to_run() else {
                return false;
            };
            state.context = ExecContext::Task(task);
            let tcb = &mut state.tasks[task];
            tcb.scheduled_count += 1;
            let due = core::mem::take(&mut tcb.signals.due);
            (task, tcb.frame.as_ref().and_then(TaskFrame::entry), due)
        };
        log::trace!("dispatching task {}", task);

        if signals_due && !self.run_signal_shell(task) {
            self.enter().context = ExecContext::System;
            return true;
        }

        let finished = match entry {
            Some(entry) => {
                let waker = noop_waker();
                let mut cx = Context::from_waker(&waker);
                // Safety: only the dispatcher polls entries and it refuses to
                // run from task context, so the future is not aliased.
                unsafe { entry.poll(&mut cx) }.is_ready()
            }
            None => true,
        };

        // Still in task context here, so the stack check covers the poll.
        let completed = {
            let mut state = self.enter();
            state.context = ExecContext::System;
            if finished {
                state.finish(task);
                state
                    .tasks
                    .get_mut(task)
                    .map(|tcb| (tcb.frame.take(), tcb.auto_clean.is_some()))
            } else {
                None
            }
        };

        if let Some((frame, auto_clean)) = completed {
            if let Some(mut frame) = frame {
                // Safety: the poll above returned, so the entry is idle.
                unsafe { frame.drop_entry() };
                if let Some(tcb) = self.enter().tasks.get_mut(task) {
                    tcb.frame = Some(frame);
                }
            }
            log::debug!("task {} finished", task);
            if auto_clean {
                if let Err(err) = self.delete_task(task) {
                    log::warn!("auto-clean of task {} failed: {}", task, err);
                }
            }
        }
        true
    }

    /// Dispatch until no task is ready. Returns the number of dispatches.
    pub fn run_until_idle(&self) -> usize {
        let mut dispatched = 0;
        while self.dispatch_once() {
            dispatched += 1;
        }
        dispatched
    }

    /// Dispatch at most `limit` times. Returns the number of dispatches.
    pub fn run_for(&self, limit: usize) -> usize {
        let mut dispatched = 0;
        while dispatched < limit && self.dispatch_once() {
            dispatched += 1;
        }
        dispatched
    }
}
