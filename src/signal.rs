//! Task signals.
//!
//! Each task has 32 signals, an enable mask and an optional handler. A signal
//! is delivered by calling the handler with the batch of signals that are
//! both pending and enabled. Delivery to the calling task happens inline.
//! Delivery to another task is flagged on the target and carried out by the
//! dispatcher right before the target is next polled; a suspended target is
//! readied just for that and put back into its suspension afterwards unless
//! the suspension was lifted while the handler ran.

use crate::arch::Arch;
use crate::errors::{KernelError, KernelResult, ObjectKind};
use crate::kernel::Kernel;
use crate::thread::{SignalHandler, TaskId, TaskStatus};

impl<A: Arch> Kernel<A> {
    /// Install the calling task's signal handler.
    pub fn register_signal_handler(&self, handler: SignalHandler) -> KernelResult<()> {
        let (task, deliverable) = {
            let mut state = self.enter();
            let task = state.current_task().ok_or(KernelError::InvalidObject(ObjectKind::Task))?;
            let signals = &mut state.task_mut(task)?.signals;
            signals.handler = Some(handler);
            (task, signals.deliverable())
        };
        if deliverable {
            self.run_signal_shell(task);
        }
        Ok(())
    }

    /// Replace the calling task's enable mask. Returns the previous mask.
    pub fn control_signals(&self, enable_mask: u32) -> KernelResult<u32> {
        let (task, previous, deliverable) = {
            let mut state = self.enter();
            let task = state.current_task().ok_or(KernelError::InvalidObject(ObjectKind::Task))?;
            let signals = &mut state.task_mut(task)?.signals;
            let previous = core::mem::replace(&mut signals.enabled, enable_mask);
            (task, previous, signals.deliverable())
        };
        if deliverable {
            self.run_signal_shell(task);
        }
        Ok(previous)
    }

    /// Take and clear the calling task's pending signals.
    pub fn receive_signals(&self) -> KernelResult<u32> {
        let mut state = self.enter();
        let task = state.current_task().ok_or(KernelError::InvalidObject(ObjectKind::Task))?;
        Ok(core::mem::take(&mut state.task_mut(task)?.signals.pending))
    }

    /// Make `signals` pending on `task` and arrange their delivery.
    pub fn send_signals(&self, task: TaskId, signals: u32) -> KernelResult<()> {
        let inline = {
            let mut state = self.enter();
            let current = state.current_task();
            let tcb = state.task_mut(task)?;
            tcb.signals.pending |= signals;
            if !tcb.signals.deliverable() || tcb.status.is_done() {
                false
            } else if current == Some(task) {
                true
            } else {
                if tcb.status.is_suspended() {
                    tcb.signals.saved_status = Some(tcb.status);
                    log::trace!("task {} readied for signal delivery", task);
                    state.make_ready(task);
                }
                state.tasks[task].signals.due = true;
                false
            }
        };
        if inline {
            self.run_signal_shell(task);
        }
        Ok(())
    }

    /// Run the handler for every deliverable batch of `task`'s signals.
    ///
    /// Returns `false` when the task went back into the suspension it was
    /// readied from, in which case it must not be polled.
    pub(crate) fn run_signal_shell(&self, task: TaskId) -> bool {
        {
            let mut state = self.enter();
            let Ok(tcb) = state.task_mut(task) else {
                return false;
            };
            if tcb.signals.active {
                return true;
            }
            tcb.signals.active = true;
        }

        loop {
            let (handler, delivered) = {
                let mut state = self.enter();
                let Some(tcb) = state.tasks.get_mut(task) else {
                    break;
                };
                let signals = &mut tcb.signals;
                let delivered = signals.pending & signals.enabled;
                match signals.handler {
                    Some(handler) if delivered != 0 => {
                        signals.pending &= !delivered;
                        (handler, delivered)
                    }
                    _ => break,
                }
            };
            log::trace!("delivering signals {:#x} to task {}", delivered, task);
            handler(delivered);
        }

        let mut state = self.enter();
        let Ok(tcb) = state.task_mut(task) else {
            return false;
        };
        tcb.signals.active = false;
        match tcb.signals.saved_status.take() {
            Some(saved) if saved != TaskStatus::Ready => {
                state.resuspend(task, saved);
                false
            }
            _ => true,
        }
    }
}
