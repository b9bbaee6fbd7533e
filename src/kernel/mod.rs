//! The kernel: one [`KernelState`](state::KernelState) behind the schedule
//! lock, plus the tick clock and configuration.
//!
//! ```ignore
//! use preemptive_kernel::{DefaultArch, Kernel, KernelConfig, Region, TaskBuilder};
//!
//! static KERNEL: Kernel<DefaultArch> = Kernel::new(KernelConfig::new());
//!
//! fn kernel_main(stack: &'static mut [u64]) {
//!     KERNEL
//!         .create_task(TaskBuilder::new().name("worker"), Region::from_words(stack), async {
//!             loop {
//!                 KERNEL.sleep(10).await.ok();
//!             }
//!         })
//!         .ok();
//!     loop {
//!         KERNEL.run_until_idle();
//!     }
//! }
//! ```

mod dispatch;
pub(crate) mod state;
mod task;

pub use state::ExecContext;
pub use task::Sleep;

use crate::arch::Arch;
use crate::config::KernelConfig;
use crate::errors::{FatalError, KernelError, KernelResult};
use crate::sched::lock::{ScheduleGuard, ScheduleLock, StateGuard};
use crate::thread::TaskId;
use crate::time::TickCounter;
use crate::wait::Request;
use state::KernelState;

pub(crate) type KernelGuard<'a, A> = StateGuard<'a, A, KernelState>;

/// Main kernel handle.
///
/// All services are methods on this type. A kernel is meant to live in a
/// `static` (or be leaked) so task entry futures can borrow it for
/// `'static`.
pub struct Kernel<A: Arch> {
    lock: ScheduleLock<A, KernelState>,
    clock: TickCounter,
    config: KernelConfig,
}

// Safety: the state is only reached through the schedule lock, which masks
// interrupts and serializes access.
unsafe impl<A: Arch> Send for Kernel<A> {}
unsafe impl<A: Arch> Sync for Kernel<A> {}

impl<A: Arch> Kernel<A> {
    pub const fn new(config: KernelConfig) -> Self {
        Self {
            lock: ScheduleLock::new(KernelState::new(A::fatal_error)),
            clock: TickCounter::new(),
            config,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Lock the kernel state and run the stack check for the current task.
    pub(crate) fn enter(&self) -> KernelGuard<'_, A> {
        let state = self.lock.lock();
        if self.config.check_stacks {
            if let Some(task) = state.current_task() {
                let corrupted = state
                    .tasks
                    .get(task)
                    .and_then(|tcb| tcb.frame.as_ref())
                    .map_or(false, |frame| !frame.canary_intact());
                if corrupted {
                    log::error!("stack canary of task {} overwritten", task);
                    drop(state);
                    A::fatal_error(FatalError::StackOverflow(task));
                }
            }
        }
        state
    }

    /// Run a request once without suspending.
    pub(crate) fn try_request<R: Request>(&self, mut request: R) -> KernelResult<R::Output> {
        request.validate()?;
        let mut state = self.enter();
        request.attempt(&mut state)?.ok_or(KernelError::NoResourceAvailable)
    }

    /// Enter the nestable critical section.
    ///
    /// Interrupts stay masked until the outermost guard is dropped, at which
    /// point a transfer to the dispatcher requested in between is issued
    /// through [`Arch::request_switch`].
    pub fn schedule_lock(&self) -> ScheduleGuard<'_, A> {
        self.lock.critical()
    }

    /// Whether a transfer to the dispatcher was requested since the last
    /// dispatch.
    pub fn preemption_pending(&self) -> bool {
        self.lock.nest().switch_pending()
    }

    /// Advance the tick clock: expire task timers and charge the executing
    /// task's time slice. Returns the new tick count.
    pub fn tick(&self) -> u64 {
        let now = self.clock.increment();
        self.enter().advance_clock(now);
        now
    }

    /// Ticks since the kernel was created.
    pub fn clock(&self) -> u64 {
        self.clock.ticks()
    }

    /// Run `f` as interrupt-level code. Nothing called from `f` can suspend.
    pub fn interrupt<R>(&self, f: impl FnOnce() -> R) -> R {
        let previous = core::mem::replace(&mut self.enter().context, ExecContext::Interrupt);
        let result = f();
        self.enter().context = previous;
        result
    }

    pub fn in_interrupt(&self) -> bool {
        self.enter().context == ExecContext::Interrupt
    }

    pub fn context(&self) -> ExecContext {
        self.enter().context
    }

    /// The task whose entry future is being polled.
    pub fn current_task(&self) -> Option<TaskId> {
        self.enter().current_task()
    }

    /// Check the current task's stack canary.
    ///
    /// Returns the headroom between the canary and the entry future, or
    /// `None` outside task context. A corrupted canary is fatal.
    pub fn check_stack(&self) -> Option<usize> {
        let state = self.lock.lock();
        let task = state.current_task()?;
        let frame = state.tasks.get(task)?.frame.as_ref()?;
        let (intact, headroom) = (frame.canary_intact(), frame.headroom());
        if !intact {
            log::error!("stack canary of task {} overwritten", task);
            drop(state);
            A::fatal_error(FatalError::StackOverflow(task));
        }
        Some(headroom)
    }
}

impl<A: Arch> Default for Kernel<A> {
    fn default() -> Self {
        Self::new(KernelConfig::new())
    }
}
