//! The schedule lock.
//!
//! Two layers make up the lock:
//!
//! - a nestable critical section: the outermost entry masks interrupts and
//!   remembers whether they were enabled, inner entries only bump a depth
//!   counter;
//! - the kernel state mutex, taken inside the critical section by every
//!   service for the duration of its list and bitmap updates.
//!
//! Context transfers requested while the lock is held are deferred until the
//! outermost critical section ends, then handed to [`Arch::request_switch`].

use crate::arch::Arch;
use crate::errors::FatalError;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};

/// State that can ask for a context transfer while locked.
pub(crate) trait SwitchRequests {
    /// Return and clear the pending transfer request.
    fn take_switch_request(&mut self) -> bool;
}

/// Interrupt-masking nesting counter.
pub(crate) struct CriticalNest<A: Arch> {
    depth: AtomicUsize,
    restore_interrupts: AtomicBool,
    switch_pending: AtomicBool,
    switch_requested: AtomicBool,
    _arch: PhantomData<fn() -> A>,
}

impl<A: Arch> CriticalNest<A> {
    pub(crate) const fn new() -> Self {
        Self {
            depth: AtomicUsize::new(0),
            restore_interrupts: AtomicBool::new(false),
            switch_pending: AtomicBool::new(false),
            switch_requested: AtomicBool::new(false),
            _arch: PhantomData,
        }
    }

    fn enter(&self) {
        let enabled = A::interrupts_enabled();
        A::disable_interrupts();
        if self.depth.fetch_add(1, Ordering::AcqRel) == 0 {
            self.restore_interrupts.store(enabled, Ordering::Release);
        }
    }

    fn exit(&self) {
        if self.depth.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if self.restore_interrupts.load(Ordering::Acquire) {
            A::enable_interrupts();
        }
        if self.switch_requested.swap(false, Ordering::AcqRel) {
            A::request_switch();
        }
    }

    fn control_to_system(&self) {
        self.switch_pending.store(true, Ordering::Release);
        self.switch_requested.store(true, Ordering::Release);
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    /// Whether a transfer was requested since the dispatcher last cleared it.
    pub(crate) fn switch_pending(&self) -> bool {
        self.switch_pending.load(Ordering::Acquire)
    }

    pub(crate) fn clear_switch_pending(&self) {
        self.switch_pending.store(false, Ordering::Release);
    }
}

/// The schedule lock around a piece of kernel state.
pub(crate) struct ScheduleLock<A: Arch, T> {
    nest: CriticalNest<A>,
    state: spin::Mutex<T>,
}

impl<A: Arch, T: SwitchRequests> ScheduleLock<A, T> {
    pub(crate) const fn new(state: T) -> Self {
        Self {
            nest: CriticalNest::new(),
            state: spin::Mutex::new(state),
        }
    }

    pub(crate) fn nest(&self) -> &CriticalNest<A> {
        &self.nest
    }

    /// Enter the critical section without touching the state.
    pub(crate) fn critical(&self) -> ScheduleGuard<'_, A> {
        self.nest.enter();
        ScheduleGuard { nest: &self.nest }
    }

    /// Enter the critical section and lock the state.
    ///
    /// The state is never locked across user code, so finding it held means
    /// a service was re-entered from inside the lock.
    pub(crate) fn lock(&self) -> StateGuard<'_, A, T> {
        self.nest.enter();
        match self.state.try_lock() {
            Some(guard) => StateGuard {
                guard: Some(guard),
                nest: &self.nest,
            },
            None => {
                self.nest.exit();
                A::fatal_error(FatalError::LockReentered)
            }
        }
    }
}

/// Guard returned by [`Kernel::schedule_lock`](crate::Kernel::schedule_lock).
///
/// Guards nest freely. Interrupts are restored and any requested transfer is
/// issued when the outermost guard is dropped.
pub struct ScheduleGuard<'a, A: Arch> {
    nest: &'a CriticalNest<A>,
}

impl<A: Arch> ScheduleGuard<'_, A> {
    /// Request a transfer to the dispatcher once the lock is fully released.
    pub fn control_to_system(&self) {
        self.nest.control_to_system();
    }

    /// Current nesting depth, counting this guard.
    pub fn depth(&self) -> usize {
        self.nest.depth()
    }
}

impl<A: Arch> Drop for ScheduleGuard<'_, A> {
    fn drop(&mut self) {
        self.nest.exit();
    }
}

/// Locked kernel state.
pub(crate) struct StateGuard<'a, A: Arch, T: SwitchRequests> {
    guard: Option<spin::MutexGuard<'a, T>>,
    nest: &'a CriticalNest<A>,
}

impl<A: Arch, T: SwitchRequests> Deref for StateGuard<'_, A, T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.guard {
            Some(guard) => guard,
            None => unreachable!("state guard used after release"),
        }
    }
}

impl<A: Arch, T: SwitchRequests> DerefMut for StateGuard<'_, A, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.guard {
            Some(guard) => guard,
            None => unreachable!("state guard used after release"),
        }
    }
}

impl<A: Arch, T: SwitchRequests> Drop for StateGuard<'_, A, T> {
    fn drop(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            if guard.take_switch_request() {
                self.nest.control_to_system();
            }
            drop(guard);
        }
        self.nest.exit();
    }
}
