//! Counting semaphores.

use super::SemaphoreId;
use crate::arch::Arch;
use crate::errors::{KernelError, KernelResult, ObjectKind};
use crate::kernel::state::KernelState;
use crate::kernel::Kernel;
use crate::thread::builder::truncate_name;
use crate::thread::TaskStatus;
use crate::time::Suspend;
use crate::wait::{Request, SuspendPolicy, Wait, WaitList, WaitObject, WaitRequest, WaitTarget, WaitValue};
use alloc::string::String;
use alloc::vec::Vec;
use core::future::Future;

/// Snapshot returned by [`Kernel::semaphore_info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemaphoreInfo {
    pub name: String,
    pub count: u32,
    pub waiting: usize,
    pub policy: SuspendPolicy,
}

pub(crate) struct Semaphore {
    name: String,
    count: u32,
    waiters: WaitList,
}

impl WaitTarget for Semaphore {
    fn waiters(&mut self) -> &mut WaitList {
        &mut self.waiters
    }
}

struct Obtain {
    semaphore: SemaphoreId,
}

impl Request for Obtain {
    type Output = ();

    const STATUS: TaskStatus = TaskStatus::SemaphoreSuspend;

    fn object(&self) -> WaitObject {
        WaitObject::Semaphore(self.semaphore)
    }

    fn wait_request(&self) -> WaitRequest {
        WaitRequest::Semaphore
    }

    fn attempt(&mut self, state: &mut KernelState) -> KernelResult<Option<()>> {
        let semaphore = state
            .semaphores
            .get_mut(self.semaphore)
            .ok_or(KernelError::InvalidObject(ObjectKind::Semaphore))?;
        if semaphore.count == 0 {
            return Ok(None);
        }
        semaphore.count -= 1;
        Ok(Some(()))
    }

    fn output(_value: WaitValue) -> KernelResult<()> {
        Ok(())
    }
}

impl<A: Arch> Kernel<A> {
    pub fn create_semaphore(&self, name: &str, initial: u32, policy: SuspendPolicy) -> KernelResult<SemaphoreId> {
        let name = truncate_name(name);
        let mut state = self.enter();
        let id = state.semaphores.insert_with(|_| Semaphore {
            name,
            count: initial,
            waiters: WaitList::new(policy),
        });
        state.created_semaphores.push(id);
        log::debug!("created semaphore {} (count {})", id, initial);
        Ok(id)
    }

    /// Delete a semaphore, resuming every waiter with
    /// [`KernelError::ObjectDeleted`].
    pub fn delete_semaphore(&self, semaphore: SemaphoreId) -> KernelResult<()> {
        let mut state = self.enter();
        let removed = state
            .semaphores
            .remove(semaphore)
            .ok_or(KernelError::InvalidObject(ObjectKind::Semaphore))?;
        state.created_semaphores.retain(|&id| id != semaphore);
        state.release_waiters(removed.waiters, Err(KernelError::ObjectDeleted));
        log::debug!("deleted semaphore {}", semaphore);
        Ok(())
    }

    /// Take one token, suspending per `suspend` while the count is zero.
    pub fn obtain_semaphore(
        &self,
        semaphore: SemaphoreId,
        suspend: Suspend,
    ) -> impl Future<Output = KernelResult<()>> + '_ {
        Wait::new(self, Obtain { semaphore }, suspend)
    }

    pub fn try_obtain_semaphore(&self, semaphore: SemaphoreId) -> KernelResult<()> {
        self.try_request(Obtain { semaphore })
    }

    /// Give one token to the first waiter, or add it to the count.
    pub fn release_semaphore(&self, semaphore: SemaphoreId) -> KernelResult<()> {
        let mut state = self.enter();
        if !state.semaphores.contains(semaphore) {
            return Err(KernelError::InvalidObject(ObjectKind::Semaphore));
        }
        if state
            .settle_first(WaitObject::Semaphore(semaphore), Ok(WaitValue::None))
            .is_none()
        {
            let target = &mut state.semaphores[semaphore];
            target.count = target.count.saturating_add(1);
        }
        Ok(())
    }

    pub fn semaphore_count(&self, semaphore: SemaphoreId) -> KernelResult<u32> {
        self.enter()
            .semaphores
            .get(semaphore)
            .map(|target| target.count)
            .ok_or(KernelError::InvalidObject(ObjectKind::Semaphore))
    }

    /// Number of tasks suspended on the semaphore.
    pub fn semaphore_waiting(&self, semaphore: SemaphoreId) -> KernelResult<usize> {
        self.enter()
            .semaphores
            .get(semaphore)
            .map(|target| target.waiters.waiting())
            .ok_or(KernelError::InvalidObject(ObjectKind::Semaphore))
    }

    pub fn semaphore_info(&self, semaphore: SemaphoreId) -> KernelResult<SemaphoreInfo> {
        self.enter()
            .semaphores
            .get(semaphore)
            .map(|target| SemaphoreInfo {
                name: target.name.clone(),
                count: target.count,
                waiting: target.waiters.waiting(),
                policy: target.waiters.policy(),
            })
            .ok_or(KernelError::InvalidObject(ObjectKind::Semaphore))
    }

    pub fn created_semaphores(&self) -> Vec<SemaphoreId> {
        self.enter().created_semaphores.clone()
    }
}
