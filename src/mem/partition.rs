//! Partition pools: fixed-size blocks handed out in O(1).
//!
//! A pool region is cut into equal partitions, each preceded by a small
//! header. Available partitions form a singly linked list through the
//! headers' `next_available` word, in address order after creation. A
//! checked-out partition holds [`CHECKED_OUT`] there instead.

use super::region::{align_up, checked_align_up, Region, GRANULE};
use super::slab::SlabId;
use super::PartitionPoolId;
use crate::arch::Arch;
use crate::errors::{KernelError, KernelResult, ObjectKind, Parameter};
use crate::kernel::state::KernelState;
use crate::kernel::Kernel;
use crate::thread::builder::truncate_name;
use crate::thread::TaskStatus;
use crate::time::Suspend;
use crate::wait::{Request, SuspendPolicy, Wait, WaitList, WaitObject, WaitRequest, WaitTarget, WaitValue};
use alloc::string::String;
use alloc::vec::Vec;
use core::future::Future;
use core::ptr::{self, NonNull};

const END_OF_LIST: usize = 0;
const CHECKED_OUT: usize = 1;

#[repr(C)]
#[derive(Clone, Copy)]
struct PartitionHeader {
    next_available: usize,
    pool_index: u32,
    pool_tag: u32,
}

/// Bytes taken by a partition header, rounded to the allocation granule.
pub const OVERHEAD: usize = align_up(core::mem::size_of::<PartitionHeader>(), GRANULE);

/// Control block of a partition pool.
pub(crate) struct PartitionPool {
    pub(crate) name: String,
    id: PartitionPoolId,
    start: usize,
    size: usize,
    partition_size: usize,
    total: usize,
    allocated: usize,
    available_list: usize,
    waiters: WaitList,
}

/// Snapshot returned by [`Kernel::partition_pool_info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPoolInfo {
    pub name: String,
    pub start: usize,
    pub size: usize,
    pub partition_size: usize,
    pub total: usize,
    pub available: usize,
    pub allocated: usize,
    pub waiting: usize,
    pub policy: SuspendPolicy,
}

fn header(addr: usize) -> *mut PartitionHeader {
    addr as *mut PartitionHeader
}

impl PartitionPool {
    fn new(
        id: PartitionPoolId,
        name: String,
        region: &Region,
        partition_size: usize,
        total: usize,
        policy: SuspendPolicy,
    ) -> Self {
        let start = region.addr();
        let stride = partition_size + OVERHEAD;
        for n in 0..total {
            let addr = start + n * stride;
            let next = if n + 1 < total { addr + stride } else { END_OF_LIST };
            // Safety: every header slot lies inside the region, which the
            // pool owns exclusively, and is granule aligned.
            unsafe {
                ptr::write(
                    header(addr),
                    PartitionHeader {
                        next_available: next,
                        pool_index: id.index(),
                        pool_tag: id.tag(),
                    },
                );
            }
        }
        Self {
            name,
            id,
            start,
            size: region.len(),
            partition_size,
            total,
            allocated: 0,
            available_list: start,
            waiters: WaitList::new(policy),
        }
    }

    fn stride(&self) -> usize {
        self.partition_size + OVERHEAD
    }

    fn read(&self, addr: usize) -> PartitionHeader {
        // Safety: callers only pass header addresses of this pool.
        unsafe { ptr::read(header(addr)) }
    }

    fn set_next(&self, addr: usize, next: usize) {
        // Safety: as for `read`.
        unsafe { (*header(addr)).next_available = next };
    }

    pub(crate) fn allocate(&mut self) -> Option<NonNull<u8>> {
        let addr = self.available_list;
        if addr == END_OF_LIST {
            return None;
        }
        self.available_list = self.read(addr).next_available;
        self.set_next(addr, CHECKED_OUT);
        self.allocated += 1;
        NonNull::new((addr + OVERHEAD) as *mut u8)
    }

    pub(crate) fn owns(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        addr >= self.start + OVERHEAD && addr < self.start + self.total * self.stride()
    }

    /// Header address of the checked-out partition at `ptr`.
    fn checked_out(&self, ptr: NonNull<u8>) -> Option<usize> {
        if !self.owns(ptr) {
            return None;
        }
        let addr = ptr.as_ptr() as usize - OVERHEAD;
        if (addr - self.start) % self.stride() != 0 {
            return None;
        }
        let header = self.read(addr);
        let matches = header.next_available == CHECKED_OUT
            && header.pool_index == self.id.index()
            && header.pool_tag == self.id.tag();
        matches.then_some(addr)
    }

    fn release(&mut self, addr: usize) {
        self.set_next(addr, self.available_list);
        self.available_list = addr;
        self.allocated -= 1;
    }

    pub(crate) fn available(&self) -> usize {
        self.total - self.allocated
    }

    fn info(&self) -> PartitionPoolInfo {
        PartitionPoolInfo {
            name: self.name.clone(),
            start: self.start,
            size: self.size,
            partition_size: self.partition_size,
            total: self.total,
            available: self.available(),
            allocated: self.allocated,
            waiting: self.waiters.waiting(),
            policy: self.waiters.policy(),
        }
    }
}

impl WaitTarget for PartitionPool {
    fn waiters(&mut self) -> &mut WaitList {
        &mut self.waiters
    }
}

pub(crate) struct PartitionRequest {
    pool: PartitionPoolId,
}

impl Request for PartitionRequest {
    type Output = NonNull<u8>;

    const STATUS: TaskStatus = TaskStatus::PartitionSuspend;

    fn object(&self) -> WaitObject {
        WaitObject::PartitionPool(self.pool)
    }

    fn wait_request(&self) -> WaitRequest {
        WaitRequest::Partition
    }

    fn attempt(&mut self, state: &mut KernelState) -> KernelResult<Option<NonNull<u8>>> {
        let pool = state
            .partition_pools
            .get_mut(self.pool)
            .ok_or(KernelError::InvalidObject(ObjectKind::PartitionPool))?;
        Ok(pool.allocate())
    }

    fn output(value: WaitValue) -> KernelResult<NonNull<u8>> {
        match value {
            WaitValue::Pointer(ptr) => Ok(ptr),
            _ => Err(KernelError::InvalidSuspend),
        }
    }
}

impl KernelState {
    fn partition_pool_of(&self, ptr: NonNull<u8>) -> Option<PartitionPoolId> {
        self.created_partition_pools
            .iter()
            .copied()
            .find(|&id| self.partition_pools.get(id).map_or(false, |pool| pool.owns(ptr)))
    }
}

impl<A: Arch> Kernel<A> {
    /// Create a partition pool cutting `region` into partitions of
    /// `partition_size` bytes (rounded up to [`GRANULE`]).
    pub fn create_partition_pool(
        &self,
        name: &str,
        region: Region,
        partition_size: usize,
        policy: SuspendPolicy,
    ) -> KernelResult<PartitionPoolId> {
        if !region.is_aligned(GRANULE) {
            return Err(KernelError::NotAligned);
        }
        let stride = checked_align_up(partition_size, GRANULE)
            .filter(|&size| size != 0)
            .and_then(|size| size.checked_add(OVERHEAD))
            .ok_or(Parameter::Size)?;
        let partition_size = stride - OVERHEAD;
        let total = region.len() / stride;
        if total == 0 {
            return Err(Parameter::Size.into());
        }
        let name = truncate_name(name);

        let mut state = self.enter();
        let id = state
            .partition_pools
            .insert_with(|id| PartitionPool::new(id, name, &region, partition_size, total, policy));
        state.created_partition_pools.push(id);
        log::debug!("created partition pool {} ({} x {} bytes)", id, total, partition_size);
        Ok(id)
    }

    /// Delete a pool, resuming every waiter with [`KernelError::ObjectDeleted`].
    pub fn delete_partition_pool(&self, pool: PartitionPoolId) -> KernelResult<()> {
        let mut state = self.enter();
        let removed = state
            .partition_pools
            .remove(pool)
            .ok_or(KernelError::InvalidObject(ObjectKind::PartitionPool))?;
        state.created_partition_pools.retain(|&id| id != pool);
        state.release_waiters(removed.waiters, Err(KernelError::ObjectDeleted));
        log::debug!("deleted partition pool {}", pool);
        Ok(())
    }

    pub fn allocate_partition(
        &self,
        pool: PartitionPoolId,
        suspend: Suspend,
    ) -> impl Future<Output = KernelResult<NonNull<u8>>> + '_ {
        Wait::new(self, PartitionRequest { pool }, suspend)
    }

    /// Allocate without suspending. Usable from any context.
    pub fn try_allocate_partition(&self, pool: PartitionPoolId) -> KernelResult<NonNull<u8>> {
        self.try_request(PartitionRequest { pool })
    }

    /// Return a partition. The first waiting task, if any, receives it
    /// directly; otherwise it goes back on the available list.
    pub fn deallocate_partition(&self, ptr: NonNull<u8>) -> KernelResult<()> {
        let mut state = self.enter();
        let Some(id) = state.partition_pool_of(ptr) else {
            log::warn!("deallocation of {:p} outside every partition pool", ptr);
            return Err(Parameter::Pointer.into());
        };
        let Some(addr) = state.partition_pools[id].checked_out(ptr) else {
            log::warn!("partition pool {} rejected deallocation of {:p}", id, ptr);
            return Err(Parameter::Pointer.into());
        };
        if state
            .settle_first(WaitObject::PartitionPool(id), Ok(WaitValue::Pointer(ptr)))
            .is_none()
        {
            state.partition_pools[id].release(addr);
        }
        Ok(())
    }

    pub fn partition_pool_info(&self, pool: PartitionPoolId) -> KernelResult<PartitionPoolInfo> {
        self.enter()
            .partition_pools
            .get(pool)
            .map(PartitionPool::info)
            .ok_or(KernelError::InvalidObject(ObjectKind::PartitionPool))
    }

    pub fn created_partition_pools(&self) -> Vec<PartitionPoolId> {
        self.enter().created_partition_pools.clone()
    }
}
