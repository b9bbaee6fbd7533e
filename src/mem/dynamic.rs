//! Dynamic memory pools: variable-size first-fit allocation with boundary
//! coalescing.
//!
//! Every region handed to a pool is carved into physically contiguous blocks,
//! each preceded by a [`BlockHeader`]. The last [`OVERHEAD`] bytes of a region
//! hold a zero-size sentinel header that is permanently marked allocated and
//! links back to the first block of the region, so the physical walk wraps
//! and coalescing never crosses a region boundary. Free blocks are also
//! threaded on a circular free ring whose head is where the first-fit search
//! starts.
//!
//! Headers are only ever reached through [`Block`], which is built from
//! addresses inside regions the pool owns.

use super::region::{align_up, checked_align_up, Region, GRANULE};
use super::slab::SlabId;
use super::MemoryPoolId;
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

const FREE: usize = 0x4652_4545;
const ALLOCATED: usize = 0x414C_4C4F;
/// Marker left in a header that was merged into its neighbour.
const MERGED: usize = 0;

#[repr(C)]
#[derive(Clone, Copy)]
struct BlockHeader {
    pool_index: u32,
    pool_tag: u32,
    next_memory: Option<Block>,
    previous_memory: Option<Block>,
    state: usize,
    next_free: Option<Block>,
    previous_free: Option<Block>,
}

/// Bytes taken by a block header, rounded to the allocation granule.
pub const OVERHEAD: usize = align_up(core::mem::size_of::<BlockHeader>(), GRANULE);

/// A block header inside pooled memory.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
struct Block(NonNull<BlockHeader>);

impl Block {
    fn at(addr: usize) -> Option<Self> {
        NonNull::new(addr as *mut BlockHeader).map(Block)
    }

    fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    fn read(self) -> BlockHeader {
        // Safety: blocks are only built for granule-aligned header slots of
        // regions owned by a live pool.
        unsafe { ptr::read(self.0.as_ptr()) }
    }

    fn update(self, f: impl FnOnce(&mut BlockHeader)) {
        // Safety: as for `read`; the reference does not outlive the call.
        unsafe { f(&mut *self.0.as_ptr()) }
    }

    fn next_memory(self) -> Block {
        self.read().next_memory.unwrap_or(self)
    }

    fn previous_memory(self) -> Block {
        self.read().previous_memory.unwrap_or(self)
    }

    fn is_free(self) -> bool {
        self.read().state == FREE
    }

    /// Bytes between the end of this header and the next header.
    fn usable(self) -> usize {
        self.next_memory().addr().saturating_sub(self.addr() + OVERHEAD)
    }

    fn data(self) -> Option<NonNull<u8>> {
        NonNull::new((self.addr() + OVERHEAD) as *mut u8)
    }
}

#[derive(Debug, Clone, Copy)]
struct Span {
    start: usize,
    len: usize,
}

impl Span {
    fn sentinel(&self) -> usize {
        self.start + self.len - OVERHEAD
    }
}

/// Control block of a dynamic memory pool.
pub(crate) struct DynamicPool {
    pub(crate) name: String,
    id: MemoryPoolId,
    regions: Vec<Span>,
    size: usize,
    min_allocation: usize,
    available: usize,
    free_list: Option<Block>,
    waiters: WaitList,
}

/// Snapshot returned by [`Kernel::memory_pool_info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryPoolInfo {
    pub name: String,
    pub start: usize,
    /// Total bytes of every region, headers and sentinels included.
    pub size: usize,
    pub min_allocation: usize,
    /// Usable bytes of all free blocks.
    pub available: usize,
    pub free_blocks: usize,
    pub regions: usize,
    pub waiting: usize,
    pub policy: SuspendPolicy,
}

/// Check a region and round its size down to the granule.
fn region_len(region: &Region, min_allocation: usize) -> KernelResult<usize> {
    if !region.is_aligned(GRANULE) {
        return Err(KernelError::NotAligned);
    }
    let len = region.len() & !(GRANULE - 1);
    let needed = min_allocation.checked_add(2 * OVERHEAD);
    if min_allocation == 0 || needed.map_or(true, |needed| needed > len) {
        return Err(Parameter::Size.into());
    }
    Ok(len)
}

/// Alignments below the granule are met by every block. Invalid values are
/// passed through for the request to reject.
fn request_alignment(alignment: usize) -> usize {
    if alignment.is_power_of_two() {
        alignment.max(GRANULE)
    } else {
        alignment
    }
}

impl DynamicPool {
    fn new(id: MemoryPoolId, name: String, region: &Region, len: usize, min_allocation: usize, policy: SuspendPolicy) -> Self {
        let mut pool = Self {
            name,
            id,
            regions: Vec::new(),
            size: 0,
            min_allocation,
            available: 0,
            free_list: None,
            waiters: WaitList::new(policy),
        };
        pool.format(region, len);
        pool
    }

    /// Lay out one free block and the trailing sentinel over a region and
    /// splice the block into the free ring.
    fn format(&mut self, region: &Region, len: usize) {
        let span = Span {
            start: region.addr(),
            len,
        };
        let (Some(first), Some(sentinel)) = (Block::at(span.start), Block::at(span.sentinel())) else {
            return;
        };
        let header = BlockHeader {
            pool_index: self.id.index(),
            pool_tag: self.id.tag(),
            next_memory: Some(sentinel),
            previous_memory: Some(sentinel),
            state: FREE,
            next_free: None,
            previous_free: None,
        };
        // Safety: the region is exclusively ours and both slots are aligned
        // header positions inside it.
        unsafe {
            ptr::write(first.0.as_ptr(), header);
            ptr::write(
                sentinel.0.as_ptr(),
                BlockHeader {
                    next_memory: Some(first),
                    previous_memory: Some(first),
                    state: ALLOCATED,
                    ..header
                },
            );
        }
        self.regions.push(span);
        self.size += len;
        self.available += len - 2 * OVERHEAD;
        self.ring_push_tail(first);
    }

    pub(crate) fn available(&self) -> usize {
        self.available
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Validate a requested size and round it to what is actually carved.
    fn request_size(&self, size: usize) -> KernelResult<usize> {
        if size == 0 || size > self.size.saturating_sub(2 * OVERHEAD) {
            return Err(Parameter::Size.into());
        }
        Ok(if size < self.min_allocation {
            self.min_allocation
        } else {
            align_up(size, GRANULE)
        })
    }

    fn ring_push_tail(&mut self, block: Block) {
        match self.free_list {
            None => {
                block.update(|h| {
                    h.next_free = Some(block);
                    h.previous_free = Some(block);
                });
                self.free_list = Some(block);
            }
            Some(head) => {
                let tail = head.read().previous_free.unwrap_or(head);
                block.update(|h| {
                    h.next_free = Some(head);
                    h.previous_free = Some(tail);
                });
                tail.update(|h| h.next_free = Some(block));
                head.update(|h| h.previous_free = Some(block));
            }
        }
    }

    fn ring_push_head(&mut self, block: Block) {
        self.ring_push_tail(block);
        self.free_list = Some(block);
    }

    fn ring_insert_after(&mut self, anchor: Block, block: Block) {
        let next = anchor.read().next_free.unwrap_or(anchor);
        block.update(|h| {
            h.next_free = Some(next);
            h.previous_free = Some(anchor);
        });
        anchor.update(|h| h.next_free = Some(block));
        next.update(|h| h.previous_free = Some(block));
    }

    fn ring_remove(&mut self, block: Block) {
        let header = block.read();
        let next = header.next_free.unwrap_or(block);
        let prev = header.previous_free.unwrap_or(block);
        block.update(|h| {
            h.next_free = None;
            h.previous_free = None;
        });
        if next == block {
            self.free_list = None;
            return;
        }
        prev.update(|h| h.next_free = Some(next));
        next.update(|h| h.previous_free = Some(prev));
        if self.free_list == Some(block) {
            self.free_list = Some(next);
        }
    }

    /// Put `replacement` at `block`'s position in the free ring.
    fn ring_replace(&mut self, block: Block, replacement: Block) {
        let header = block.read();
        if header.next_free == Some(block) {
            replacement.update(|h| {
                h.next_free = Some(replacement);
                h.previous_free = Some(replacement);
            });
        } else {
            let next = header.next_free.unwrap_or(block);
            let prev = header.previous_free.unwrap_or(block);
            replacement.update(|h| {
                h.next_free = Some(next);
                h.previous_free = Some(prev);
            });
            prev.update(|h| h.next_free = Some(replacement));
            next.update(|h| h.previous_free = Some(replacement));
        }
        block.update(|h| {
            h.next_free = None;
            h.previous_free = None;
        });
        if self.free_list == Some(block) {
            self.free_list = Some(replacement);
        }
    }

    /// Create a free header at `at` inside `block`, taking the tail of it.
    fn split(&mut self, block: Block, at: usize) -> Option<Block> {
        let rest = Block::at(at)?;
        let next = block.next_memory();
        let header = BlockHeader {
            pool_index: self.id.index(),
            pool_tag: self.id.tag(),
            next_memory: Some(next),
            previous_memory: Some(block),
            state: FREE,
            next_free: None,
            previous_free: None,
        };
        // Safety: `at` is a granule-aligned address strictly inside `block`
        // with room for a header before the next block.
        unsafe { ptr::write(rest.0.as_ptr(), header) };
        next.update(|h| h.previous_memory = Some(rest));
        block.update(|h| h.next_memory = Some(rest));
        Some(rest)
    }

    /// First fit over the free ring. `size` is already rounded.
    pub(crate) fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let head = self.free_list?;
        let mut cursor = head;
        loop {
            let next = cursor.read().next_free.unwrap_or(head);
            if let Some(data) = self.carve(cursor, size, align) {
                return Some(data);
            }
            if next == head {
                return None;
            }
            cursor = next;
        }
    }

    fn carve(&mut self, block: Block, size: usize, align: usize) -> Option<NonNull<u8>> {
        let end = block.next_memory().addr();
        let mut target = block;
        let mut in_ring = true;

        if (block.addr() + OVERHEAD) % align != 0 {
            // The front fragment stays a free block of at least the minimum.
            let data = checked_align_up(block.addr() + 2 * OVERHEAD + self.min_allocation, align)?;
            if data.checked_add(size)? > end {
                return None;
            }
            target = self.split(block, data - OVERHEAD)?;
            self.available -= OVERHEAD;
            in_ring = false;
        } else if block.addr() + OVERHEAD + size > end {
            return None;
        }

        let usable = target.usable();
        if usable >= size + OVERHEAD + self.min_allocation {
            let rest = self.split(target, target.addr() + OVERHEAD + size)?;
            self.available -= size + OVERHEAD;
            if in_ring {
                self.ring_replace(target, rest);
            } else {
                self.ring_insert_after(block, rest);
            }
        } else {
            self.available -= usable;
            if in_ring {
                self.ring_remove(target);
            }
        }
        target.update(|h| h.state = ALLOCATED);
        target.data()
    }

    fn span_of(&self, addr: usize) -> Option<&Span> {
        self.regions.iter().find(|span| addr >= span.start && addr < span.sentinel())
    }

    /// Whether `ptr` could be a block of this pool.
    pub(crate) fn owns(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        addr.checked_sub(OVERHEAD).map_or(false, |header| self.span_of(header).is_some())
    }

    /// Find the allocated block whose data starts at `ptr`.
    fn lookup(&self, ptr: NonNull<u8>) -> Option<Block> {
        let addr = ptr.as_ptr() as usize;
        if addr % GRANULE != 0 {
            return None;
        }
        let header_addr = addr.checked_sub(OVERHEAD)?;
        let span = self.span_of(header_addr)?;
        let block = Block::at(header_addr)?;
        let header = block.read();
        if header.state != ALLOCATED || header.pool_index != self.id.index() || header.pool_tag != self.id.tag() {
            return None;
        }
        let next = header.next_memory?;
        if next.addr() <= addr || next.addr() > span.sentinel() || next.read().previous_memory != Some(block) {
            return None;
        }
        Some(block)
    }

    /// Usable bytes of the allocated block at `ptr`.
    pub(crate) fn allocation_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.lookup(ptr).map(Block::usable)
    }

    /// Return the block at `ptr` to the pool, merging it with free
    /// physical neighbours.
    pub(crate) fn deallocate(&mut self, ptr: NonNull<u8>) -> KernelResult<()> {
        let block = self.lookup(ptr).ok_or(KernelError::InvalidParameter(Parameter::Pointer))?;
        self.available += block.usable();

        let next = block.next_memory();
        if next.is_free() {
            self.ring_remove(next);
            let after = next.next_memory();
            block.update(|h| h.next_memory = Some(after));
            after.update(|h| h.previous_memory = Some(block));
            next.update(|h| h.state = MERGED);
            self.available += OVERHEAD;
        }

        let previous = block.previous_memory();
        if previous.is_free() {
            let after = block.next_memory();
            previous.update(|h| h.next_memory = Some(after));
            after.update(|h| h.previous_memory = Some(previous));
            block.update(|h| h.state = MERGED);
            self.available += OVERHEAD;
        } else {
            block.update(|h| h.state = FREE);
            self.ring_push_head(block);
        }
        Ok(())
    }

    pub(crate) fn add_region(&mut self, region: &Region) -> KernelResult<()> {
        let len = region_len(region, self.min_allocation)?;
        self.format(region, len);
        Ok(())
    }

    pub(crate) fn free_blocks(&self) -> usize {
        let Some(head) = self.free_list else {
            return 0;
        };
        let mut count = 1;
        let mut cursor = head.read().next_free.unwrap_or(head);
        while cursor != head {
            count += 1;
            cursor = cursor.read().next_free.unwrap_or(head);
        }
        count
    }

    /// Walk every region physically and tally block usage.
    #[cfg(test)]
    pub(crate) fn audit(&self) -> PoolAudit {
        let mut audit = PoolAudit {
            regions: self.regions.len(),
            ..PoolAudit::default()
        };
        for span in &self.regions {
            let mut cursor = Block::at(span.start);
            while let Some(block) = cursor.filter(|block| block.addr() != span.sentinel()) {
                if block.is_free() {
                    audit.free_blocks += 1;
                    audit.free_bytes += block.usable();
                } else {
                    audit.allocated_blocks += 1;
                    audit.allocated_bytes += block.usable();
                }
                cursor = Some(block.next_memory());
            }
        }
        audit
    }

    fn info(&self) -> MemoryPoolInfo {
        MemoryPoolInfo {
            name: self.name.clone(),
            start: self.regions.first().map_or(0, |span| span.start),
            size: self.size(),
            min_allocation: self.min_allocation,
            available: self.available(),
            free_blocks: self.free_blocks(),
            regions: self.regions.len(),
            waiting: self.waiters.waiting(),
            policy: self.waiters.policy(),
        }
    }
}

/// Physical tally of a pool's blocks.
#[cfg(test)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolAudit {
    pub(crate) regions: usize,
    pub(crate) free_blocks: usize,
    pub(crate) free_bytes: usize,
    pub(crate) allocated_blocks: usize,
    pub(crate) allocated_bytes: usize,
}

impl WaitTarget for DynamicPool {
    fn waiters(&mut self) -> &mut WaitList {
        &mut self.waiters
    }
}

/// A request for `size` bytes aligned to `align`.
pub(crate) struct MemoryRequest {
    pool: MemoryPoolId,
    size: usize,
    align: usize,
}

impl Request for MemoryRequest {
    type Output = NonNull<u8>;

    const STATUS: TaskStatus = TaskStatus::MemorySuspend;

    fn object(&self) -> WaitObject {
        WaitObject::MemoryPool(self.pool)
    }

    fn wait_request(&self) -> WaitRequest {
        WaitRequest::Memory {
            size: self.size,
            align: self.align,
        }
    }

    fn validate(&self) -> KernelResult<()> {
        if self.size == 0 {
            return Err(Parameter::Size.into());
        }
        if !self.align.is_power_of_two() {
            return Err(Parameter::Alignment.into());
        }
        Ok(())
    }

    fn attempt(&mut self, state: &mut KernelState) -> KernelResult<Option<NonNull<u8>>> {
        let pool = state
            .memory_pools
            .get_mut(self.pool)
            .ok_or(KernelError::InvalidObject(ObjectKind::MemoryPool))?;
        self.size = pool.request_size(self.size)?;
        Ok(pool.allocate(self.size, self.align))
    }

    fn output(value: WaitValue) -> KernelResult<NonNull<u8>> {
        match value {
            WaitValue::Pointer(ptr) => Ok(ptr),
            _ => Err(KernelError::InvalidSuspend),
        }
    }
}

impl KernelState {
    fn memory_pool_of(&self, ptr: NonNull<u8>) -> Option<MemoryPoolId> {
        self.created_memory_pools
            .iter()
            .copied()
            .find(|&id| self.memory_pools.get(id).map_or(false, |pool| pool.owns(ptr)))
    }

    /// Serve waiters in list order until one does not fit.
    fn serve_memory_waiters(&mut self, id: MemoryPoolId) {
        loop {
            let Some(pool) = self.memory_pools.get_mut(id) else {
                return;
            };
            let Some(block) = pool.waiters.head() else {
                return;
            };
            let WaitRequest::Memory { size, align } = self.blocks[block].request else {
                return;
            };
            let Some(ptr) = pool.allocate(size, align) else {
                return;
            };
            pool.waiters.unlink(&mut self.blocks, block);
            log::trace!("memory pool {} served a waiter with {} bytes", id, size);
            self.settle(block, Ok(WaitValue::Pointer(ptr)));
        }
    }

    pub(crate) fn deallocate_memory(&mut self, ptr: NonNull<u8>) -> KernelResult<()> {
        let Some(id) = self.memory_pool_of(ptr) else {
            log::warn!("deallocation of {:p} outside every memory pool", ptr);
            return Err(Parameter::Pointer.into());
        };
        if let Err(err) = self.memory_pools[id].deallocate(ptr) {
            log::warn!("memory pool {} rejected deallocation of {:p}", id, ptr);
            return Err(err);
        }
        self.serve_memory_waiters(id);
        Ok(())
    }
}

impl<A: Arch> Kernel<A> {
    /// Create a dynamic memory pool over `region`.
    ///
    /// `min_allocation` is rounded up to [`GRANULE`]. The region start must
    /// be granule aligned and its length is rounded down to the granule.
    pub fn create_memory_pool(
        &self,
        name: &str,
        region: Region,
        min_allocation: usize,
        policy: SuspendPolicy,
    ) -> KernelResult<MemoryPoolId> {
        let min_allocation = checked_align_up(min_allocation, GRANULE).ok_or(Parameter::Size)?;
        let len = region_len(&region, min_allocation)?;
        let name = truncate_name(name);

        let mut state = self.enter();
        let id = state
            .memory_pools
            .insert_with(|id| DynamicPool::new(id, name, &region, len, min_allocation, policy));
        state.created_memory_pools.push(id);
        log::debug!("created memory pool {} ({} bytes)", id, len);
        Ok(id)
    }

    /// Delete a pool, resuming every waiter with [`KernelError::ObjectDeleted`].
    /// The pool's memory is not touched.
    pub fn delete_memory_pool(&self, pool: MemoryPoolId) -> KernelResult<()> {
        let mut state = self.enter();
        let removed = state
            .memory_pools
            .remove(pool)
            .ok_or(KernelError::InvalidObject(ObjectKind::MemoryPool))?;
        state.created_memory_pools.retain(|&id| id != pool);
        state.release_waiters(removed.waiters, Err(KernelError::ObjectDeleted));
        log::debug!("deleted memory pool {}", pool);
        Ok(())
    }

    /// Allocate `size` bytes, suspending per `suspend` when the pool is
    /// exhausted.
    pub fn allocate_memory(
        &self,
        pool: MemoryPoolId,
        size: usize,
        suspend: Suspend,
    ) -> impl Future<Output = KernelResult<NonNull<u8>>> + '_ {
        self.allocate_aligned_memory(pool, size, GRANULE, suspend)
    }

    /// Allocate `size` bytes whose address is a multiple of `alignment`.
    pub fn allocate_aligned_memory(
        &self,
        pool: MemoryPoolId,
        size: usize,
        alignment: usize,
        suspend: Suspend,
    ) -> impl Future<Output = KernelResult<NonNull<u8>>> + '_ {
        let request = MemoryRequest {
            pool,
            size,
            align: request_alignment(alignment),
        };
        Wait::new(self, request, suspend)
    }

    /// Allocate without suspending. Usable from any context.
    pub fn try_allocate_memory(&self, pool: MemoryPoolId, size: usize) -> KernelResult<NonNull<u8>> {
        self.try_request(MemoryRequest {
            pool,
            size,
            align: GRANULE,
        })
    }

    pub fn try_allocate_aligned_memory(
        &self,
        pool: MemoryPoolId,
        size: usize,
        alignment: usize,
    ) -> KernelResult<NonNull<u8>> {
        self.try_request(MemoryRequest {
            pool,
            size,
            align: request_alignment(alignment),
        })
    }

    /// Return a block to its pool and serve waiting tasks.
    pub fn deallocate_memory(&self, ptr: NonNull<u8>) -> KernelResult<()> {
        self.enter().deallocate_memory(ptr)
    }

    /// Usable size of the allocated block at `ptr`.
    pub fn allocation_size(&self, ptr: NonNull<u8>) -> KernelResult<usize> {
        let state = self.enter();
        let id = state.memory_pool_of(ptr).ok_or(KernelError::InvalidParameter(Parameter::Pointer))?;
        state.memory_pools[id]
            .allocation_size(ptr)
            .ok_or(KernelError::InvalidParameter(Parameter::Pointer))
    }

    /// Add another region to a pool. Its blocks never coalesce with blocks
    /// of other regions.
    pub fn add_memory(&self, pool: MemoryPoolId, region: Region) -> KernelResult<()> {
        let mut state = self.enter();
        let target = state
            .memory_pools
            .get_mut(pool)
            .ok_or(KernelError::InvalidObject(ObjectKind::MemoryPool))?;
        target.add_region(&region)?;
        log::debug!("added {} bytes to memory pool {}", region.len(), pool);
        state.serve_memory_waiters(pool);
        Ok(())
    }

    /// Move the allocation at `ptr` into a new block of `size` bytes.
    ///
    /// A zero `size` frees the block and yields `None`. Otherwise the first
    /// `min(old size, size)` bytes are copied and the old block is freed;
    /// bytes past `size` are dropped.
    pub async fn reallocate_memory(
        &self,
        pool: MemoryPoolId,
        ptr: NonNull<u8>,
        size: usize,
        alignment: usize,
        suspend: Suspend,
    ) -> KernelResult<Option<NonNull<u8>>> {
        if size == 0 {
            self.deallocate_memory(ptr)?;
            return Ok(None);
        }
        let old_size = self.allocation_size(ptr)?;
        let new = self.allocate_aligned_memory(pool, size, alignment, suspend).await?;
        // Safety: both blocks are live allocations we own and distinct
        // blocks never overlap.
        unsafe { ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), old_size.min(size)) };
        self.deallocate_memory(ptr)?;
        Ok(Some(new))
    }

    pub fn memory_pool_info(&self, pool: MemoryPoolId) -> KernelResult<MemoryPoolInfo> {
        self.enter()
            .memory_pools
            .get(pool)
            .map(DynamicPool::info)
            .ok_or(KernelError::InvalidObject(ObjectKind::MemoryPool))
    }

    pub fn created_memory_pools(&self) -> Vec<MemoryPoolId> {
        self.enter().created_memory_pools.clone()
    }
}

#[cfg(test)]
impl<A: Arch> Kernel<A> {
    pub(crate) fn audit_memory_pool(&self, pool: MemoryPoolId) -> Option<PoolAudit> {
        self.enter().memory_pools.get(pool).map(DynamicPool::audit)
    }
}
