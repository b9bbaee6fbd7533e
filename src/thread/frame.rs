//! Task frames: the entry future placed in the task's stack region.

use crate::errors::{KernelResult, Parameter};
use crate::mem::region::{align_down, Region};
use core::future::Future;
use core::pin::Pin;
use core::ptr::{self, NonNull};
use core::task::{Context, Poll};

/// Value written at the lowest address of every task stack.
pub const STACK_CANARY: u64 = 0xDEAD_BEEF_CAFE_BABE;

/// Type-erased pointer to a task's entry future.
#[derive(Clone, Copy)]
pub(crate) struct EntryPtr(NonNull<dyn Future<Output = ()>>);

impl EntryPtr {
    /// Poll the entry future.
    ///
    /// # Safety
    ///
    /// The future must still be live and must not be polled or dropped
    /// concurrently. The frame never moves, so pinning is upheld.
    pub(crate) unsafe fn poll(self, cx: &mut Context<'_>) -> Poll<()> {
        let future = unsafe { Pin::new_unchecked(&mut *self.0.as_ptr()) };
        future.poll(cx)
    }
}

/// A task's stack region with the entry future living at its top.
///
/// The layout mirrors a downward-growing stack: the canary sits at the base
/// and the entry future is placed as high as its alignment allows, so the
/// distance between the two is the headroom left for the future's state.
pub(crate) struct TaskFrame {
    region: Region,
    entry: EntryPtr,
    /// Bytes from the entry future to the top of the region.
    used: usize,
    live: bool,
}

impl TaskFrame {
    /// Write the canary and move `entry` into the region.
    pub(crate) fn place<F>(region: Region, entry: F) -> KernelResult<Self>
    where
        F: Future<Output = ()> + 'static,
    {
        let canary_size = core::mem::size_of::<u64>();
        if !region.is_aligned(core::mem::align_of::<u64>()) {
            return Err(Parameter::Stack.into());
        }
        let base = region.addr();
        let top = base + region.len();
        let size = core::mem::size_of::<F>();
        let align = core::mem::align_of::<F>();
        let slot = match top.checked_sub(size) {
            Some(addr) => align_down(addr, align),
            None => return Err(Parameter::Stack.into()),
        };
        if slot < base + canary_size {
            return Err(Parameter::Stack.into());
        }

        let canary = region.start().as_ptr().cast::<u64>();
        let future = slot as *mut F;
        // Safety: the region is exclusively ours, the canary slot is aligned
        // and the future slot lies above it inside the region.
        unsafe {
            ptr::write_volatile(canary, STACK_CANARY);
            ptr::write(future, entry);
        }
        let erased: *mut dyn Future<Output = ()> = future;
        let entry = match NonNull::new(erased) {
            Some(entry) => EntryPtr(entry),
            None => return Err(Parameter::Stack.into()),
        };

        Ok(Self {
            region,
            entry,
            used: top - slot,
            live: true,
        })
    }

    pub(crate) fn entry(&self) -> Option<EntryPtr> {
        self.live.then_some(self.entry)
    }

    pub(crate) fn canary_intact(&self) -> bool {
        let canary = self.region.start().as_ptr().cast::<u64>();
        // Safety: written in `place`; the region outlives the frame.
        unsafe { ptr::read_volatile(canary) == STACK_CANARY }
    }

    pub(crate) fn base(&self) -> usize {
        self.region.addr()
    }

    pub(crate) fn size(&self) -> usize {
        self.region.len()
    }

    pub(crate) fn used(&self) -> usize {
        self.used
    }

    /// Bytes between the canary and the entry future.
    pub(crate) fn headroom(&self) -> usize {
        self.region.len() - self.used - core::mem::size_of::<u64>()
    }

    /// Run the entry future's destructor. Further calls are no-ops.
    ///
    /// # Safety
    ///
    /// The future must not be in the middle of a poll.
    pub(crate) unsafe fn drop_entry(&mut self) {
        if self.live {
            self.live = false;
            unsafe { ptr::drop_in_place(self.entry.0.as_ptr()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec;
    use core::task::{RawWaker, RawWakerVTable, Waker};

    fn region(words: usize) -> Region {
        Region::from_words(Box::leak(vec![0u64; words].into_boxed_slice()))
    }

    fn noop_waker() -> Waker {
        fn clone(_: *const ()) -> RawWaker {
            RawWaker::new(ptr::null(), &VTABLE)
        }
        fn noop(_: *const ()) {}
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
        unsafe { Waker::from_raw(RawWaker::new(ptr::null(), &VTABLE)) }
    }

    #[test]
    fn entry_lives_at_the_top_of_the_region() {
        let payload = [7u64; 4];
        let frame = TaskFrame::place(region(16), async move {
            core::hint::black_box(payload);
        })
        .unwrap();
        assert!(frame.canary_intact());
        assert!(frame.used() >= 32);
        assert_eq!(frame.headroom() + frame.used() + 8, 128);

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let entry = frame.entry().unwrap();
        assert!(unsafe { entry.poll(&mut cx) }.is_ready());
    }

    #[test]
    fn too_small_region_is_rejected() {
        let payload = [1u64; 8];
        let result = TaskFrame::place(region(4), async move {
            core::hint::black_box(payload);
        });
        assert_eq!(result.err(), Some(Parameter::Stack.into()));
    }

    #[test]
    fn clobbered_canary_is_detected() {
        let frame = TaskFrame::place(region(8), async {}).unwrap();
        unsafe { ptr::write_volatile(frame.base() as *mut u64, 0) };
        assert!(!frame.canary_intact());
    }
}
