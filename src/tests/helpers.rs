//! Test helper utilities and common functionality.

use crate::arch::HostArch;
use crate::config::KernelConfig;
use crate::kernel::Kernel;
use crate::mem::region::Region;
use crate::thread::{TaskBuilder, TaskId};
use alloc::boxed::Box;
use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::future::Future;
use core::pin::pin;
use core::ptr::NonNull;
use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

pub(crate) type TestKernel = Kernel<HostArch>;

/// Stack size handed to tasks created through [`TestEnvironment::spawn`].
pub(crate) const TEST_STACK: usize = 8 * 1024;

/// A leaked kernel plus shortcuts for building scenarios on it.
pub(crate) struct TestEnvironment {
    pub(crate) kernel: &'static TestKernel,
}

impl TestEnvironment {
    /// Kernel with time slicing off, so only explicit actions move tasks.
    pub(crate) fn new() -> Self {
        Self::with_config(KernelConfig::new().with_default_time_slice(0))
    }

    pub(crate) fn with_config(config: KernelConfig) -> Self {
        Self {
            kernel: Box::leak(Box::new(Kernel::new(config))),
        }
    }

    pub(crate) fn spawn<F>(&self, priority: u8, entry: F) -> TaskId
    where
        F: Future<Output = ()> + 'static,
    {
        self.spawn_with(TaskBuilder::new().priority(priority), entry)
    }

    pub(crate) fn spawn_with<F>(&self, builder: TaskBuilder, entry: F) -> TaskId
    where
        F: Future<Output = ()> + 'static,
    {
        self.kernel
            .create_task(builder, region(TEST_STACK), entry)
            .expect("task creation failed")
    }

    /// Dispatch until idle, then advance the clock `ticks` times
    /// dispatching after each tick.
    pub(crate) fn run_ticks(&self, ticks: usize) {
        self.kernel.run_until_idle();
        for _ in 0..ticks {
            self.kernel.tick();
            self.kernel.run_until_idle();
        }
    }
}

/// Leaked, word-aligned memory of `bytes` bytes (rounded up to a word).
pub(crate) fn region(bytes: usize) -> Region {
    Region::from_words(Box::leak(vec![0u64; (bytes + 7) / 8].into_boxed_slice()))
}

/// Shared event log that task entries append to.
pub(crate) type Log<T> = Rc<RefCell<Vec<T>>>;

pub(crate) fn log<T>() -> Log<T> {
    Rc::new(RefCell::new(Vec::new()))
}

pub(crate) fn entries<T: Clone>(log: &Log<T>) -> Vec<T> {
    log.borrow().clone()
}

fn noop_waker() -> Waker {
    fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(core::ptr::null(), &VTABLE)
    }
    fn noop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
    // Safety: the vtable ignores the data pointer.
    unsafe { Waker::from_raw(RawWaker::new(core::ptr::null(), &VTABLE)) }
}

/// Poll a future once from the calling context.
pub(crate) fn poll_once<F: Future>(future: F) -> Poll<F::Output> {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    pin!(future).as_mut().poll(&mut cx)
}

/// Poll a future that must complete on its first poll.
pub(crate) fn complete<F: Future>(future: F) -> F::Output {
    match poll_once(future) {
        Poll::Ready(output) => output,
        Poll::Pending => panic!("future suspended outside task context"),
    }
}

/// Fill `len` bytes at `ptr` with `byte`.
pub(crate) fn fill(ptr: NonNull<u8>, len: usize, byte: u8) {
    // Safety: callers pass live allocations of at least `len` bytes.
    unsafe { core::ptr::write_bytes(ptr.as_ptr(), byte, len) }
}

pub(crate) fn bytes(ptr: NonNull<u8>, len: usize) -> Vec<u8> {
    // Safety: callers pass live allocations of at least `len` bytes.
    unsafe { core::slice::from_raw_parts(ptr.as_ptr(), len) }.to_vec()
}
