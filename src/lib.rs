#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(unreachable_pub)]

//! Priority-preemptive real-time kernel core.
//!
//! The crate provides the scheduling and memory core of a small RTOS:
//!
//! - 256 task priorities with an O(1) two-level ready bitmap, FIFO order
//!   within a priority, time slicing and preemption
//! - one suspension protocol shared by every blocking object, with FIFO or
//!   priority-ordered waiters, timeouts and safe deletion
//! - dynamic memory pools (first fit, boundary coalescing, multiple regions)
//!   and fixed-size partition pools
//! - counting semaphores, event groups, message queues and per-task signals
//!
//! # Execution model
//!
//! A task is an `async` entry future placed at the top of the task's own
//! stack region. The dispatcher ([`Kernel::dispatch_once`],
//! [`Kernel::run_until_idle`]) polls the entry of the task that should run.
//! Blocking services are futures; a task gives up the CPU at its next await
//! point once it suspends or is preempted.
//!
//! # Features
//!
//! - `std-shim`: build the host port ([`HostArch`]) on bare-metal targets
//!   for testing
//!
//! # Quick Start
//!
//! ```ignore
//! use preemptive_kernel::{DefaultArch, Kernel, KernelConfig, Region, Suspend, SuspendPolicy, TaskBuilder};
//!
//! static KERNEL: Kernel<DefaultArch> = Kernel::new(KernelConfig::new());
//!
//! fn kernel_main(heap: &'static mut [u64], stack: &'static mut [u64]) {
//!     let pool = KERNEL
//!         .create_memory_pool("heap", Region::from_words(heap), 16, SuspendPolicy::Fifo)
//!         .unwrap();
//!     KERNEL
//!         .create_task(TaskBuilder::new().name("main").priority(10), Region::from_words(stack), async move {
//!             let block = KERNEL.allocate_memory(pool, 128, Suspend::Forever).await.unwrap();
//!             KERNEL.deallocate_memory(block).unwrap();
//!         })
//!         .unwrap();
//!     loop {
//!         KERNEL.run_until_idle();
//!     }
//! }
//! ```

pub mod arch;
pub mod config;
pub mod errors;
pub mod kernel;
pub mod mem;
pub mod sched;
mod signal;
pub mod sync;
pub mod thread;
pub mod time;
pub mod wait;

#[cfg(test)]
extern crate std;

extern crate alloc;

#[cfg(all(target_os = "none", not(test), not(feature = "std-shim")))]
use core::panic::PanicInfo;

#[cfg(all(target_os = "none", not(test), not(feature = "std-shim")))]
#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!("msr daifset, #0xf", options(nomem, nostack));
    }
    loop {
        #[cfg(target_arch = "aarch64")]
        unsafe {
            core::arch::asm!("wfe", options(nomem, nostack));
        }
        #[cfg(not(target_arch = "aarch64"))]
        core::hint::spin_loop();
    }
}

// ============================================================================
// Public API
// ============================================================================

pub use arch::Arch;

#[cfg(any(
    test,
    feature = "std-shim",
    not(target_os = "none"),
    all(target_arch = "aarch64", target_os = "none")
))]
pub use arch::DefaultArch;

#[cfg(any(test, feature = "std-shim", not(target_os = "none")))]
pub use arch::HostArch;

pub use config::{KernelConfig, MAX_NAME, PRIORITIES, PRIORITY_GROUPS};
pub use errors::{FatalError, KernelError, KernelResult, ObjectKind, Parameter};
pub use kernel::{ExecContext, Kernel, Sleep};
pub use mem::{
    MemoryPoolId, MemoryPoolInfo, PartitionPoolId, PartitionPoolInfo, Region, GRANULE, MEMORY_OVERHEAD,
    PARTITION_OVERHEAD,
};
pub use sched::{PriorityBitmap, ScheduleGuard};
pub use sync::{
    EventGroupId, EventGroupInfo, EventOp, MessageKind, QueueId, QueueInfo, SemaphoreId, SemaphoreInfo, SetOp,
};
pub use thread::{SignalHandler, TaskBuilder, TaskId, TaskInfo, TaskStatus, STACK_CANARY};
pub use time::{Duration, Suspend, TickCounter};
pub use wait::{SuspendPolicy, YieldNow};

#[cfg(test)]
mod tests;
