//! Host port used for testing, the `std-shim` feature and hosted targets.

use super::Arch;
use crate::errors::FatalError;
use core::cell::Cell;

extern crate std;

std::thread_local! {
    static INTERRUPTS_ENABLED: Cell<bool> = const { Cell::new(true) };
    static SWITCH_REQUESTS: Cell<usize> = const { Cell::new(0) };
}

/// Port that models the interrupt mask with a per-thread flag.
///
/// Each host thread behaves like its own CPU, so tests running in parallel
/// do not observe each other's critical sections.
pub struct HostArch;

impl HostArch {
    /// Number of switch requests issued on this thread so far.
    pub fn switch_requests() -> usize {
        SWITCH_REQUESTS.with(Cell::get)
    }
}

impl Arch for HostArch {
    fn enable_interrupts() {
        INTERRUPTS_ENABLED.with(|flag| flag.set(true));
    }

    fn disable_interrupts() {
        INTERRUPTS_ENABLED.with(|flag| flag.set(false));
    }

    fn interrupts_enabled() -> bool {
        INTERRUPTS_ENABLED.with(Cell::get)
    }

    fn request_switch() {
        SWITCH_REQUESTS.with(|count| count.set(count.get() + 1));
    }

    fn fatal_error(error: FatalError) -> ! {
        log::error!("fatal kernel error: {}", error);
        panic!("fatal kernel error: {}", error);
    }
}
