//! AArch64 port: IRQ masking through DAIF.

use super::Arch;
use crate::errors::FatalError;
use core::arch::asm;

/// Port for bare-metal AArch64 cores.
pub struct Aarch64Arch;

impl Arch for Aarch64Arch {
    fn enable_interrupts() {
        unsafe {
            asm!("msr daifclr, #2", options(nomem, nostack));
        }
    }

    fn disable_interrupts() {
        unsafe {
            asm!("msr daifset, #2", options(nomem, nostack));
        }
    }

    fn interrupts_enabled() -> bool {
        let daif: u64;
        unsafe {
            asm!(
                "mrs {daif}, daif",
                daif = out(reg) daif,
                options(nostack, readonly)
            );
        }
        (daif & 0x80) == 0
    }

    fn request_switch() {
        // Wake a dispatcher parked in `wfe`.
        unsafe {
            asm!("sev", options(nomem, nostack));
        }
    }

    fn fatal_error(error: FatalError) -> ! {
        log::error!("fatal kernel error: {}", error);
        unsafe {
            asm!("msr daifset, #0xf", options(nomem, nostack));
        }
        loop {
            unsafe {
                asm!("wfe", options(nomem, nostack));
            }
        }
    }
}
