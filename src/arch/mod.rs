//! Architecture abstraction layer for interrupt masking and fatal errors.
//!
//! The kernel core never touches hardware directly. Everything it needs
//! from the CPU goes through the [`Arch`] trait: masking interrupts for the
//! schedule lock, asking the port to run the dispatcher, and halting on an
//! unrecoverable error.

use crate::errors::FatalError;

/// Architecture abstraction trait.
///
/// All methods are associated functions; a kernel is parameterised by the
/// port type and never holds an instance.
pub trait Arch {
    /// Enable interrupts on the current CPU.
    fn enable_interrupts();

    /// Disable interrupts on the current CPU.
    ///
    /// This creates a critical section in which neither the tick source nor
    /// any other interrupt handler can enter the kernel.
    fn disable_interrupts();

    /// Check if interrupts are currently enabled.
    fn interrupts_enabled() -> bool;

    /// Called when the outermost schedule lock is released while a context
    /// transfer is pending. Ports that run the dispatcher from an idle loop
    /// use this to wake it.
    fn request_switch() {}

    /// Report an unrecoverable kernel inconsistency. Never returns.
    fn fatal_error(error: FatalError) -> !;
}

#[cfg(target_arch = "aarch64")]
pub mod aarch64;

#[cfg(any(test, feature = "std-shim", not(target_os = "none")))]
mod host;

#[cfg(any(test, feature = "std-shim", not(target_os = "none")))]
pub use host::HostArch;

#[cfg(all(target_arch = "aarch64", target_os = "none", not(any(test, feature = "std-shim"))))]
pub use aarch64::Aarch64Arch as DefaultArch;

#[cfg(any(test, feature = "std-shim", not(target_os = "none")))]
pub use host::HostArch as DefaultArch;
