//! Caller-supplied memory regions.

use core::ptr::NonNull;

/// Allocation granule: every pool address and size is a multiple of it.
pub const GRANULE: usize = core::mem::align_of::<usize>();

/// Round `value` up to a multiple of `align` (a power of two).
pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// [`align_up`] that reports overflow instead of wrapping.
pub(crate) const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(bumped) => Some(bumped & !(align - 1)),
        None => None,
    }
}

/// Round `value` down to a multiple of `align` (a power of two).
pub(crate) const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Exclusive handle to a block of memory handed to the kernel.
///
/// The kernel takes ownership of the bytes for as long as the object built
/// on them (task stack, memory pool, partition pool) exists. Deleting the
/// object never writes to the region again.
#[derive(Debug)]
pub struct Region {
    start: NonNull<u8>,
    len: usize,
}

impl Region {
    /// Take over a static byte buffer.
    pub fn new(memory: &'static mut [u8]) -> Self {
        let len = memory.len();
        // A slice pointer is never null.
        let start = NonNull::new(memory.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self { start, len }
    }

    /// Take over a static word buffer, which is always granule aligned.
    pub fn from_words(memory: &'static mut [u64]) -> Self {
        let len = core::mem::size_of_val(memory);
        let start = NonNull::new(memory.as_mut_ptr().cast::<u8>()).unwrap_or(NonNull::dangling());
        Self { start, len }
    }

    /// Build a region from a raw address range.
    ///
    /// # Safety
    ///
    /// - `start..start + len` must be valid for reads and writes
    /// - Nothing else may access the range while the kernel owns it
    pub unsafe fn from_raw_parts(start: NonNull<u8>, len: usize) -> Self {
        Self { start, len }
    }

    pub fn start(&self) -> NonNull<u8> {
        self.start
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn addr(&self) -> usize {
        self.start.as_ptr() as usize
    }

    pub(crate) fn is_aligned(&self, align: usize) -> bool {
        self.addr() % align == 0
    }
}

// Safety: a region is an exclusive claim on its bytes.
unsafe impl Send for Region {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding_helpers() {
        assert_eq!(align_up(100, 8), 104);
        assert_eq!(align_up(104, 8), 104);
        assert_eq!(align_down(1023, 8), 1016);
        assert_eq!(align_up(1, 64), 64);
    }
}
