//! Generational slab storage for kernel control blocks.
//!
//! Every control block lives in a slot of a [`Slab`]. Its public identity is
//! the slot index plus the slot's generation tag: the tag is non-zero while
//! the slot is live and is bumped when the slot is released, so a stale
//! identity is detected instead of aliasing a newer object.

use crate::errors::FatalError;
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::num::NonZeroU32;
use core::ops::{Index, IndexMut};

/// Typed identity of a slab slot.
pub(crate) trait SlabId: Copy + Eq {
    fn from_parts(index: u32, tag: u32) -> Self;
    fn index(self) -> u32;
    fn tag(self) -> u32;
}

macro_rules! slab_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name {
            index: u32,
            tag: core::num::NonZeroU32,
        }

        impl $crate::mem::slab::SlabId for $name {
            fn from_parts(index: u32, tag: u32) -> Self {
                Self {
                    index,
                    tag: core::num::NonZeroU32::new(tag).unwrap_or(core::num::NonZeroU32::MIN),
                }
            }

            fn index(self) -> u32 {
                self.index
            }

            fn tag(self) -> u32 {
                self.tag.get()
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}#{}", self.index, self.tag)
            }
        }
    };
}

pub(crate) use slab_id;

struct Slot<T> {
    /// Generation of the current (or next) occupant; never zero.
    tag: NonZeroU32,
    value: Option<T>,
}

/// Receiver of a stale identity found through [`Index`].
pub(crate) type FatalSink = fn(FatalError) -> !;

/// A vector of generational slots with a free list.
pub(crate) struct Slab<I, T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    fatal: FatalSink,
    _id: PhantomData<I>,
}

impl<I: SlabId, T> Slab<I, T> {
    #[cfg(test)]
    pub(crate) const fn new() -> Self {
        fn panic_sink(error: FatalError) -> ! {
            panic!("{}", error)
        }
        Self::with_fatal_sink(panic_sink)
    }

    pub(crate) const fn with_fatal_sink(fatal: FatalSink) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            fatal,
            _id: PhantomData,
        }
    }

    /// Insert a value built from its own identity.
    pub(crate) fn insert_with(&mut self, build: impl FnOnce(I) -> T) -> I {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    tag: NonZeroU32::MIN,
                    value: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let id = I::from_parts(index, slot.tag.get());
        slot.value = Some(build(id));
        self.len += 1;
        id
    }

    pub(crate) fn get(&self, id: I) -> Option<&T> {
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.tag.get() == id.tag())
            .and_then(|slot| slot.value.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: I) -> Option<&mut T> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.tag.get() == id.tag())
            .and_then(|slot| slot.value.as_mut())
    }

    pub(crate) fn contains(&self, id: I) -> bool {
        self.get(id).is_some()
    }

    /// Release a slot. The identity becomes stale immediately.
    pub(crate) fn remove(&mut self, id: I) -> Option<T> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.tag.get() != id.tag() {
            return None;
        }
        let value = slot.value.take()?;
        slot.tag = slot.tag.checked_add(1).unwrap_or(NonZeroU32::MIN);
        self.free.push(id.index());
        self.len -= 1;
        Some(value)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

fn stale<I: SlabId>(fatal: FatalSink, id: I) -> ! {
    fatal(FatalError::StaleIdentity {
        index: id.index(),
        tag: id.tag(),
    })
}

/// Indexing with a live identity. A stale identity here means a kernel
/// link is corrupted and goes to the fatal sink.
impl<I: SlabId, T> Index<I> for Slab<I, T> {
    type Output = T;

    fn index(&self, id: I) -> &T {
        match self.get(id) {
            Some(value) => value,
            None => stale(self.fatal, id),
        }
    }
}

impl<I: SlabId, T> IndexMut<I> for Slab<I, T> {
    fn index_mut(&mut self, id: I) -> &mut T {
        let fatal = self.fatal;
        match self.get_mut(id) {
            Some(value) => value,
            None => stale(fatal, id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    slab_id!(TestId);

    #[test]
    fn removed_identity_is_stale_after_reuse() {
        let mut slab: Slab<TestId, &str> = Slab::new();
        let a = slab.insert_with(|_| "a");
        assert_eq!(slab.remove(a), Some("a"));
        let b = slab.insert_with(|_| "b");

        assert_eq!(a.index(), b.index());
        assert_ne!(a.tag(), b.tag());
        assert!(slab.get(a).is_none());
        assert_eq!(slab[b], "b");
        assert_eq!(slab.len(), 1);
    }

    #[test]
    #[should_panic(expected = "sink: Stale object identity 0#1")]
    fn stale_index_goes_to_the_fatal_sink() {
        fn sink(error: FatalError) -> ! {
            panic!("sink: {}", error)
        }
        let mut slab: Slab<TestId, u8> = Slab::with_fatal_sink(sink);
        let id = slab.insert_with(|_| 1);
        slab.remove(id);
        let _value = slab[id];
    }

    #[test]
    fn insert_with_sees_own_identity() {
        let mut slab: Slab<TestId, TestId> = Slab::new();
        let id = slab.insert_with(|id| id);
        assert_eq!(slab[id], id);
        assert_ne!(id.tag(), 0);
    }
}
