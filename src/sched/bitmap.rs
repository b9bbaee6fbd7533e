//! Ready-queue bitmap index.
//!
//! Priorities are grouped eight to a byte. A 32-bit group word records which
//! bytes are non-zero, so the highest ready priority is found with two
//! lowest-set-bit lookups whatever the number of ready tasks.

use crate::config::{PRIORITIES, PRIORITY_GROUPS};

/// Lowest set bit of every byte value. Entry 0 is unused.
pub(crate) const LOWEST_SET_BIT: [u8; 256] = build_lowest_set_bit();

const fn build_lowest_set_bit() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut value = 1;
    while value < 256 {
        let mut bit = 0;
        while (value >> bit) & 1 == 0 {
            bit += 1;
        }
        table[value] = bit as u8;
        value += 1;
    }
    table
}

/// Two-level priority bitmap.
#[derive(Debug, Clone)]
pub struct PriorityBitmap {
    /// Bit `g` is set iff `sub[g]` is non-zero.
    groups: u32,
    /// Bit `b` of `sub[g]` is set iff priority `8 * g + b` is ready.
    sub: [u8; PRIORITY_GROUPS],
}

impl PriorityBitmap {
    pub const fn new() -> Self {
        Self {
            groups: 0,
            sub: [0; PRIORITY_GROUPS],
        }
    }

    pub fn mark_ready(&mut self, priority: u8) {
        let group = (priority >> 3) as usize;
        self.sub[group] |= 1 << (priority & 7);
        self.groups |= 1 << group;
    }

    pub fn mark_not_ready(&mut self, priority: u8) {
        let group = (priority >> 3) as usize;
        self.sub[group] &= !(1 << (priority & 7));
        if self.sub[group] == 0 {
            self.groups &= !(1 << group);
        }
    }

    pub fn is_ready(&self, priority: u8) -> bool {
        self.sub[(priority >> 3) as usize] & (1 << (priority & 7)) != 0
    }

    /// Lowest-numbered ready priority.
    pub fn highest_ready(&self) -> Option<u8> {
        if self.groups == 0 {
            return None;
        }
        // Scan the group word a byte at a time through the table.
        let mut group = 0;
        let mut word = self.groups;
        while word & 0xFF == 0 {
            word >>= 8;
            group += 8;
        }
        group += LOWEST_SET_BIT[(word & 0xFF) as usize] as usize;
        let bit = LOWEST_SET_BIT[self.sub[group] as usize] as usize;
        Some((group * 8 + bit) as u8)
    }

    /// [`highest_ready`](Self::highest_ready) with "nothing ready" encoded as
    /// one past the largest priority.
    pub fn highest_ready_index(&self) -> usize {
        self.highest_ready().map_or(PRIORITIES, usize::from)
    }
}

impl Default for PriorityBitmap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_matches_trailing_zeros() {
        for value in 1..256usize {
            assert_eq!(LOWEST_SET_BIT[value] as u32, (value as u8).trailing_zeros());
        }
    }

    #[test]
    fn group_bit_follows_sub_bitmap() {
        let mut map = PriorityBitmap::new();
        assert_eq!(map.highest_ready(), None);
        assert_eq!(map.highest_ready_index(), PRIORITIES);

        map.mark_ready(200);
        map.mark_ready(201);
        assert_eq!(map.highest_ready(), Some(200));
        map.mark_not_ready(200);
        assert_eq!(map.highest_ready(), Some(201));
        map.mark_ready(3);
        assert_eq!(map.highest_ready(), Some(3));
        map.mark_not_ready(3);
        map.mark_not_ready(201);
        assert_eq!(map.highest_ready(), None);
        assert!(!map.is_ready(201));
    }

    #[test]
    fn extreme_priorities() {
        let mut map = PriorityBitmap::new();
        map.mark_ready(255);
        assert_eq!(map.highest_ready(), Some(255));
        map.mark_ready(0);
        assert_eq!(map.highest_ready(), Some(0));
    }
}
