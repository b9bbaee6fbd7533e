//! Suspension lists: circular doubly linked lists of suspension blocks.

use super::{BlockId, BlockSlab, SuspendPolicy};
use alloc::vec::Vec;

/// Head, ordering policy and size of an object's suspension list.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WaitList {
    head: Option<BlockId>,
    policy: SuspendPolicy,
    waiting: usize,
}

impl WaitList {
    pub(crate) const fn new(policy: SuspendPolicy) -> Self {
        Self {
            head: None,
            policy,
            waiting: 0,
        }
    }

    pub(crate) fn head(&self) -> Option<BlockId> {
        self.head
    }

    pub(crate) fn policy(&self) -> SuspendPolicy {
        self.policy
    }

    /// Number of tasks waiting.
    pub(crate) fn waiting(&self) -> usize {
        self.waiting
    }

    /// Link `id` according to the policy. Priority order places the block
    /// after every block of equal or better priority.
    pub(crate) fn insert(&mut self, blocks: &mut BlockSlab, id: BlockId) {
        self.waiting += 1;
        blocks[id].linked = true;
        let Some(head) = self.head else {
            blocks[id].next = Some(id);
            blocks[id].prev = Some(id);
            self.head = Some(id);
            return;
        };

        let mut before = head;
        let mut new_head = false;
        if self.policy == SuspendPolicy::Priority {
            let priority = blocks[id].priority;
            if priority < blocks[head].priority {
                new_head = true;
            } else {
                // Find the first block of strictly worse priority, or wrap
                // back to the head to append at the tail.
                let mut cursor = blocks[head].next.unwrap_or(head);
                while cursor != head && blocks[cursor].priority <= priority {
                    cursor = blocks[cursor].next.unwrap_or(head);
                }
                before = cursor;
            }
        }

        let prev = blocks[before].prev.unwrap_or(before);
        blocks[id].next = Some(before);
        blocks[id].prev = Some(prev);
        blocks[prev].next = Some(id);
        blocks[before].prev = Some(id);
        if new_head {
            self.head = Some(id);
        }
    }

    pub(crate) fn unlink(&mut self, blocks: &mut BlockSlab, id: BlockId) {
        if !blocks[id].linked {
            return;
        }
        self.waiting -= 1;
        blocks[id].linked = false;
        let next = blocks[id].next.take().unwrap_or(id);
        let prev = blocks[id].prev.take().unwrap_or(id);
        if next == id {
            self.head = None;
            return;
        }
        blocks[prev].next = Some(next);
        blocks[next].prev = Some(prev);
        if self.head == Some(id) {
            self.head = Some(next);
        }
    }

    /// Blocks in resume order.
    pub(crate) fn ids(&self, blocks: &BlockSlab) -> Vec<BlockId> {
        let mut ids = Vec::with_capacity(self.waiting);
        let Some(head) = self.head else {
            return ids;
        };
        let mut cursor = head;
        loop {
            ids.push(cursor);
            cursor = blocks[cursor].next.unwrap_or(head);
            if cursor == head {
                return ids;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::slab::SlabId;
    use crate::thread::{TaskId, TaskStatus};
    use crate::wait::{SuspensionBlock, WaitObject, WaitRequest};
    use crate::sync::SemaphoreId;
    use alloc::vec;

    fn block(blocks: &mut BlockSlab, priority: u8) -> BlockId {
        blocks.insert_with(|_| SuspensionBlock {
            task: TaskId::from_parts(priority as u32, 1),
            status: TaskStatus::SemaphoreSuspend,
            object: WaitObject::Semaphore(SemaphoreId::from_parts(0, 1)),
            request: WaitRequest::Semaphore,
            priority,
            next: None,
            prev: None,
            linked: false,
            outcome: None,
        })
    }

    #[test]
    fn fifo_keeps_arrival_order() {
        let mut blocks = BlockSlab::new();
        let mut list = WaitList::new(SuspendPolicy::Fifo);
        let ids: Vec<_> = [9, 1, 5].iter().map(|&p| block(&mut blocks, p)).collect();
        for &id in &ids {
            list.insert(&mut blocks, id);
        }
        assert_eq!(list.ids(&blocks), ids);
        assert_eq!(list.waiting(), 3);
    }

    #[test]
    fn priority_order_breaks_ties_by_arrival() {
        let mut blocks = BlockSlab::new();
        let mut list = WaitList::new(SuspendPolicy::Priority);
        let a = block(&mut blocks, 20);
        let b = block(&mut blocks, 10);
        let c = block(&mut blocks, 20);
        let d = block(&mut blocks, 5);
        let e = block(&mut blocks, 10);
        for id in [a, b, c, d, e] {
            list.insert(&mut blocks, id);
        }
        assert_eq!(list.ids(&blocks), vec![d, b, e, a, c]);

        list.unlink(&mut blocks, d);
        list.unlink(&mut blocks, a);
        assert_eq!(list.ids(&blocks), vec![b, e, c]);
        assert_eq!(list.head(), Some(b));
        list.unlink(&mut blocks, b);
        list.unlink(&mut blocks, e);
        list.unlink(&mut blocks, c);
        assert_eq!(list.head(), None);
        assert_eq!(list.waiting(), 0);
    }
}
