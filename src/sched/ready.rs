//! Per-priority ready lists.
//!
//! Each priority has a circular doubly linked list threaded through the
//! task control blocks. The bitmap bit for a priority is set exactly when
//! its list is non-empty.

use super::bitmap::PriorityBitmap;
use crate::config::PRIORITIES;
use crate::mem::slab::Slab;
use crate::thread::{TaskId, Tcb};

pub(crate) type TaskSlab = Slab<TaskId, Tcb>;

pub(crate) struct ReadyQueues {
    heads: [Option<TaskId>; PRIORITIES],
    bitmap: PriorityBitmap,
}

impl ReadyQueues {
    pub(crate) const fn new() -> Self {
        Self {
            heads: [None; PRIORITIES],
            bitmap: PriorityBitmap::new(),
        }
    }

    pub(crate) fn head(&self, priority: u8) -> Option<TaskId> {
        self.heads[priority as usize]
    }

    pub(crate) fn highest(&self) -> Option<u8> {
        self.bitmap.highest_ready()
    }

    /// Head of the highest-priority non-empty list.
    pub(crate) fn highest_head(&self) -> Option<TaskId> {
        self.highest().and_then(|priority| self.head(priority))
    }

    /// Append `id` to the tail of its priority list. Returns `true` if the
    /// list was empty before.
    pub(crate) fn push_back(&mut self, tasks: &mut TaskSlab, id: TaskId) -> bool {
        let priority = tasks[id].priority;
        match self.heads[priority as usize] {
            Some(head) => {
                let tail = tasks[head].ready_prev.unwrap_or(head);
                tasks[id].ready_prev = Some(tail);
                tasks[id].ready_next = Some(head);
                tasks[tail].ready_next = Some(id);
                tasks[head].ready_prev = Some(id);
                false
            }
            None => {
                tasks[id].ready_prev = Some(id);
                tasks[id].ready_next = Some(id);
                self.heads[priority as usize] = Some(id);
                self.bitmap.mark_ready(priority);
                true
            }
        }
    }

    /// Unlink `id` from its priority list.
    pub(crate) fn remove(&mut self, tasks: &mut TaskSlab, id: TaskId) {
        let priority = tasks[id].priority;
        let next = tasks[id].ready_next.take().unwrap_or(id);
        let prev = tasks[id].ready_prev.take().unwrap_or(id);
        if next == id {
            self.heads[priority as usize] = None;
            self.bitmap.mark_not_ready(priority);
            return;
        }
        tasks[prev].ready_next = Some(next);
        tasks[next].ready_prev = Some(prev);
        if self.heads[priority as usize] == Some(id) {
            self.heads[priority as usize] = Some(next);
        }
    }

    /// Move `id` to the tail of its list. Returns `false` if it is alone.
    pub(crate) fn rotate(&mut self, tasks: &mut TaskSlab, id: TaskId) -> bool {
        if tasks[id].ready_next == Some(id) {
            return false;
        }
        let priority = tasks[id].priority;
        if self.heads[priority as usize] == Some(id) {
            // The list is circular: advancing the head moves `id` to the tail.
            self.heads[priority as usize] = tasks[id].ready_next;
        } else {
            self.remove(tasks, id);
            self.push_back(tasks, id);
        }
        true
    }

    /// Whether another task shares `id`'s priority list.
    pub(crate) fn has_peers(&self, tasks: &TaskSlab, id: TaskId) -> bool {
        tasks[id].ready_next.map_or(false, |next| next != id)
    }
}
