//! Per-task suspension timers.

use crate::thread::TaskId;
use alloc::collections::BTreeSet;
use alloc::vec::Vec;

/// Armed task timers ordered by expiry tick.
///
/// Each task owns at most one timer; the task control block remembers its
/// deadline so the entry can be removed without a search.
pub(crate) struct TaskTimers {
    armed: BTreeSet<(u64, TaskId)>,
}

impl TaskTimers {
    pub(crate) const fn new() -> Self {
        Self {
            armed: BTreeSet::new(),
        }
    }

    pub(crate) fn start(&mut self, deadline: u64, task: TaskId) {
        self.armed.insert((deadline, task));
    }

    pub(crate) fn stop(&mut self, deadline: u64, task: TaskId) {
        self.armed.remove(&(deadline, task));
    }

    /// Remove and return every timer whose deadline is at or before `now`,
    /// earliest first.
    pub(crate) fn expire(&mut self, now: u64) -> Vec<TaskId> {
        let mut expired = Vec::new();
        while let Some(&(deadline, task)) = self.armed.first() {
            if deadline > now {
                break;
            }
            self.armed.remove(&(deadline, task));
            expired.push(task);
        }
        expired
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.armed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::slab::SlabId;

    #[test]
    fn expire_returns_due_timers_in_deadline_order() {
        let a = TaskId::from_parts(0, 1);
        let b = TaskId::from_parts(1, 1);
        let c = TaskId::from_parts(2, 1);
        let mut timers = TaskTimers::new();
        timers.start(7, a);
        timers.start(3, b);
        timers.start(9, c);
        timers.stop(9, c);

        assert!(timers.expire(2).is_empty());
        assert_eq!(timers.expire(7), alloc::vec![b, a]);
        assert_eq!(timers.len(), 0);
    }
}
