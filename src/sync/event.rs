//! Event groups: 32 flags that tasks wait on with AND/OR conditions.

use super::{EventGroupId, EventOp, SetOp};
use crate::arch::Arch;
use crate::errors::{KernelError, KernelResult, ObjectKind, Parameter};
use crate::kernel::state::KernelState;
use crate::kernel::Kernel;
use crate::thread::builder::truncate_name;
use crate::thread::TaskStatus;
use crate::time::Suspend;
use crate::wait::{Request, SuspendPolicy, Wait, WaitList, WaitObject, WaitRequest, WaitTarget, WaitValue};
use alloc::string::String;
use alloc::vec::Vec;
use core::future::Future;

/// Snapshot returned by [`Kernel::event_group_info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventGroupInfo {
    pub name: String,
    pub events: u32,
    pub waiting: usize,
}

pub(crate) struct EventGroup {
    name: String,
    events: u32,
    waiters: WaitList,
}

impl WaitTarget for EventGroup {
    fn waiters(&mut self) -> &mut WaitList {
        &mut self.waiters
    }
}

struct Retrieve {
    group: EventGroupId,
    requested: u32,
    op: EventOp,
}

impl Request for Retrieve {
    type Output = u32;

    const STATUS: TaskStatus = TaskStatus::EventSuspend;

    fn object(&self) -> WaitObject {
        WaitObject::EventGroup(self.group)
    }

    fn wait_request(&self) -> WaitRequest {
        WaitRequest::Events {
            requested: self.requested,
            op: self.op,
        }
    }

    fn validate(&self) -> KernelResult<()> {
        if self.requested == 0 {
            return Err(Parameter::Events.into());
        }
        Ok(())
    }

    fn attempt(&mut self, state: &mut KernelState) -> KernelResult<Option<u32>> {
        let group = state
            .event_groups
            .get_mut(self.group)
            .ok_or(KernelError::InvalidObject(ObjectKind::EventGroup))?;
        let current = group.events;
        if !self.op.satisfied(current, self.requested) {
            return Ok(None);
        }
        if self.op.consumes() {
            group.events &= !self.requested;
        }
        Ok(Some(current))
    }

    fn output(value: WaitValue) -> KernelResult<u32> {
        match value {
            WaitValue::Events(events) => Ok(events),
            _ => Err(KernelError::InvalidSuspend),
        }
    }
}

impl KernelState {
    /// Wake every waiter the current flags satisfy, then clear the union of
    /// their consume masks.
    fn serve_event_waiters(&mut self, id: EventGroupId) {
        let Some(group) = self.event_groups.get(id) else {
            return;
        };
        let current = group.events;
        let mut consumed = 0;
        for block in group.waiters.ids(&self.blocks) {
            let WaitRequest::Events { requested, op } = self.blocks[block].request else {
                continue;
            };
            if !op.satisfied(current, requested) {
                continue;
            }
            if op.consumes() {
                consumed |= requested;
            }
            self.event_groups[id].waiters.unlink(&mut self.blocks, block);
            self.settle(block, Ok(WaitValue::Events(current)));
        }
        self.event_groups[id].events &= !consumed;
    }
}

impl<A: Arch> Kernel<A> {
    pub fn create_event_group(&self, name: &str) -> KernelResult<EventGroupId> {
        let name = truncate_name(name);
        let mut state = self.enter();
        let id = state.event_groups.insert_with(|_| EventGroup {
            name,
            events: 0,
            waiters: WaitList::new(SuspendPolicy::Fifo),
        });
        state.created_event_groups.push(id);
        log::debug!("created event group {}", id);
        Ok(id)
    }

    /// Delete a group, resuming every waiter with
    /// [`KernelError::ObjectDeleted`].
    pub fn delete_event_group(&self, group: EventGroupId) -> KernelResult<()> {
        let mut state = self.enter();
        let removed = state
            .event_groups
            .remove(group)
            .ok_or(KernelError::InvalidObject(ObjectKind::EventGroup))?;
        state.created_event_groups.retain(|&id| id != group);
        state.release_waiters(removed.waiters, Err(KernelError::ObjectDeleted));
        log::debug!("deleted event group {}", group);
        Ok(())
    }

    /// Combine `events` into the group's flags and wake satisfied waiters.
    pub fn set_events(&self, group: EventGroupId, events: u32, op: SetOp) -> KernelResult<()> {
        let mut state = self.enter();
        let target = state
            .event_groups
            .get_mut(group)
            .ok_or(KernelError::InvalidObject(ObjectKind::EventGroup))?;
        match op {
            SetOp::And => target.events &= events,
            SetOp::Or => target.events |= events,
        }
        state.serve_event_waiters(group);
        Ok(())
    }

    /// Wait for `requested` flags. Resolves to the group's flags as they
    /// were when the request was satisfied, before any consumption.
    pub fn retrieve_events(
        &self,
        group: EventGroupId,
        requested: u32,
        op: EventOp,
        suspend: Suspend,
    ) -> impl Future<Output = KernelResult<u32>> + '_ {
        Wait::new(self, Retrieve { group, requested, op }, suspend)
    }

    pub fn try_retrieve_events(&self, group: EventGroupId, requested: u32, op: EventOp) -> KernelResult<u32> {
        self.try_request(Retrieve { group, requested, op })
    }

    /// Current flags of the group.
    pub fn events(&self, group: EventGroupId) -> KernelResult<u32> {
        self.enter()
            .event_groups
            .get(group)
            .map(|target| target.events)
            .ok_or(KernelError::InvalidObject(ObjectKind::EventGroup))
    }

    pub fn event_group_info(&self, group: EventGroupId) -> KernelResult<EventGroupInfo> {
        self.enter()
            .event_groups
            .get(group)
            .map(|target| EventGroupInfo {
                name: target.name.clone(),
                events: target.events,
                waiting: target.waiters.waiting(),
            })
            .ok_or(KernelError::InvalidObject(ObjectKind::EventGroup))
    }

    pub fn created_event_groups(&self) -> Vec<EventGroupId> {
        self.enter().created_event_groups.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn and_needs_every_flag_or_needs_one() {
        assert!(EventOp::And.satisfied(0b111, 0b101));
        assert!(!EventOp::AndConsume.satisfied(0b100, 0b101));
        assert!(EventOp::Or.satisfied(0b100, 0b101));
        assert!(!EventOp::OrConsume.satisfied(0b010, 0b101));
        assert!(EventOp::OrConsume.consumes());
        assert!(!EventOp::And.consumes());
    }
}
