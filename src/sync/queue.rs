//! Message queues of 32-bit words.
//!
//! A queue holds at most `capacity` words. A variable size message costs one
//! extra word for its length. Senders suspend while their message does not
//! fit and receivers while the queue is empty; a message sent while
//! receivers wait on an empty queue goes straight to the first of them.

use super::QueueId;
use crate::arch::Arch;
use crate::errors::{KernelError, KernelResult, ObjectKind, Parameter};
use crate::kernel::state::KernelState;
use crate::kernel::Kernel;
use crate::thread::builder::truncate_name;
use crate::thread::TaskStatus;
use crate::time::Suspend;
use crate::wait::{
    BlockId, Request, SuspendPolicy, Wait, WaitList, WaitObject, WaitRequest, WaitTarget, WaitValue,
};
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use core::future::Future;

/// Message layout of a queue, in words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Every message is exactly this long.
    Fixed(usize),
    /// Messages are one word up to this long.
    Variable(usize),
}

impl MessageKind {
    const fn overhead(self) -> usize {
        match self {
            MessageKind::Fixed(_) => 0,
            MessageKind::Variable(_) => 1,
        }
    }

    pub(crate) fn accepts(self, len: usize) -> bool {
        match self {
            MessageKind::Fixed(size) => len == size,
            MessageKind::Variable(max) => len != 0 && len <= max,
        }
    }

    /// Words a message of `len` words occupies in the queue.
    pub(crate) fn footprint(self, len: usize) -> usize {
        len + self.overhead()
    }
}

/// Snapshot returned by [`Kernel::queue_info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub kind: MessageKind,
    /// Usable words. A fixed size queue is cut down to whole messages.
    pub capacity: usize,
    pub available: usize,
    pub messages: usize,
    /// Tasks suspended on the queue, front senders included.
    pub waiting: usize,
    pub policy: SuspendPolicy,
}

pub(crate) struct Queue {
    name: String,
    kind: MessageKind,
    capacity: usize,
    available: usize,
    messages: VecDeque<Vec<u32>>,
    /// Receivers of an empty queue, or senders that did not fit.
    waiters: WaitList,
    /// Senders to the front that did not fit. They are served first.
    pub(crate) urgent: WaitList,
}

impl WaitTarget for Queue {
    fn waiters(&mut self) -> &mut WaitList {
        &mut self.waiters
    }
}

impl Queue {
    fn fits(&self, len: usize) -> bool {
        self.kind.footprint(len) <= self.available
    }

    fn push(&mut self, message: Vec<u32>, front: bool) {
        self.available -= self.kind.footprint(message.len());
        if front {
            self.messages.push_front(message);
        } else {
            self.messages.push_back(message);
        }
    }

    fn pop(&mut self) -> Option<Vec<u32>> {
        let message = self.messages.pop_front()?;
        self.available += self.kind.footprint(message.len());
        Some(message)
    }

    fn info(&self) -> QueueInfo {
        QueueInfo {
            name: self.name.clone(),
            kind: self.kind,
            capacity: self.capacity,
            available: self.available,
            messages: self.messages.len(),
            waiting: self.waiters.waiting() + self.urgent.waiting(),
            policy: self.waiters.policy(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Back,
    Front,
    /// Every receiver waiting on the empty queue gets a copy.
    Broadcast,
}

struct SendMessage {
    queue: QueueId,
    message: Vec<u32>,
    placement: Placement,
}

impl Request for SendMessage {
    type Output = ();

    const STATUS: TaskStatus = TaskStatus::QueueSuspend;

    fn object(&self) -> WaitObject {
        match self.placement {
            Placement::Front => WaitObject::QueueUrgent(self.queue),
            Placement::Back | Placement::Broadcast => WaitObject::Queue(self.queue),
        }
    }

    fn wait_request(&self) -> WaitRequest {
        WaitRequest::QueueSend {
            message: self.message.clone(),
        }
    }

    fn validate(&self) -> KernelResult<()> {
        if self.message.is_empty() {
            return Err(Parameter::Message.into());
        }
        Ok(())
    }

    fn attempt(&mut self, state: &mut KernelState) -> KernelResult<Option<()>> {
        state.queue_send(self.queue, &self.message, self.placement)
    }

    fn output(_value: WaitValue) -> KernelResult<()> {
        Ok(())
    }
}

struct ReceiveMessage {
    queue: QueueId,
}

impl Request for ReceiveMessage {
    type Output = Vec<u32>;

    const STATUS: TaskStatus = TaskStatus::QueueSuspend;

    fn object(&self) -> WaitObject {
        WaitObject::Queue(self.queue)
    }

    fn wait_request(&self) -> WaitRequest {
        WaitRequest::QueueReceive
    }

    fn attempt(&mut self, state: &mut KernelState) -> KernelResult<Option<Vec<u32>>> {
        state.queue_receive(self.queue)
    }

    fn output(value: WaitValue) -> KernelResult<Vec<u32>> {
        match value {
            WaitValue::Message(message) => Ok(message),
            _ => Err(KernelError::InvalidSuspend),
        }
    }
}

impl KernelState {
    fn queue_send(&mut self, id: QueueId, message: &[u32], placement: Placement) -> KernelResult<Option<()>> {
        let caller = self
            .current_task()
            .and_then(|task| self.tasks.get(task))
            .map(|tcb| tcb.priority);
        let queue = self
            .queues
            .get(id)
            .ok_or(KernelError::InvalidObject(ObjectKind::Queue))?;
        if !queue.kind.accepts(message.len()) {
            return Err(Parameter::Message.into());
        }

        if queue.messages.is_empty() && queue.waiters.head().is_some() {
            // Waiters of an empty queue are receivers.
            let value = Ok(WaitValue::Message(message.to_vec()));
            if placement == Placement::Broadcast {
                let policy = queue.waiters.policy();
                let receivers = core::mem::replace(&mut self.queues[id].waiters, WaitList::new(policy));
                self.release_waiters(receivers, value);
            } else {
                self.settle_first(WaitObject::Queue(id), value);
            }
            return Ok(Some(()));
        }

        if placement != Placement::Front {
            if let Some(head) = queue.waiters.head() {
                // Earlier senders are still waiting for room. Only a caller
                // that outranks them on a priority queue may go first.
                let outranks = queue.waiters.policy() == SuspendPolicy::Priority
                    && caller.map_or(false, |priority| priority < self.blocks[head].priority);
                if !outranks {
                    return Ok(None);
                }
            }
        }
        if !queue.fits(message.len()) {
            return Ok(None);
        }
        self.queues[id].push(message.to_vec(), placement == Placement::Front);
        Ok(Some(()))
    }

    fn queue_receive(&mut self, id: QueueId) -> KernelResult<Option<Vec<u32>>> {
        let queue = self
            .queues
            .get_mut(id)
            .ok_or(KernelError::InvalidObject(ObjectKind::Queue))?;
        if let Some(block) = queue.urgent.head() {
            queue.urgent.unlink(&mut self.blocks, block);
            let message = self.take_sent_message(block);
            self.settle(block, Ok(WaitValue::None));
            return Ok(Some(message));
        }
        let Some(message) = queue.pop() else {
            return Ok(None);
        };
        self.serve_queue_senders(id);
        Ok(Some(message))
    }

    fn take_sent_message(&mut self, block: BlockId) -> Vec<u32> {
        match &mut self.blocks[block].request {
            WaitRequest::QueueSend { message } => core::mem::take(message),
            _ => Vec::new(),
        }
    }

    /// Move suspended senders' messages into the queue, in resume order,
    /// while the first of them fits.
    fn serve_queue_senders(&mut self, id: QueueId) {
        while let Some(queue) = self.queues.get_mut(id) {
            let Some(block) = queue.waiters.head() else {
                return;
            };
            let fits = match &self.blocks[block].request {
                WaitRequest::QueueSend { message } => queue.fits(message.len()),
                _ => false,
            };
            if !fits {
                return;
            }
            queue.waiters.unlink(&mut self.blocks, block);
            let message = self.take_sent_message(block);
            self.queues[id].push(message, false);
            self.settle(block, Ok(WaitValue::None));
        }
    }

    /// Detach both suspension lists of a queue and resume their tasks.
    fn release_queue_waiters(&mut self, id: QueueId, outcome: KernelError) {
        let Some(queue) = self.queues.get_mut(id) else {
            return;
        };
        let policy = queue.waiters.policy();
        let waiters = core::mem::replace(&mut queue.waiters, WaitList::new(policy));
        let urgent = core::mem::replace(&mut queue.urgent, WaitList::new(policy));
        self.release_waiters(urgent, Err(outcome));
        self.release_waiters(waiters, Err(outcome));
    }
}

impl<A: Arch> Kernel<A> {
    /// Create a queue of `capacity` words.
    ///
    /// A fixed size queue uses the largest multiple of the message size that
    /// fits in `capacity`. The largest message must fit in an empty queue.
    pub fn create_queue(
        &self,
        name: &str,
        capacity: usize,
        kind: MessageKind,
        policy: SuspendPolicy,
    ) -> KernelResult<QueueId> {
        let largest = match kind {
            MessageKind::Fixed(0) | MessageKind::Variable(0) => None,
            MessageKind::Fixed(size) => Some(size),
            MessageKind::Variable(max) => max.checked_add(1),
        };
        if largest.map_or(true, |largest| largest > capacity) {
            return Err(Parameter::Size.into());
        }
        let capacity = match kind {
            MessageKind::Fixed(size) => capacity / size * size,
            MessageKind::Variable(_) => capacity,
        };
        let name = truncate_name(name);

        let mut state = self.enter();
        let id = state.queues.insert_with(|_| Queue {
            name,
            kind,
            capacity,
            available: capacity,
            messages: VecDeque::new(),
            waiters: WaitList::new(policy),
            urgent: WaitList::new(policy),
        });
        state.created_queues.push(id);
        log::debug!("created queue {} ({} words, {:?})", id, capacity, kind);
        Ok(id)
    }

    /// Delete a queue, resuming every waiter with
    /// [`KernelError::ObjectDeleted`]. Queued messages are discarded.
    pub fn delete_queue(&self, queue: QueueId) -> KernelResult<()> {
        let mut state = self.enter();
        if !state.queues.contains(queue) {
            return Err(KernelError::InvalidObject(ObjectKind::Queue));
        }
        state.release_queue_waiters(queue, KernelError::ObjectDeleted);
        state.queues.remove(queue);
        state.created_queues.retain(|&id| id != queue);
        log::debug!("deleted queue {}", queue);
        Ok(())
    }

    /// Discard every message and resume every waiter with
    /// [`KernelError::ObjectReset`].
    pub fn reset_queue(&self, queue: QueueId) -> KernelResult<()> {
        let mut state = self.enter();
        let target = state
            .queues
            .get_mut(queue)
            .ok_or(KernelError::InvalidObject(ObjectKind::Queue))?;
        target.messages.clear();
        target.available = target.capacity;
        state.release_queue_waiters(queue, KernelError::ObjectReset);
        log::debug!("reset queue {}", queue);
        Ok(())
    }

    /// Append `message`, suspending per `suspend` while it does not fit.
    pub fn send_to_queue(
        &self,
        queue: QueueId,
        message: &[u32],
        suspend: Suspend,
    ) -> impl Future<Output = KernelResult<()>> + '_ {
        let request = SendMessage {
            queue,
            message: message.to_vec(),
            placement: Placement::Back,
        };
        Wait::new(self, request, suspend)
    }

    pub fn try_send_to_queue(&self, queue: QueueId, message: &[u32]) -> KernelResult<()> {
        self.try_request(SendMessage {
            queue,
            message: message.to_vec(),
            placement: Placement::Back,
        })
    }

    /// Place `message` ahead of every queued message. Suspended front
    /// senders are served before anything else.
    pub fn send_to_front_of_queue(
        &self,
        queue: QueueId,
        message: &[u32],
        suspend: Suspend,
    ) -> impl Future<Output = KernelResult<()>> + '_ {
        let request = SendMessage {
            queue,
            message: message.to_vec(),
            placement: Placement::Front,
        };
        Wait::new(self, request, suspend)
    }

    /// Give `message` to every receiver waiting on the empty queue, or
    /// append it like [`Kernel::send_to_queue`] when nobody waits.
    pub fn broadcast_to_queue(
        &self,
        queue: QueueId,
        message: &[u32],
        suspend: Suspend,
    ) -> impl Future<Output = KernelResult<()>> + '_ {
        let request = SendMessage {
            queue,
            message: message.to_vec(),
            placement: Placement::Broadcast,
        };
        Wait::new(self, request, suspend)
    }

    /// Take the first message, suspending per `suspend` while the queue is
    /// empty.
    pub fn receive_from_queue(
        &self,
        queue: QueueId,
        suspend: Suspend,
    ) -> impl Future<Output = KernelResult<Vec<u32>>> + '_ {
        Wait::new(self, ReceiveMessage { queue }, suspend)
    }

    pub fn try_receive_from_queue(&self, queue: QueueId) -> KernelResult<Vec<u32>> {
        self.try_request(ReceiveMessage { queue })
    }

    pub fn queue_info(&self, queue: QueueId) -> KernelResult<QueueInfo> {
        self.enter()
            .queues
            .get(queue)
            .map(Queue::info)
            .ok_or(KernelError::InvalidObject(ObjectKind::Queue))
    }

    pub fn created_queues(&self) -> Vec<QueueId> {
        self.enter().created_queues.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_messages_carry_a_length_word() {
        let fixed = MessageKind::Fixed(4);
        assert!(fixed.accepts(4));
        assert!(!fixed.accepts(3));
        assert_eq!(fixed.footprint(4), 4);

        let variable = MessageKind::Variable(4);
        assert!(variable.accepts(1));
        assert!(!variable.accepts(0));
        assert!(!variable.accepts(5));
        assert_eq!(variable.footprint(3), 4);
    }
}
