//! Error handling for kernel services.
//!
//! Recoverable failures are reported through [`KernelError`]; every public
//! service validates its arguments and the identity of the objects it is
//! handed before anything is mutated, so an `Err` always means "nothing
//! happened". Structural violations detected inside the schedule lock are
//! [`FatalError`]s and are routed to [`Arch::fatal_error`](crate::arch::Arch::fatal_error),
//! which never returns.

#![allow(clippy::uninlined_format_args)]

use crate::thread::TaskId;
use core::fmt;

/// Result type for kernel services.
pub type KernelResult<T> = Result<T, KernelError>;

/// Error kinds returned by kernel services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The identity tag of the object is stale, or the object was never created.
    InvalidObject(ObjectKind),
    /// An argument is out of range.
    InvalidParameter(Parameter),
    /// Suspension was requested from a non-task context, or the timeout is nonsensical.
    InvalidSuspend,
    /// The task is not suspended for the reason the resume tries to clear.
    InvalidResume,
    /// The task is neither finished nor terminated, or it is the caller.
    InvalidDelete,
    /// The request could not be satisfied and the caller asked not to wait.
    NoResourceAvailable,
    /// The suspension expired.
    Timeout,
    /// The object was deleted while the caller was suspended on it.
    ObjectDeleted,
    /// The object was reset while the caller was suspended on it.
    ObjectReset,
    /// A memory region does not start on the allocation granule.
    NotAligned,
}

/// The kind of object an [`KernelError::InvalidObject`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Task,
    MemoryPool,
    PartitionPool,
    Semaphore,
    EventGroup,
    Queue,
}

/// The argument an [`KernelError::InvalidParameter`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameter {
    /// A size or count is zero or too large for the pool.
    Size,
    /// An alignment is not a power of two.
    Alignment,
    /// A pointer does not designate a live allocation of any pool.
    Pointer,
    /// The stack region cannot hold the canary and the task entry.
    Stack,
    /// An event mask is empty.
    Events,
    /// A message is empty or does not match the queue's message size.
    Message,
}

/// Unrecoverable kernel-internal conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalError {
    /// The canary at the base of a task's stack region was overwritten.
    StackOverflow(TaskId),
    /// The kernel state lock was requested while already held.
    LockReentered,
    /// An internal link names a control block that no longer exists.
    StaleIdentity { index: u32, tag: u32 },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::InvalidObject(kind) => write!(f, "Invalid {} identity", kind),
            KernelError::InvalidParameter(which) => write!(f, "Invalid parameter: {}", which),
            KernelError::InvalidSuspend => write!(f, "Suspension not allowed here"),
            KernelError::InvalidResume => write!(f, "Task is not suspended for this reason"),
            KernelError::InvalidDelete => write!(f, "Task cannot be deleted in its current state"),
            KernelError::NoResourceAvailable => write!(f, "Resource not available"),
            KernelError::Timeout => write!(f, "Suspension timed out"),
            KernelError::ObjectDeleted => write!(f, "Object deleted while suspended"),
            KernelError::ObjectReset => write!(f, "Object reset while suspended"),
            KernelError::NotAligned => write!(f, "Memory region is not aligned"),
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectKind::Task => "task",
            ObjectKind::MemoryPool => "memory pool",
            ObjectKind::PartitionPool => "partition pool",
            ObjectKind::Semaphore => "semaphore",
            ObjectKind::EventGroup => "event group",
            ObjectKind::Queue => "queue",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parameter::Size => write!(f, "size"),
            Parameter::Alignment => write!(f, "alignment"),
            Parameter::Pointer => write!(f, "pointer"),
            Parameter::Stack => write!(f, "stack region"),
            Parameter::Events => write!(f, "event mask"),
            Parameter::Message => write!(f, "message size"),
        }
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalError::StackOverflow(task) => write!(f, "Stack overflow detected in task {}", task),
            FatalError::LockReentered => write!(f, "Schedule lock re-entered"),
            FatalError::StaleIdentity { index, tag } => {
                write!(f, "Stale object identity {}#{} in kernel links", index, tag)
            }
        }
    }
}

impl From<ObjectKind> for KernelError {
    fn from(kind: ObjectKind) -> Self {
        KernelError::InvalidObject(kind)
    }
}

impl From<Parameter> for KernelError {
    fn from(which: Parameter) -> Self {
        KernelError::InvalidParameter(which)
    }
}
