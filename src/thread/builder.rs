//! Task builder for configuring task creation.

use crate::config::MAX_NAME;
use alloc::string::String;

/// Builder for the parameters of a new task.
///
/// The stack region and the entry future are passed to
/// [`Kernel::create_task`](crate::Kernel::create_task) together with the builder.
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    pub(crate) name: String,
    pub(crate) priority: u8,
    pub(crate) preemptible: bool,
    pub(crate) time_slice: Option<u32>,
    pub(crate) auto_start: bool,
}

impl TaskBuilder {
    /// Create a builder with priority 128, preemption enabled, the
    /// configured default time slice and auto start.
    pub fn new() -> Self {
        Self {
            name: String::new(),
            priority: 128,
            preemptible: true,
            time_slice: None,
            auto_start: true,
        }
    }

    /// Set the task name. Only the first eight bytes are kept.
    pub fn name(mut self, name: &str) -> Self {
        self.name = truncate_name(name);
        self
    }

    /// Set the task priority (0 is the highest).
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Allow or forbid preemption by higher-priority tasks.
    pub fn preemptible(mut self, preemptible: bool) -> Self {
        self.preemptible = preemptible;
        self
    }

    /// Set the time slice in ticks. Zero disables time slicing for the task.
    pub fn time_slice(mut self, ticks: u32) -> Self {
        self.time_slice = Some(ticks);
        self
    }

    /// Leave the task pure-suspended after creation instead of readying it.
    pub fn start_suspended(mut self) -> Self {
        self.auto_start = false;
        self
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Keep at most [`MAX_NAME`] bytes, cutting on a character boundary.
pub(crate) fn truncate_name(name: &str) -> String {
    let mut end = name.len().min(MAX_NAME);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    String::from(&name[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_truncated_on_char_boundaries() {
        assert_eq!(truncate_name("producer_task"), "producer");
        assert_eq!(truncate_name("tâche_long"), "tâche_l");
        assert_eq!(TaskBuilder::new().name("idle").name, "idle");
    }
}
