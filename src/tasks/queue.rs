use std::collections::VecDeque;

use super::DhtTask;

#[derive(Debug, Default)]
/// Pending internal tasks.
///
/// Periodic queues hold maintenance and bootstrap work, the immediate queue
/// holds reactions to incoming traffic like replacing a node. Every tick the
/// head of each queue is handed out.
pub struct TaskQueue {
    periodic1: VecDeque<Box<dyn DhtTask>>,
    periodic2: VecDeque<Box<dyn DhtTask>>,
    immediate: VecDeque<Box<dyn DhtTask>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_periodic_task1(&mut self, task: Box<dyn DhtTask>) {
        self.periodic1.push_back(task);
    }

    pub fn add_periodic_task2(&mut self, task: Box<dyn DhtTask>) {
        self.periodic2.push_back(task);
    }

    pub fn add_immediate_task(&mut self, task: Box<dyn DhtTask>) {
        self.immediate.push_back(task);
    }

    /// Takes at most one task of each queue.
    ///
    /// Tasks are run by the caller after releasing the queue, so they are free
    /// to schedule more tasks.
    pub fn take_ready(&mut self) -> Vec<Box<dyn DhtTask>> {
        [
            self.periodic1.pop_front(),
            self.periodic2.pop_front(),
            self.immediate.pop_front(),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    pub fn periodic1_len(&self) -> usize {
        self.periodic1.len()
    }

    pub fn periodic2_len(&self) -> usize {
        self.periodic2.len()
    }

    pub fn immediate_len(&self) -> usize {
        self.immediate.len()
    }

    pub fn is_empty(&self) -> bool {
        self.periodic1.is_empty() && self.periodic2.is_empty() && self.immediate.is_empty()
    }
}
