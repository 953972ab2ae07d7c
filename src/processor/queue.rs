use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::feed::Task;

/// Priority queue of pending tasks.
///
/// Higher `priority` pops first. Tasks with equal priority pop in the order
/// they were pushed, so the schedule is deterministic for a given input.
#[derive(Debug, Default)]
pub struct TaskQueue {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
}

#[derive(Debug)]
struct Queued {
    priority: i32,
    seq: u64,
    task: Task,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: larger priority first, then the earlier sequence number
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: Task) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Queued {
            priority: task.priority,
            seq,
            task,
        });
    }

    pub fn pop(&mut self) -> Option<Task> {
        self.heap.pop().map(|q| q.task)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Empties the queue, yielding tasks in scheduling order.
    pub fn drain_ordered(&mut self) -> impl Iterator<Item = Task> + '_ {
        std::iter::from_fn(move || self.pop())
    }
}

impl FromIterator<Task> for TaskQueue {
    fn from_iter<I: IntoIterator<Item = Task>>(iter: I) -> Self {
        let mut queue = TaskQueue::new();
        for task in iter {
            queue.push(task);
        }
        queue
    }
}
