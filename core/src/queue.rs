use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use crate::task::TaskId;

#[derive(Debug, Clone)]
pub struct QueueItem {
    pub task_id: TaskId,
    /// Zero for the first run, incremented on each back-off retry.
    pub attempt: u32,
    pub due: Instant,
    pub seq: u64,
}

impl QueueItem {
    pub fn new(task_id: TaskId, attempt: u32, due: Instant, seq: u64) -> Self {
        Self {
            task_id,
            attempt,
            due,
            seq,
        }
    }
}

impl Eq for QueueItem {}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq && self.task_id == other.task_id
    }
}

// BinaryHeap is a max-heap: the earliest due time, then the earliest
// insertion, compares greatest.
impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
            .then_with(|| self.task_id.cmp(&other.task_id))
    }
}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    heap: BinaryHeap<QueueItem>,
}

impl TaskQueue {
    pub fn push(&mut self, item: QueueItem) {
        self.heap.push(item);
    }

    /// Pops the head only if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<QueueItem> {
        if self.heap.peek()?.due <= now {
            self.heap.pop()
        } else {
            None
        }
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|item| item.due)
    }

    pub fn remove(&mut self, task_id: &str) -> bool {
        let before = self.heap.len();
        self.heap.retain(|item| item.task_id != task_id);
        self.heap.len() != before
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.heap.iter().any(|item| item.task_id == task_id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
