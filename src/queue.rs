use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::task::TaskId;

#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    weight: i64,
    task: TaskId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.weight.cmp(&other.weight).then(other.task.cmp(&self.task))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Ready list of one worker: a max-heap on task weight.
#[derive(Debug, Default)]
pub struct Queue {
    heap: Mutex<BinaryHeap<QueueEntry>>,
    count: AtomicUsize,
}

impl Queue {
    pub fn insert(&self, task: TaskId, weight: i64) {
        let mut heap = self.heap.lock();
        heap.push(QueueEntry { weight, task });
        self.count.store(heap.len(), Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return the heaviest task for which `try_lock` succeeds.
    ///
    /// Tasks that cannot be locked right now stay in the queue.
    pub fn get_task(&self, mut try_lock: impl FnMut(TaskId) -> bool) -> Option<TaskId> {
        if self.is_empty() {
            return None;
        }
        let mut heap = self.heap.lock();
        let mut deferred = vec![];
        let mut found = None;
        while let Some(entry) = heap.pop() {
            if try_lock(entry.task) {
                found = Some(entry.task);
                break;
            }
            deferred.push(entry);
        }
        heap.extend(deferred);
        self.count.store(heap.len(), Ordering::Release);
        found
    }

    pub fn clear(&self) {
        let mut heap = self.heap.lock();
        heap.clear();
        self.count.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_heaviest_first() {
        let queue = Queue::default();
        queue.insert(0, 5);
        queue.insert(1, 50);
        queue.insert(2, 10);
        assert_eq!(queue.get_task(|_| true), Some(1));
        assert_eq!(queue.get_task(|_| true), Some(2));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_locked_tasks_stay_queued() {
        let queue = Queue::default();
        queue.insert(0, 5);
        queue.insert(1, 50);
        assert_eq!(queue.get_task(|t| t != 1), Some(0));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get_task(|t| t != 1), None);
        assert_eq!(queue.get_task(|_| true), Some(1));
        assert!(queue.is_empty());
    }
}
