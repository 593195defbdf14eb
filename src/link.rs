use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{macros::fatal, task::TaskId};

const NO_LINK: usize = usize::MAX;

/// Head of a singly linked list of tasks stored in a [`LinkTable`].
#[derive(Debug)]
pub struct LinkHead(AtomicUsize);

impl Default for LinkHead {
    fn default() -> Self {
        Self(AtomicUsize::new(NO_LINK))
    }
}

impl LinkHead {
    pub fn is_empty(&self) -> bool {
        self.0.load(Ordering::Acquire) == NO_LINK
    }
}

#[derive(Debug, Clone, Copy)]
struct Link {
    task: TaskId,
    next: usize,
}

/// Pre-sized arena of cell-task links.
///
/// Links are appended concurrently by bumping `count` and swapping the
/// cell's head; nodes are never freed individually, only the whole table is
/// reset at rebuild time.
#[derive(Debug)]
pub struct LinkTable {
    links: Vec<AtomicLink>,
    count: AtomicUsize,
}

#[derive(Debug)]
struct AtomicLink {
    task: AtomicUsize,
    next: AtomicUsize,
}

impl LinkTable {
    pub fn new(size: usize) -> Self {
        Self {
            links: (0..size)
                .map(|_| AtomicLink {
                    task: AtomicUsize::new(0),
                    next: AtomicUsize::new(NO_LINK),
                })
                .collect(),
            count: AtomicUsize::new(0),
        }
    }

    /// Size of the table for `tot_cells` cells: 26 neighbours times the
    /// number of pair interaction kinds plus the self interactions.
    pub fn required_size(tot_cells: usize, with_gradient_loop: bool) -> usize {
        if with_gradient_loop {
            tot_cells * (26 * 4 + 4)
        } else {
            tot_cells * (26 * 3 + 4)
        }
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire).min(self.links.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.links.len()
    }

    /// Prepend `task` to the list starting at `head`.
    pub fn add(&self, head: &LinkHead, task: TaskId) {
        let ind = self.count.fetch_add(1, Ordering::AcqRel);
        if ind >= self.links.len() {
            fatal!("Link table overflow (size {}).", self.links.len());
        }
        let slot = &self.links[ind];
        slot.task.store(task, Ordering::Relaxed);
        let previous = head.0.swap(ind, Ordering::AcqRel);
        slot.next.store(previous, Ordering::Release);
    }

    /// Iterate over the tasks of the list starting at `head`.
    ///
    /// Only valid once all concurrent appends have completed.
    pub fn iter<'a>(&'a self, head: &LinkHead) -> LinkIter<'a> {
        LinkIter {
            table: self,
            current: head.0.load(Ordering::Acquire),
        }
    }

    fn get(&self, ind: usize) -> Link {
        let slot = &self.links[ind];
        Link {
            task: slot.task.load(Ordering::Relaxed),
            next: slot.next.load(Ordering::Acquire),
        }
    }
}

pub struct LinkIter<'a> {
    table: &'a LinkTable,
    current: usize,
}

impl<'a> Iterator for LinkIter<'a> {
    type Item = TaskId;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current == NO_LINK {
            return None;
        }
        let link = self.table.get(self.current);
        self.current = link.next;
        Some(link.task)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn test_concurrent_append() {
        let table = LinkTable::new(1000);
        let heads: Vec<LinkHead> = (0..4).map(|_| LinkHead::default()).collect();
        (0..1000usize).into_par_iter().for_each(|t| table.add(&heads[t % 4], t));
        assert_eq!(table.len(), 1000);
        for (k, head) in heads.iter().enumerate() {
            let mut tasks: Vec<_> = table.iter(head).collect();
            tasks.sort();
            assert_eq!(tasks.len(), 250);
            assert!(tasks.iter().all(|t| t % 4 == k));
        }
    }

    #[test]
    #[should_panic]
    fn test_overflow_is_fatal() {
        let table = LinkTable::new(1);
        let head = LinkHead::default();
        table.add(&head, 0);
        table.add(&head, 1);
    }
}
