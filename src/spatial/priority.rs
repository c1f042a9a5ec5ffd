//! Creation queue ordered by scene contribution

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::entry::EntryId;

/// Queued entry with its score
#[derive(Clone, Copy, Debug)]
pub struct QueuedEntry {
    pub id: EntryId,
    pub contribution: f32,
    seq: u64,
}

impl Eq for QueuedEntry {}

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher contribution first, then earlier insertion
        self.contribution
            .total_cmp(&other.contribution)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Entries waiting to be turned into live objects
#[derive(Default)]
pub struct CreationQueue {
    heap: BinaryHeap<QueuedEntry>,
    next_seq: u64,
}

impl CreationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: EntryId, contribution: f32) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedEntry { id, contribution, seq });
    }

    /// Highest contribution first; equal scores come out in insertion order
    pub fn pop(&mut self) -> Option<QueuedEntry> {
        self.heap.pop()
    }

    pub fn peek(&self) -> Option<&QueuedEntry> {
        self.heap.peek()
    }

    /// Pop up to `budget` entries
    pub fn take(&mut self, budget: usize) -> Vec<QueuedEntry> {
        let mut out = Vec::with_capacity(budget.min(self.heap.len()));
        while out.len() < budget {
            let Some(entry) = self.heap.pop() else {
                break;
            };
            out.push(entry);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::arena::Arena;
    use crate::entry::CacheEntry;

    fn ids(n: u32) -> Vec<EntryId> {
        let mut arena = Arena::new();
        (0..n).map(|i| arena.insert(CacheEntry::from_update(i, 0, vec![0]))).collect()
    }

    #[test]
    fn test_highest_contribution_first() {
        let id = ids(4);
        let mut queue = CreationQueue::new();
        queue.push(id[0], 0.5);
        queue.push(id[1], 1000.0);
        queue.push(id[2], 0.0);
        queue.push(id[3], 12.0);

        let order: Vec<EntryId> = std::iter::from_fn(|| queue.pop().map(|q| q.id)).collect();
        assert_eq!(order, vec![id[1], id[3], id[0], id[2]]);
    }

    #[test]
    fn test_ties_keep_insertion_order() {
        let id = ids(3);
        let mut queue = CreationQueue::new();
        for i in &id {
            queue.push(*i, 7.0);
        }
        let order: Vec<EntryId> = queue.take(10).into_iter().map(|q| q.id).collect();
        assert_eq!(order, id);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_take_respects_budget() {
        let id = ids(5);
        let mut queue = CreationQueue::new();
        for (i, e) in id.iter().enumerate() {
            queue.push(*e, i as f32);
        }
        assert_eq!(queue.take(2).len(), 2);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.peek().map(|q| q.contribution), Some(2.0));
    }
}
