//! Priority queue with stable ordering for equal priorities

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// An item with its priority and insertion sequence
#[derive(Debug)]
struct Entry<T> {
    priority: f32,
    seq: u64,
    item: T,
}

impl<T> Eq for Entry<T> {}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first (max-heap); earlier insertion wins ties.
        // total_cmp keeps NaN/infinity from breaking the heap.
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-priority queue. Items with equal priority pop in insertion order.
pub struct PriorityQueue<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Add an item at the given priority (higher = sooner)
    pub fn push(&mut self, priority: f32, item: T) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry { priority, seq, item });
    }

    /// Remove and return the highest priority item with its priority
    pub fn pop(&mut self) -> Option<(f32, T)> {
        self.heap.pop().map(|e| (e.priority, e.item))
    }

    /// Priority of the item `pop` would return
    pub fn peek_priority(&self) -> Option<f32> {
        self.heap.peek().map(|e| e.priority)
    }

    pub fn peek(&self) -> Option<&T> {
        self.heap.peek().map(|e| &e.item)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Iterate items in arbitrary order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.heap.iter().map(|e| &e.item)
    }

    /// Remove every item matching `pred`, returned in priority order
    pub fn remove_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let (mut removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.heap)
            .into_vec()
            .into_iter()
            .partition(|e| pred(&e.item));
        self.heap = BinaryHeap::from(kept);
        removed.sort_by(|a, b| b.cmp(a));
        removed.into_iter().map(|e| e.item).collect()
    }

    /// Remove all items, returned in priority order
    pub fn drain_ordered(&mut self) -> Vec<T> {
        std::mem::take(&mut self.heap)
            .into_sorted_vec()
            .into_iter()
            .rev()
            .map(|e| e.item)
            .collect()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}
