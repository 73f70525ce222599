//! Indexed priority queue: a hybrid array-based binary heap plus a hash
//! map from handle to heap index, so that an entry can be retrieved or
//! cancelled by handle in expected O(1) while still popping in priority
//! order in O(log n).
//!
//! Both the event queue's ordering ("earlier time first, then higher
//! priority first, then FIFO") and a resource guard's ordering ("higher
//! priority first, then FIFO within equal priority" — priority is
//! *primary*, not a tiebreaker) read off the same two keys, `dkey` and
//! `ikey`, but do not agree on which one dominates; [`Order`] picks the
//! comparator an [`IndexedPQueue`] is built with.

use std::collections::HashMap;

/// Opaque, non-zero handle stable for the life of an entry.
pub type Handle = u64;

struct Slot<T> {
    handle: Handle,
    dkey: f64,
    ikey: i64,
    seq: u64,
    item: T,
}

/// Which key dominates the ordering. Both variants break ties on the
/// insertion sequence last, for FIFO-within-equal-keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// `dkey` ascending, then `ikey` descending, then insertion order —
    /// "earlier time first, then higher priority first, then FIFO": the
    /// event queue's ordering (spec.md §4.3).
    TimeThenPriority,
    /// `ikey` descending, then `dkey` ascending, then insertion order —
    /// "higher priority first, then FIFO within equal priority": a
    /// resource guard's ordering (spec.md §4.5), where `dkey` is the
    /// entry time rather than the event time.
    PriorityThenTime,
}

fn less<T>(order: Order, a: &Slot<T>, b: &Slot<T>) -> bool {
    match order {
        Order::TimeThenPriority => (a.dkey, -a.ikey, a.seq) < (b.dkey, -b.ikey, b.seq),
        Order::PriorityThenTime => (-a.ikey, a.dkey, a.seq) < (-b.ikey, b.dkey, b.seq),
    }
}

/// An indexed min-priority-queue over `(dkey, ikey, insertion order)`,
/// ordered according to an [`Order`] fixed at construction.
pub struct IndexedPQueue<T> {
    heap: Vec<Slot<T>>,
    index: HashMap<Handle, usize>,
    next_handle: Handle,
    next_seq: u64,
    order: Order,
}

impl<T> IndexedPQueue<T> {
    /// An event-queue-ordered instance: `dkey` (time) dominates.
    pub fn new() -> Self {
        Self::with_order(Order::TimeThenPriority)
    }

    /// A resource-guard-ordered instance: `ikey` (priority) dominates.
    pub fn new_guard() -> Self {
        Self::with_order(Order::PriorityThenTime)
    }

    pub fn with_order(order: Order) -> Self {
        IndexedPQueue {
            heap: Vec::new(),
            index: HashMap::new(),
            next_handle: 1,
            next_seq: 0,
            order,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// `enqueue(item, dkey, ikey) -> handle`.
    pub fn enqueue(&mut self, item: T, dkey: f64, ikey: i64) -> Handle {
        let handle = self.next_handle;
        self.next_handle += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        let pos = self.heap.len();
        self.heap.push(Slot {
            handle,
            dkey,
            ikey,
            seq,
            item,
        });
        self.index.insert(handle, pos);
        self.sift_up(pos);
        handle
    }

    pub fn peek(&self) -> Option<(Handle, &T)> {
        self.heap.first().map(|s| (s.handle, &s.item))
    }

    pub fn peek_keys(&self) -> Option<(f64, i64)> {
        self.heap.first().map(|s| (s.dkey, s.ikey))
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.index.contains_key(&handle)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.index.get(&handle).map(|&i| &self.heap[i].item)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        let &i = self.index.get(&handle)?;
        Some(&mut self.heap[i].item)
    }

    pub fn keys_of(&self, handle: Handle) -> Option<(f64, i64)> {
        let &i = self.index.get(&handle)?;
        Some((self.heap[i].dkey, self.heap[i].ikey))
    }

    /// Remove and return the minimum entry.
    pub fn pop(&mut self) -> Option<(Handle, T)> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let slot = self.heap.pop().unwrap();
        self.index.remove(&slot.handle);
        if !self.heap.is_empty() {
            self.index.insert(self.heap[0].handle, 0);
            self.sift_down(0);
        }
        Some((slot.handle, slot.item))
    }

    /// Remove a live entry by handle in O(log n), expected O(1) lookup.
    pub fn cancel(&mut self, handle: Handle) -> Option<T> {
        let pos = self.index.remove(&handle)?;
        let last = self.heap.len() - 1;
        self.heap.swap(pos, last);
        let slot = self.heap.pop().unwrap();
        if pos < self.heap.len() {
            self.index.insert(self.heap[pos].handle, pos);
            self.sift_up(pos);
            self.sift_down(pos);
        }
        Some(slot.item)
    }

    /// Update a live entry's keys and restore heap order.
    pub fn reprioritize(&mut self, handle: Handle, new_dkey: f64, new_ikey: i64) {
        let pos = *self
            .index
            .get(&handle)
            .unwrap_or_else(|| crate::error::fatal("reprioritize() on a handle that is not live"));
        self.heap[pos].dkey = new_dkey;
        self.heap[pos].ikey = new_ikey;
        self.sift_up(pos);
        self.sift_down(pos);
    }

    /// Remove every entry for which `matches` returns true; returns how
    /// many were removed. Used for both `pattern_cancel` and for cancelling
    /// a process's entries out of a resource guard.
    pub fn retain_remove<F>(&mut self, mut matches: F) -> Vec<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut removed = Vec::new();
        let handles: Vec<Handle> = self
            .heap
            .iter()
            .filter(|s| matches(&s.item))
            .map(|s| s.handle)
            .collect();
        for h in handles {
            if let Some(item) = self.cancel(h) {
                removed.push(item);
            }
        }
        removed
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if less(self.order, &self.heap[pos], &self.heap[parent]) {
                self.swap_slots(pos, parent);
                pos = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            let right = 2 * pos + 2;
            let mut smallest = pos;
            if left < self.heap.len() && less(self.order, &self.heap[left], &self.heap[smallest]) {
                smallest = left;
            }
            if right < self.heap.len() && less(self.order, &self.heap[right], &self.heap[smallest]) {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.swap_slots(pos, smallest);
            pos = smallest;
        }
    }

    fn swap_slots(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.index.insert(self.heap[a].handle, a);
        self.index.insert(self.heap[b].handle, b);
    }
}

impl<T> Default for IndexedPQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
