//! Bounded priority queue with explicit overflow eviction.
//!
//! # Ordering
//!
//! Priority `0` is the most urgent.  Entries are kept sorted by priority, and
//! an entry is inserted *after* every entry of equal priority, so items of the
//! same priority leave in the order they arrived:
//!
//! ```text
//! push 5(a), 1(b), 3(c), 1(d)   →   [1(b), 1(d), 3(c), 5(a)]
//! ```
//!
//! Insertion is a linear scan.  Pool queues are short (tens of entries) and
//! fixed in size, so the scan is cheaper than maintaining a heap plus a
//! sequence tie-breaker.
//!
//! # Overflow
//!
//! Capacity is fixed at construction.  When the queue is full, the oldest
//! entry of the least urgent priority present is evicted to make room and
//! handed back to the caller, so it can be failed explicitly instead of being
//! lost.  If the incoming item is itself less urgent than everything queued,
//! the incoming item is the one refused.  Both outcomes bump the dropped
//! counter.

use std::collections::VecDeque;

/// Anything that can be ordered by a numeric priority (0 = highest).
pub trait Prioritized {
    fn priority(&self) -> u8;
}

/// Outcome of [`BoundedPriorityQueue::push`].
#[derive(Debug, PartialEq, Eq)]
pub enum Enqueued<T> {
    /// Inserted without displacing anything.
    Accepted,
    /// Inserted; the returned entry was evicted to make room.
    Evicted(T),
    /// Not inserted; the queue is full of more urgent work.
    Rejected(T),
}

#[derive(Debug)]
pub struct BoundedPriorityQueue<T> {
    entries: VecDeque<T>,
    capacity: usize,
    dropped: u64,
}

impl<T: Prioritized> BoundedPriorityQueue<T> {
    /// Creates a queue holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries evicted or refused since construction.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// Inserts `item` in priority order, evicting on overflow.
    pub fn push(&mut self, item: T) -> Enqueued<T> {
        if self.entries.len() < self.capacity {
            self.insert_sorted(item);
            return Enqueued::Accepted;
        }

        let worst = self
            .entries
            .back()
            .map(Prioritized::priority)
            .unwrap_or(u8::MAX);
        self.dropped += 1;
        if item.priority() > worst {
            return Enqueued::Rejected(item);
        }

        // Oldest entry of the least urgent priority is the first of the tail group.
        let victim_index = self
            .entries
            .iter()
            .position(|e| e.priority() == worst)
            .unwrap_or(self.entries.len() - 1);
        match self.entries.remove(victim_index) {
            Some(victim) => {
                self.insert_sorted(item);
                Enqueued::Evicted(victim)
            }
            None => Enqueued::Rejected(item),
        }
    }

    /// Removes and returns the most urgent entry.
    pub fn pop(&mut self) -> Option<T> {
        self.entries.pop_front()
    }

    pub fn peek(&self) -> Option<&T> {
        self.entries.front()
    }

    /// Removes the first entry matching `predicate`.
    pub fn remove_first<F>(&mut self, predicate: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let index = self.entries.iter().position(predicate)?;
        self.entries.remove(index)
    }

    /// Empties the queue, returning entries in dequeue order.
    pub fn drain(&mut self) -> Vec<T> {
        self.entries.drain(..).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    fn insert_sorted(&mut self, item: T) {
        let priority = item.priority();
        let index = self
            .entries
            .iter()
            .position(|e| e.priority() > priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(index, item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    struct Job(u8, &'static str);

    impl Prioritized for Job {
        fn priority(&self) -> u8 {
            self.0
        }
    }

    fn names(queue: &mut BoundedPriorityQueue<Job>) -> Vec<&'static str> {
        std::iter::from_fn(|| queue.pop()).map(|j| j.1).collect()
    }

    #[test]
    fn test_lower_priority_value_dequeues_first() {
        let mut queue = BoundedPriorityQueue::new(8);
        queue.push(Job(5, "five"));
        queue.push(Job(1, "one"));
        queue.push(Job(3, "three"));
        assert_eq!(names(&mut queue), vec!["one", "three", "five"]);
    }

    #[test]
    fn test_equal_priorities_keep_enqueue_order() {
        let mut queue = BoundedPriorityQueue::new(8);
        queue.push(Job(2, "a"));
        queue.push(Job(0, "urgent"));
        queue.push(Job(2, "b"));
        queue.push(Job(2, "c"));
        assert_eq!(names(&mut queue), vec!["urgent", "a", "b", "c"]);
    }

    #[test]
    fn test_overflow_evicts_oldest_least_urgent_entry() {
        let mut queue = BoundedPriorityQueue::new(3);
        queue.push(Job(1, "keep"));
        queue.push(Job(7, "old-low"));
        queue.push(Job(7, "new-low"));

        let outcome = queue.push(Job(4, "incoming"));

        assert_eq!(outcome, Enqueued::Evicted(Job(7, "old-low")));
        assert_eq!(queue.dropped_count(), 1);
        assert_eq!(names(&mut queue), vec!["keep", "incoming", "new-low"]);
    }

    #[test]
    fn test_overflow_with_equal_priority_overwrites_oldest() {
        let mut queue = BoundedPriorityQueue::new(2);
        queue.push(Job(3, "first"));
        queue.push(Job(3, "second"));
        assert_eq!(queue.push(Job(3, "third")), Enqueued::Evicted(Job(3, "first")));
        assert_eq!(names(&mut queue), vec!["second", "third"]);
    }

    #[test]
    fn test_overflow_refuses_item_less_urgent_than_everything() {
        let mut queue = BoundedPriorityQueue::new(2);
        queue.push(Job(0, "a"));
        queue.push(Job(1, "b"));
        assert_eq!(queue.push(Job(9, "late")), Enqueued::Rejected(Job(9, "late")));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped_count(), 1);
    }

    #[test]
    fn test_remove_first_takes_matching_entry() {
        let mut queue = BoundedPriorityQueue::new(4);
        queue.push(Job(1, "x"));
        queue.push(Job(2, "y"));
        assert_eq!(queue.remove_first(|j| j.1 == "y"), Some(Job(2, "y")));
        assert_eq!(queue.remove_first(|j| j.1 == "missing"), None);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_zero_capacity_is_clamped_to_one() {
        let mut queue: BoundedPriorityQueue<Job> = BoundedPriorityQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        assert_eq!(queue.push(Job(0, "only")), Enqueued::Accepted);
    }
}
