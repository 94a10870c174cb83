//! Cancellable timers: a min-heap of deadlines with lazy deletion.
//!
//! Structures that schedule work keep the returned [`TimerHandle`] and cancel
//! it when they are torn down. Cancelled entries stay in the heap until they
//! surface and are skipped.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use crate::time::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

pub struct TimerQueue<T> {
    heap: BinaryHeap<Reverse<(Timestamp, u64)>>,
    live: HashMap<u64, T>,
    next_id: u64,
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn schedule(&mut self, at: Timestamp, event: T) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((at, id)));
        self.live.insert(id, event);
        TimerHandle(id)
    }

    pub fn cancel(&mut self, handle: TimerHandle) -> Option<T> {
        self.live.remove(&handle.0)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    fn discard_cancelled(&mut self) {
        while let Some(Reverse((_, id))) = self.heap.peek() {
            if self.live.contains_key(id) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Earliest live deadline.
    pub fn next_deadline(&mut self) -> Option<Timestamp> {
        self.discard_cancelled();
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    /// Remove and return the earliest event due at or before `now`.
    pub fn pop_due(&mut self, now: Timestamp) -> Option<T> {
        self.discard_cancelled();
        match self.heap.peek() {
            Some(Reverse((at, _))) if *at <= now => {}
            _ => return None,
        }
        let Reverse((_, id)) = self.heap.pop()?;
        self.live.remove(&id)
    }
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_deadline_order() {
        let mut q = TimerQueue::new();
        q.schedule(Timestamp::from_millis(30), "c");
        q.schedule(Timestamp::from_millis(10), "a");
        q.schedule(Timestamp::from_millis(20), "b");
        assert_eq!(q.next_deadline(), Some(Timestamp::from_millis(10)));
        let now = Timestamp::from_millis(25);
        assert_eq!(q.pop_due(now), Some("a"));
        assert_eq!(q.pop_due(now), Some("b"));
        assert_eq!(q.pop_due(now), None);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn cancelled_timers_never_fire() {
        let mut q = TimerQueue::new();
        let h = q.schedule(Timestamp::from_millis(1), 1);
        q.schedule(Timestamp::from_millis(2), 2);
        assert_eq!(q.cancel(h), Some(1));
        assert_eq!(q.cancel(h), None);
        assert_eq!(q.next_deadline(), Some(Timestamp::from_millis(2)));
        assert_eq!(q.pop_due(Timestamp::MAX), Some(2));
        assert!(q.is_empty());
        assert_eq!(q.next_deadline(), None);
    }
}
