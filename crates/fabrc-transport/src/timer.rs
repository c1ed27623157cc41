//! Cooperative timer queue.
//!
//! Timers are keyed; a key is either armed with one deadline or idle.
//! Nothing runs on its own: the progress loop pops expired keys with
//! [`TimerQueue::pop_expired`] and dispatches them.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;
use std::time::Instant;

#[derive(Debug)]
pub struct TimerQueue<K: Copy + Eq + Hash + Ord> {
    deadlines: HashMap<K, Instant>,
    heap: BinaryHeap<Reverse<(Instant, K)>>,
}

impl<K: Copy + Eq + Hash + Ord> Default for TimerQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Copy + Eq + Hash + Ord> TimerQueue<K> {
    pub fn new() -> Self {
        Self {
            deadlines: HashMap::new(),
            heap: BinaryHeap::new(),
        }
    }

    /// Arms `key` at `at` unless it is already armed no later than that.
    pub fn request(&mut self, key: K, at: Instant) {
        match self.deadlines.get(&key) {
            Some(existing) if *existing <= at => {}
            _ => self.reschedule(key, at),
        }
    }

    /// Arms `key` at exactly `at`, replacing any earlier deadline.
    pub fn reschedule(&mut self, key: K, at: Instant) {
        self.deadlines.insert(key, at);
        self.heap.push(Reverse((at, key)));
    }

    pub fn cancel(&mut self, key: K) {
        self.deadlines.remove(&key);
    }

    pub fn is_armed(&self, key: K) -> bool {
        self.deadlines.contains_key(&key)
    }

    pub fn deadline(&self, key: K) -> Option<Instant> {
        self.deadlines.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Earliest armed deadline.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.discard_stale();
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    /// Disarms and returns one key whose deadline is at or before `now`.
    pub fn pop_expired(&mut self, now: Instant) -> Option<K> {
        self.discard_stale();
        let Reverse((at, key)) = *self.heap.peek()?;
        if at > now {
            return None;
        }
        self.heap.pop();
        self.deadlines.remove(&key);
        Some(key)
    }

    fn discard_stale(&mut self) {
        while let Some(Reverse((at, key))) = self.heap.peek() {
            if self.deadlines.get(key) == Some(at) {
                break;
            }
            self.heap.pop();
        }
    }
}
