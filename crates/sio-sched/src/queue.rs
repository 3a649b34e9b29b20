//! Ready queue of active streams.
//!
//! Ordered by priority, highest first, then by activation sequence. A
//! stream that is serviced and still has work is pushed again with a fresh
//! sequence number, which gives round-robin among equal priorities.

use sio_types::{Priority, StreamId};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<Priority>,
    seq: u64,
    stream: StreamId,
}

#[derive(Debug, Default)]
pub struct Queue {
    order: BTreeSet<QueueKey>,
    members: HashMap<StreamId, QueueKey>,
    next_seq: u64,
}

impl Queue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate `stream`. Returns `false` if it is already queued.
    pub fn push(&mut self, stream: StreamId, priority: Priority) -> bool {
        if self.members.contains_key(&stream) {
            return false;
        }
        let key = QueueKey {
            priority: Reverse(priority),
            seq: self.next_seq,
            stream,
        };
        self.next_seq += 1;
        self.order.insert(key);
        self.members.insert(stream, key);
        true
    }

    /// Remove and return the highest-priority, longest-waiting stream.
    pub fn pop(&mut self) -> Option<StreamId> {
        let key = self.order.pop_first()?;
        self.members.remove(&key.stream);
        Some(key.stream)
    }

    /// Returns `false` if `stream` was not queued.
    pub fn remove(&mut self, stream: StreamId) -> bool {
        match self.members.remove(&stream) {
            Some(key) => self.order.remove(&key),
            None => false,
        }
    }

    #[must_use]
    pub fn contains(&self, stream: StreamId) -> bool {
        self.members.contains_key(&stream)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}
