//! Bounded set of recently dispatched ids.

use std::collections::{HashSet, VecDeque};

/// Remembers the last `capacity` ids; the oldest is evicted first.
///
/// Only closes the window between two overlapping scans of the same process.
/// It is not persisted, so it gives no protection across restarts.
#[derive(Debug)]
pub struct RecentlySeen {
    capacity: usize,
    order: VecDeque<u64>,
    members: HashSet<u64>,
}

impl RecentlySeen {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.members.contains(&id)
    }

    /// Insert `id`. Returns `false` if it was already present.
    pub fn insert(&mut self, id: u64) -> bool {
        if !self.members.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
