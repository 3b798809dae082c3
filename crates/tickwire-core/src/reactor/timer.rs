//! Deadline queue for timers and descriptor timeouts.
//!
//! A min-heap ordered by deadline with lazy invalidation: disabling,
//! re-arming or cancelling a subscription never searches the heap.  Each slot
//! records the generation of the entry at the time it was armed, and the
//! reactor discards slots whose generation no longer matches.
//!
//! # Complexity
//!
//! - Arm: O(log n)
//! - Invalidate: O(1) (generation bump on the entry)
//! - Pop expired: O(k log n) where k = number of expired slots

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

use super::subscription::SubscriptionId;

/// One armed deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Deadline {
    pub(crate) at: Instant,
    pub(crate) id: SubscriptionId,
    pub(crate) generation: u64,
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse for a min-heap; ties resolve in registration order.
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.id.cmp(&self.id))
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Deadline>,
}

impl TimerQueue {
    pub(crate) fn push(&mut self, deadline: Deadline) {
        self.heap.push(deadline);
    }

    /// Earliest slot still considered live by `is_live`, discarding stale
    /// slots found on the way.
    pub(crate) fn peek_live<F>(&mut self, mut is_live: F) -> Option<Instant>
    where
        F: FnMut(&Deadline) -> bool,
    {
        while let Some(top) = self.heap.peek() {
            if is_live(top) {
                return Some(top.at);
            }
            self.heap.pop();
        }
        None
    }

    /// Pops every slot due at `now`, in deadline order.  Staleness is checked
    /// by the caller.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Vec<Deadline> {
        let mut due = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.at > now {
                break;
            }
            if let Some(slot) = self.heap.pop() {
                due.push(slot);
            }
        }
        due
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
