//! Scheduling order.
//!
//! Admission and preemption share one total order over sequences:
//!
//! ```text
//! (priority ASC, created_time ASC, arrival ASC, sequence index ASC)
//! ```
//!
//! The smallest key is admitted first; the largest running key is the first
//! preemption victim.

use std::cmp::Ordering;
use std::time::Instant;

use crate::core::request::{Priority, Request};
use crate::core::sequence::SequenceId;

/// Position of a sequence in the scheduling order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulingKey {
    pub priority: Priority,
    pub created_time: Instant,
    /// Submission counter; breaks ties between equal timestamps.
    pub arrival: u64,
    pub seq_id: SequenceId,
}

impl SchedulingKey {
    /// Key of sequence `index` of `request`.
    pub fn new(request: &Request, index: usize) -> Self {
        Self {
            priority: request.priority(),
            created_time: request.created_time(),
            arrival: request.arrival(),
            seq_id: SequenceId::new(request.id(), index),
        }
    }
}

impl PartialOrd for SchedulingKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SchedulingKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.created_time.cmp(&other.created_time))
            .then_with(|| self.arrival.cmp(&other.arrival))
            .then_with(|| self.seq_id.index.cmp(&other.seq_id.index))
            .then_with(|| self.seq_id.request_id.cmp(&other.seq_id.request_id))
    }
}

/// Entry in the waiting queue.
///
/// `BinaryHeap` pops its maximum, so the ordering is reversed: the entry with
/// the smallest key compares greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WaitingEntry(pub SchedulingKey);

impl PartialOrd for WaitingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WaitingEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.cmp(&self.0)
    }
}
