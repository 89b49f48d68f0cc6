//! Priority-ordered pending queue.
//!
//! An array-backed binary heap over [`ScheduledRequest`], ordered by
//! `(priority desc, sequence asc)`. Sequence numbers are unique, so the
//! order is total: within a tier the heap degenerates to strict FIFO.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use uuid::Uuid;

use super::request::ScheduledRequest;

struct HeapEntry(ScheduledRequest);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.sequence == other.0.sequence
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then smaller sequence (earlier
        // arrival) first.
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.sequence.cmp(&self.0.sequence))
    }
}

/// Min-heap of pending requests keyed by `(priority tier, arrival sequence)`.
#[derive(Default)]
pub struct RequestHeap {
    heap: BinaryHeap<HeapEntry>,
}

impl RequestHeap {
    pub fn new() -> Self {
        Self { heap: BinaryHeap::new() }
    }

    /// Insert in O(log n).
    pub fn push(&mut self, req: ScheduledRequest) {
        self.heap.push(HeapEntry(req));
    }

    /// Remove and return the highest-precedence request in O(log n).
    pub fn pop(&mut self) -> Option<ScheduledRequest> {
        self.heap.pop().map(|entry| entry.0)
    }

    /// Current size in O(1).
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Remove a still-queued request by id.
    ///
    /// O(n) scan-and-rebuild, acceptable at expected queue depths of tens
    /// to low hundreds. Used when a caller disconnects before dispatch.
    pub fn remove(&mut self, id: Uuid) -> Option<ScheduledRequest> {
        let entries = std::mem::take(&mut self.heap).into_vec();
        let mut removed = None;
        let mut rest = Vec::with_capacity(entries.len());

        for entry in entries {
            if removed.is_none() && entry.0.id == id {
                removed = Some(entry.0);
            } else {
                rest.push(entry);
            }
        }

        self.heap = BinaryHeap::from(rest);
        removed
    }

    /// Remove every pending request, used when draining at shutdown.
    pub fn drain(&mut self) -> Vec<ScheduledRequest> {
        self.heap.drain().map(|entry| entry.0).collect()
    }
}
