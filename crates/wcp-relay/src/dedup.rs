//! Per-topic duplicate suppression.

use std::collections::{HashSet, VecDeque};

use wcp_rpc::RequestId;

/// How many recently seen request ids are remembered per topic.
pub const DEDUP_WINDOW: usize = 100;

/// Ring of the last [`DEDUP_WINDOW`] request ids seen on one topic.
///
/// The relay delivers at-least-once; a request id re-seen inside the window
/// is a redelivery and must have no observable effect.
#[derive(Debug)]
pub struct DedupWindow {
    seen: HashSet<RequestId>,
    order: VecDeque<RequestId>,
    capacity: usize,
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::with_capacity(DEDUP_WINDOW)
    }
}

impl DedupWindow {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `id`; returns `false` when it was already inside the window.
    pub fn insert(&mut self, id: RequestId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}
