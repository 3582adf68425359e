// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! FIFO, payload-carrying event queues for ingest and job-completion
//! notifications.
//!
//! Unlike [`crate::scheduler::dirty::DirtyLists`], which only tracks which
//! ids changed, producer threads here hand the monitor thread the actual
//! event payload: an ingested kvset, or a finished job's outcome. The
//! monitor drains and applies these at the start of each schedule
//! checkpoint, so it stays the only thread that ever mutates samp
//! estimator state, tree ingest accumulators, or a node's kvset run.

use crate::scheduler::model::{ActionOutcome, Kvset, NodeId, TreeId, WorkItem};
use std::sync::Mutex;

/// A kvset freshly ingested into `node_id` of `tree_id`, queued for the
/// monitor to apply.
pub struct IngestEvent {
    /// Tree the kvset was ingested into.
    pub tree_id: TreeId,
    /// Node (root or leaf) the kvset was ingested into.
    pub node_id: NodeId,
    /// The ingested kvset itself.
    pub kvset: Kvset,
}

/// A finished job's outcome, queued for the monitor to apply.
pub struct CompletionEvent {
    /// The work item that was dispatched.
    pub item: WorkItem,
    /// What the action kernel produced.
    pub outcome: ActionOutcome,
}

/// An unbounded FIFO queue of pending events, drained by the monitor
/// thread.
pub struct EventQueue<T> {
    items: Mutex<Vec<T>>,
}

impl<T> Default for EventQueue<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }
}

impl<T> EventQueue<T> {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues an event. Safe to call from any thread at any time.
    pub fn push(&self, event: T) {
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        self.items.lock().unwrap().push(event);
    }

    /// Drains every event queued since the previous drain, in FIFO order.
    /// Only the monitor thread calls this.
    pub fn drain(&self) -> Vec<T> {
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        std::mem::take(&mut *self.items.lock().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_fifo_order_and_empties() {
        let q: EventQueue<u32> = EventQueue::new();
        q.push(1);
        q.push(2);
        assert_eq!(q.drain(), vec![1, 2]);
        assert!(q.drain().is_empty());
    }
}
