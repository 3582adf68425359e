// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Double-buffered dirty-id propagation.
//!
//! Producer threads (ingest, job completion, tree add/remove) mark ids
//! dirty without ever blocking on the monitor thread; the monitor
//! periodically swaps the active buffer and drains the now-inactive one.
//! This decouples producers from the single-threaded monitor the way the
//! original's `mon_dirty_node`/`mon_dirty_tree` double buffers do.

use rustc_hash::FxHashSet;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// A double-buffered set of dirty ids.
pub struct DirtyLists<T> {
    buffers: [Mutex<FxHashSet<T>>; 2],
    active: AtomicUsize,
}

impl<T> Default for DirtyLists<T>
where
    T: Eq + Hash,
{
    fn default() -> Self {
        Self {
            buffers: [Mutex::default(), Mutex::default()],
            active: AtomicUsize::new(0),
        }
    }
}

impl<T> DirtyLists<T>
where
    T: Eq + Hash + Copy,
{
    /// Creates an empty dirty-id set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `id` dirty. Safe to call from any thread at any time.
    pub fn mark(&self, id: T) {
        let idx = self.active.load(Ordering::Acquire) & 1;
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        self.buffers
            .get(idx)
            .unwrap()
            .lock()
            .unwrap()
            .insert(id);
    }

    /// Swaps the active buffer and drains the now-inactive one, returning
    /// every id marked since the previous swap. Only the monitor thread
    /// calls this.
    pub fn swap_and_drain(&self) -> Vec<T> {
        let prev = self.active.fetch_add(1, Ordering::AcqRel) & 1;
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        self.buffers
            .get(prev)
            .unwrap()
            .lock()
            .unwrap()
            .drain()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_only_what_was_marked_before_swap() {
        let dirty: DirtyLists<u64> = DirtyLists::new();
        dirty.mark(1);
        dirty.mark(2);

        let first = dirty.swap_and_drain();
        assert_eq!(first.len(), 2);
        assert!(first.contains(&1));
        assert!(first.contains(&2));

        // Nothing new marked: second drain is empty.
        assert!(dirty.swap_and_drain().is_empty());

        dirty.mark(3);
        let second = dirty.swap_and_drain();
        assert_eq!(second, vec![3]);
    }

    #[test]
    fn duplicate_marks_collapse() {
        let dirty: DirtyLists<u64> = DirtyLists::new();
        dirty.mark(1);
        dirty.mark(1);
        dirty.mark(1);
        assert_eq!(dirty.swap_and_drain().len(), 1);
    }
}
