// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Ordered, remove-by-key priority index for one work category.
//!
//! The original keeps one intrusive red-black tree per category, embedding
//! the tree node directly in each scheduled node's bookkeeping struct so a
//! node can be removed in O(log n) without a secondary lookup. Rust has no
//! equivalent to an intrusive rb-tree link without `unsafe`, so this is
//! modelled as a [`std::collections::BTreeMap`] ordered by a packed weight
//! plus node id (for deterministic tie-breaks), backed by a side map from
//! node id to its current weight so a node can still be removed or
//! re-inserted by id alone.

use crate::scheduler::model::{NodeId, PackedWeight};
use rustc_hash::FxHashMap;
use std::cmp::Reverse;
use std::collections::BTreeMap;

/// An ordered index of nodes competing for one work category, highest
/// priority first.
#[derive(Default)]
pub struct PriorityIndex {
    by_weight: BTreeMap<(Reverse<PackedWeight>, NodeId), ()>,
    by_node: FxHashMap<NodeId, PackedWeight>,
}

impl PriorityIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or updates `node`'s weight. Idempotent: re-inserting the
    /// same node with a new weight atomically replaces the old entry.
    pub fn upsert(&mut self, node: NodeId, weight: PackedWeight) {
        if let Some(old) = self.by_node.insert(node, weight) {
            self.by_weight.remove(&(Reverse(old), node));
        }
        self.by_weight.insert((Reverse(weight), node), ());
    }

    /// Removes `node` from the index, if present.
    pub fn remove(&mut self, node: NodeId) {
        if let Some(old) = self.by_node.remove(&node) {
            self.by_weight.remove(&(Reverse(old), node));
        }
    }

    /// Returns the highest-priority node without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<NodeId> {
        self.by_weight.keys().next().map(|(_, id)| *id)
    }

    /// Removes and returns the highest-priority node.
    pub fn pop(&mut self) -> Option<NodeId> {
        let key = *self.by_weight.keys().next()?;
        self.by_weight.remove(&key);
        self.by_node.remove(&key.1);
        Some(key.1)
    }

    /// Number of nodes currently indexed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_weight.len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_weight.is_empty()
    }

    /// Whether `node` is currently indexed.
    #[must_use]
    pub fn contains(&self, node: NodeId) -> bool {
        self.by_node.contains_key(&node)
    }

    /// Iterates nodes highest priority first, without removing them.
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.by_weight.keys().map(|(_, id)| *id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_highest_weight_first() {
        let mut idx = PriorityIndex::new();
        idx.upsert(1, PackedWeight::new(1, 0));
        idx.upsert(2, PackedWeight::new(5, 0));
        idx.upsert(3, PackedWeight::new(3, 0));

        assert_eq!(idx.pop(), Some(2));
        assert_eq!(idx.pop(), Some(3));
        assert_eq!(idx.pop(), Some(1));
        assert_eq!(idx.pop(), None);
    }

    #[test]
    fn reinsert_replaces_old_weight() {
        let mut idx = PriorityIndex::new();
        idx.upsert(1, PackedWeight::new(1, 0));
        idx.upsert(1, PackedWeight::new(9, 0));
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.pop(), Some(1));
        assert!(idx.is_empty());
    }

    #[test]
    fn ties_break_by_node_id() {
        let mut idx = PriorityIndex::new();
        idx.upsert(5, PackedWeight::new(1, 0));
        idx.upsert(2, PackedWeight::new(1, 0));
        // Reverse<PackedWeight> ties keep natural NodeId order (ascending).
        assert_eq!(idx.pop(), Some(2));
        assert_eq!(idx.pop(), Some(5));
    }

    #[test]
    fn remove_absent_node_is_noop() {
        let mut idx = PriorityIndex::new();
        idx.remove(42);
        assert!(idx.is_empty());
    }
}
