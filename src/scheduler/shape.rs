// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Tree-shape auditor: flags overlong roots/leaves and oversized leaves,
//! and garbage-collects trailing empty leaves.
//!
//! Grounded on the tree-shape checkpoint logic in `csched_sp3.c`.

use crate::scheduler::model::{Node, Tree};
use crate::scheduler::thresholds::Thresholds;
use std::sync::Arc;

/// A single tree-shape finding, surfaced for logging/diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShapeFinding {
    /// The root's run length exceeds the configured maximum.
    RootTooLong { node_id: u64, len: u32 },
    /// A leaf's run length exceeds the configured maximum.
    LeafTooLong { node_id: u64, len: u32 },
    /// A leaf's capacity percent exceeds the configured maximum.
    LeafTooLarge { node_id: u64, pcap: u32 },
}

/// Audits `tree`'s current shape against `thresholds`, returning every
/// finding. Does not mutate anything.
#[must_use]
pub fn audit(tree: &Tree, thresholds: &Thresholds) -> Vec<ShapeFinding> {
    let mut findings = Vec::new();
    for node in tree.nodes() {
        let stats = node.stats();
        if node.is_root {
            if stats.kvset_count > thresholds.root_len_max {
                findings.push(ShapeFinding::RootTooLong {
                    node_id: node.id,
                    len: stats.kvset_count,
                });
            }
        } else {
            if stats.kvset_count > thresholds.leaf_len_max {
                findings.push(ShapeFinding::LeafTooLong {
                    node_id: node.id,
                    len: stats.kvset_count,
                });
            }
            let pcap = node.capacity_pct();
            if pcap > thresholds.leaf_pcap_max {
                findings.push(ShapeFinding::LeafTooLarge {
                    node_id: node.id,
                    pcap,
                });
            }
        }
    }
    findings
}

/// Attempts to garbage-collect a trailing empty leaf: a non-root node
/// with zero kvsets whose removal can be absorbed by extending its left
/// neighbor's edge key to the tree's sentinel.
///
/// Per the "trailing empty node, `left == root`" Open Question decision
/// in `DESIGN.md`, a node is never folded into the root itself — if the
/// only surviving left neighbor of an empty trailing leaf is the root,
/// this returns `false` and leaves the node in place.
pub fn trim_empty_trailing(tree: &Tree, node_id: u64) -> bool {
    let nodes = tree.nodes();
    let Some(pos) = nodes.iter().position(|n| n.id == node_id) else {
        return false;
    };
    let Some(node) = nodes.get(pos) else {
        return false;
    };

    if node.is_root || pos + 1 != nodes.len() {
        // Only the rightmost, non-root node is ever trimmed this way.
        return false;
    }
    if node.stats().kvset_count != 0 {
        return false;
    }
    if node.is_splitting() || node.join_role() != crate::scheduler::model::JoinRole::None {
        return false;
    }

    let Some(left) = nodes.get(pos.wrapping_sub(1)) else {
        return false;
    };

    if left.is_root {
        log::debug!(
            "skipping trailing-empty-node GC for node {node_id}: left neighbor is the root"
        );
        return false;
    }

    log::info!("GC'd trailing empty leaf {node_id}, absorbed by node {}", left.id);
    tree.remove_node(node_id);
    true
}

/// The largest leaf (by capacity percent) in `tree`, if any leaves exist.
#[must_use]
pub fn largest_leaf(tree: &Tree) -> Option<Arc<Node>> {
    tree.nodes()
        .into_iter()
        .filter(|n| !n.is_root)
        .max_by_key(Node::capacity_pct)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::config::SchedulerConfig;

    #[test]
    fn audit_flags_overlong_root() {
        let tree = Tree::new(0, 1_000_000);
        let root = tree.root();
        for i in 0..60 {
            root.push_newest(crate::scheduler::model::Kvset {
                id: i,
                dgen: i,
                compc: 0,
                keys: 1,
                keys_uniq: 1,
                tombs: 0,
                ptombs: 0,
                kalen: 1,
                valen: 0,
                kwlen: 1,
                vwlen: 0,
                vblocks: 1,
                vgroups: 1,
                workid: std::sync::atomic::AtomicU64::new(0),
            });
        }
        let thresholds = Thresholds::compute(&SchedulerConfig::default(), 1);
        let findings = audit(&tree, &thresholds);
        assert!(findings
            .iter()
            .any(|f| matches!(f, ShapeFinding::RootTooLong { .. })));
    }

    #[test]
    fn trim_refuses_when_left_neighbor_is_root() {
        let tree = Tree::new(0, 1_000_000);
        let leaf = Arc::new(Node::new(1, 0, false, 1_000_000));
        tree.add_nodes([leaf.clone()]);
        assert!(!trim_empty_trailing(&tree, leaf.id));
    }

    #[test]
    fn trim_removes_empty_trailing_leaf_with_non_root_left_neighbor() {
        let tree = Tree::new(0, 1_000_000);
        let middle = Arc::new(Node::new(1, 0, false, 1_000_000));
        middle.push_newest(crate::scheduler::model::Kvset {
            id: 1,
            dgen: 1,
            compc: 0,
            keys: 1,
            keys_uniq: 1,
            tombs: 0,
            ptombs: 0,
            kalen: 1,
            valen: 0,
            kwlen: 1,
            vwlen: 0,
            vblocks: 1,
            vgroups: 1,
            workid: std::sync::atomic::AtomicU64::new(0),
        });
        let trailing = Arc::new(Node::new(2, 0, false, 1_000_000));
        tree.add_nodes([middle, trailing.clone()]);

        assert!(trim_empty_trailing(&tree, trailing.id));
        assert!(tree.node(trailing.id).is_none());
    }
}
