// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Classifies a single node into zero or more of the seven work
//! categories, each with a priority weight.
//!
//! Grounded on the `sp3_work_wtype_*` predicate functions in the original:
//! each category has its own threshold check and its own weight formula,
//! and a node can be a candidate for more than one category at once (e.g.
//! a root that is both overlong and scatter-heavy).

use crate::scheduler::model::{JoinRole, Node, PackedWeight, WorkKind};
use crate::scheduler::thresholds::Thresholds;

/// One classification result: a category this node qualifies for, with
/// its priority weight and the rule tag that produced it.
#[derive(Clone, Copy, Debug)]
pub struct Candidate {
    /// The category.
    pub kind: WorkKind,
    /// Priority weight within that category's index.
    pub weight: PackedWeight,
    /// Rule tag, for logging/diagnostics (matches [`crate::scheduler::model::WorkItem::rule`]).
    pub rule: &'static str,
}

/// Minimum run length before a node is considered for idle compaction at
/// all (a single-kvset run has nothing to compact).
const IDLE_MIN_RUNLEN: u32 = 2;

/// Join candidates must be below this capacity percent of their nominal
/// split size; small enough that merging two leaves won't immediately
/// make the result a split candidate.
const JOIN_CAPACITY_PCT_MAX: u32 = 25;

/// Whether `left` is a joinable left neighbor of `node`: neither may be
/// mid-split or mid-join, `left` may not be the tree's root (a route
/// pointer never exists for the root, so it can never be absorbed as a
/// join's anchor's left side), `node` must hold at least one kvset, and
/// either `left` is empty or the two nodes' combined capacity stays under
/// the join ceiling.
///
/// Grounded on `sp3_work_joinable` (`csched_sp3_work.c`).
fn joinable_left(node: &Node, left: &Node) -> bool {
    if left.is_root || left.is_splitting() || left.join_role() != JoinRole::None {
        return false;
    }
    if node.stats().kvset_count == 0 {
        return false;
    }
    let left_stats = left.stats();
    if left_stats.kvset_count == 0 {
        return true;
    }
    if node.split_size == 0 {
        return true;
    }
    let combined_alen = left_stats.alen + node.stats().alen;
    let combined_pct = u32::try_from((combined_alen * 100) / node.split_size).unwrap_or(u32::MAX);
    combined_pct <= JOIN_CAPACITY_PCT_MAX
}

/// Classifies `node`, returning every category it currently qualifies
/// for. `left_neighbor` is `node`'s immediate left sibling in tree order
/// (`None` for the root or a node with no left sibling), used only to
/// decide `node`'s own `Join` eligibility as the anchor/right side.
#[must_use]
pub fn classify(node: &Node, left_neighbor: Option<&Node>, thresholds: &Thresholds) -> Vec<Candidate> {
    let mut out = Vec::new();
    let stats = node.stats();
    let mut empty_left_join = false;

    // Splits and joins are absorbing states: a node mid-split or mid-join
    // is removed from every category, not just Split/Join.
    if node.is_splitting() || node.join_role() != JoinRole::None {
        return out;
    }

    if node.is_root {
        if stats.kvset_count > thresholds.root_len_max {
            let excess = stats.kvset_count - thresholds.root_len_max;
            out.push(Candidate {
                kind: WorkKind::Root,
                weight: PackedWeight::new(excess, stats.kvset_count),
                rule: "root.overlong",
            });
            log::debug!(
                "node {} classified Root: runlen={} max={}",
                node.id,
                stats.kvset_count,
                thresholds.root_len_max
            );
        }
    } else {
        if stats.kvset_count > thresholds.leaf_len_max {
            let excess = stats.kvset_count - thresholds.leaf_len_max;
            out.push(Candidate {
                kind: WorkKind::Length,
                weight: PackedWeight::new(excess, stats.kvset_count),
                rule: "length.overlong",
            });
        }

        if node.can_split() {
            let pcap = node.capacity_pct();
            if pcap > thresholds.leaf_pcap_max {
                out.push(Candidate {
                    kind: WorkKind::Split,
                    weight: PackedWeight::new(pcap, node.id as u32),
                    rule: "split.overcap",
                });
            }
        }

        if let Some(left) = left_neighbor {
            if joinable_left(node, left) {
                let left_kvsets = u32::try_from(left.stats().kvset_count).unwrap_or(0);
                let empty_left = left_kvsets == 0;
                // Invert so an empty (or smaller) left neighbor sorts
                // ahead of a merely-undersized one; empty-left is the
                // fast path and always wins ties against a nonempty one.
                let inv = u32::MAX.saturating_sub(left_kvsets);
                out.push(Candidate {
                    kind: WorkKind::Join,
                    weight: PackedWeight::new(inv, node.id as u32),
                    rule: "join.undersized",
                });
                empty_left_join = empty_left;
            }
        }
    }

    if stats.keys > 0 {
        let garbage_pct = u32::try_from((stats.tombs + stats.ptombs) * 100 / stats.keys.max(1))
            .unwrap_or(u32::MAX);
        if garbage_pct > thresholds.garbage_pct {
            out.push(Candidate {
                kind: WorkKind::Garbage,
                weight: PackedWeight::new(garbage_pct, stats.kvset_count),
                rule: "garbage.threshold",
            });
        }
    }

    if stats.vgroups > thresholds.scatter_hwm
        || (stats.kvset_count > thresholds.scatter_runlen_max && stats.vgroups > thresholds.scatter_runlen_max)
    {
        out.push(Candidate {
            kind: WorkKind::Scatter,
            weight: PackedWeight::new(stats.vgroups, stats.kvset_count),
            rule: "scatter.threshold",
        });
    }

    if !node.is_root
        && stats.kvset_count >= IDLE_MIN_RUNLEN
        && node.active_jobs() == 0
        && !out.iter().any(|c| c.kind != WorkKind::Idle)
    {
        out.push(Candidate {
            kind: WorkKind::Idle,
            weight: PackedWeight::new(0, stats.kvset_count),
            rule: "idle.background",
        });
    }

    if empty_left_join {
        // The left neighbor contributes nothing: the join is the only
        // remediation worth doing, ahead of whatever else this node
        // might otherwise qualify for.
        out.retain(|c| c.kind == WorkKind::Join);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::config::SchedulerConfig;
    use crate::scheduler::model::Kvset;
    use std::sync::atomic::AtomicU64;

    fn kvset(keys: u64, tombs: u64, alen: u64, vgroups: u32) -> Kvset {
        Kvset {
            id: 1,
            dgen: 1,
            compc: 0,
            keys,
            keys_uniq: keys,
            tombs,
            ptombs: 0,
            kalen: alen,
            valen: 0,
            kwlen: alen,
            vwlen: 0,
            vblocks: 1,
            vgroups,
            workid: AtomicU64::new(0),
        }
    }

    #[test]
    fn overlong_root_classifies_as_root_work() {
        let node = Node::new(0, 0, true, 1_000_000);
        for _ in 0..60 {
            node.push_newest(kvset(10, 0, 1, 1));
        }
        let thresholds = Thresholds::compute(&SchedulerConfig::default(), 1);
        let candidates = classify(&node, None, &thresholds);
        assert!(candidates.iter().any(|c| c.kind == WorkKind::Root));
    }

    #[test]
    fn garbage_heavy_leaf_classifies_as_garbage() {
        let node = Node::new(1, 0, false, 1_000_000);
        node.push_newest(kvset(100, 80, 10, 1));
        let thresholds = Thresholds::compute(&SchedulerConfig::default(), 1);
        let candidates = classify(&node, None, &thresholds);
        assert!(candidates.iter().any(|c| c.kind == WorkKind::Garbage));
    }

    #[test]
    fn oversized_leaf_classifies_as_split() {
        let node = Node::new(1, 0, false, 100);
        node.push_newest(kvset(10, 0, 200, 1));
        let thresholds = Thresholds::compute(&SchedulerConfig::default(), 1);
        let candidates = classify(&node, None, &thresholds);
        assert!(candidates.iter().any(|c| c.kind == WorkKind::Split));
    }

    #[test]
    fn tiny_leaf_with_empty_left_neighbor_classifies_as_join_not_split() {
        let left = Node::new(2, 0, false, 1_000_000);
        let node = Node::new(1, 0, false, 1_000_000);
        node.push_newest(kvset(10, 0, 10, 1));
        let thresholds = Thresholds::compute(&SchedulerConfig::default(), 1);
        let candidates = classify(&node, Some(&left), &thresholds);
        assert!(candidates.iter().any(|c| c.kind == WorkKind::Join));
        assert!(!candidates.iter().any(|c| c.kind == WorkKind::Split));
    }

    #[test]
    fn no_left_neighbor_is_never_a_join_candidate() {
        let node = Node::new(1, 0, false, 1_000_000);
        node.push_newest(kvset(10, 0, 10, 1));
        let thresholds = Thresholds::compute(&SchedulerConfig::default(), 1);
        let candidates = classify(&node, None, &thresholds);
        assert!(!candidates.iter().any(|c| c.kind == WorkKind::Join));
    }

    #[test]
    fn root_is_never_a_joinable_left_neighbor() {
        let root = Node::new(0, 0, true, 1_000_000);
        let node = Node::new(1, 0, false, 1_000_000);
        node.push_newest(kvset(10, 0, 10, 1));
        let thresholds = Thresholds::compute(&SchedulerConfig::default(), 1);
        let candidates = classify(&node, Some(&root), &thresholds);
        assert!(!candidates.iter().any(|c| c.kind == WorkKind::Join));
    }

    #[test]
    fn splitting_node_is_classified_into_no_category() {
        let left = Node::new(2, 0, false, 1_000_000);
        let node = Node::new(1, 0, false, 1_000_000);
        node.push_newest(kvset(10, 0, 10, 1));
        node.begin_split();
        let thresholds = Thresholds::compute(&SchedulerConfig::default(), 1);
        let candidates = classify(&node, Some(&left), &thresholds);
        assert!(candidates.is_empty());
    }
}
