// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Round-robin job dispatch across the seven work categories, with
//! per-category concurrency caps, cooldown windows for garbage/scatter,
//! and the root-ready FIFO.
//!
//! Grounded on `sp3_dispatch`/`sp3_check_roots` in `csched_sp3.c`.

use crate::scheduler::classifier::{classify, Candidate};
use crate::scheduler::model::{
    CnAction, JoinRole, Node, NodeId, TreeId, TreeMap, WorkItem, WorkKind, WorkerPool,
};
use crate::scheduler::planner::{self, NodeIdHint};
use crate::scheduler::priority_index::PriorityIndex;
use crate::scheduler::thresholds::Thresholds;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// FIFO of root nodes waiting for an rspill. See the
/// `check_roots` Open Question decision in `DESIGN.md`: a root that fails
/// to dispatch (no free worker slot) goes to the tail, not the head, so
/// one stuck root cannot starve every other root behind it.
#[derive(Default)]
pub struct RootReadyQueue {
    queue: VecDeque<NodeId>,
    member: FxHashSet<NodeId>,
}

impl RootReadyQueue {
    /// Pushes `node` to the tail if it is not already queued.
    pub fn push_back(&mut self, node: NodeId) {
        if self.member.insert(node) {
            self.queue.push_back(node);
        }
    }

    /// Pops the head of the queue.
    pub fn pop_front(&mut self) -> Option<NodeId> {
        let node = self.queue.pop_front()?;
        self.member.remove(&node);
        Some(node)
    }

    /// Re-queues `node` at the tail after a failed dispatch attempt.
    pub fn retry(&mut self, node: NodeId) {
        self.push_back(node);
    }

    /// Whether `node` is currently queued.
    #[must_use]
    pub fn contains(&self, node: NodeId) -> bool {
        self.member.contains(&node)
    }
}

const GARBAGE_IDX: usize = WorkKind::Garbage.index();
const SCATTER_IDX: usize = WorkKind::Scatter.index();

/// Dispatches classified work to a worker pool.
pub struct Dispatcher {
    indexes: [PriorityIndex; 7],
    root_ready: Mutex<RootReadyQueue>,
    inflight: [AtomicU32; 7],
    cooldown_until: [Mutex<Option<Instant>>; 7],
    cursor: AtomicU32,
    next_workid: AtomicU64,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self {
            indexes: Default::default(),
            root_ready: Mutex::default(),
            inflight: Default::default(),
            cooldown_until: Default::default(),
            cursor: AtomicU32::new(0),
            next_workid: AtomicU64::new(1),
        }
    }
}

impl Dispatcher {
    /// Creates an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_workid(&self) -> u64 {
        self.next_workid.fetch_add(1, Ordering::Relaxed)
    }

    /// Updates the indexed candidates for `node_id`, following a fresh
    /// classification. Categories no longer present are removed from
    /// their index; `Root` candidates additionally enqueue onto the
    /// root-ready FIFO.
    pub fn update_candidates(&mut self, node_id: NodeId, candidates: &[Candidate]) {
        let mut seen = [false; 7];
        for c in candidates {
            seen[c.kind.index()] = true;
            if c.kind == WorkKind::Root {
                #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
                self.root_ready.lock().unwrap().push_back(node_id);
            } else {
                let idx = &mut self.indexes[c.kind.index()];
                idx.upsert(node_id, c.weight);
            }
        }
        for (i, present) in seen.iter().enumerate() {
            if !present && i != WorkKind::Root.index() {
                self.indexes[i].remove(node_id);
            }
        }
    }

    /// Starts a cooldown window for `kind`, used after a garbage/scatter
    /// job completes to avoid immediately re-selecting the same category.
    pub fn start_cooldown(&self, kind: WorkKind, duration: Duration) {
        let idx = kind.index();
        if idx == GARBAGE_IDX || idx == SCATTER_IDX {
            #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
            {
                *self.cooldown_until[idx].lock().unwrap() = Some(Instant::now() + duration);
            }
        }
    }

    fn in_cooldown(&self, idx: usize) -> bool {
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        match *self.cooldown_until[idx].lock().unwrap() {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    /// Records that a previously-submitted job for `kind` has finished,
    /// freeing a concurrency slot.
    pub fn job_finished(&self, kind: WorkKind) {
        self.inflight[kind.index()].fetch_sub(1, Ordering::AcqRel);
    }

    fn abandon(node: &Node, item: &WorkItem) {
        node.with_kvsets(|run| {
            for kv in run {
                if item.kvset_ids.contains(&kv.id) {
                    kv.release();
                }
            }
        });
        node.end_job(u16::try_from(item.kvset_ids.len()).unwrap_or(u16::MAX));
        match item.action {
            CnAction::Split => node.end_split(),
            CnAction::Join => node.end_join(),
            CnAction::CompactK | CnAction::CompactKv | CnAction::Spill => {}
        }
    }

    /// Runs one dispatch pass: round-robins across the seven categories,
    /// planning and submitting at most one item per category per pass
    /// (bounded by `caps`), and returns how many items were submitted.
    pub fn dispatch_tick(
        &self,
        trees: &TreeMap,
        pool: &dyn WorkerPool,
        caps: &[u32; 7],
        thresholds: &Thresholds,
    ) -> usize {
        let mut dispatched = 0;
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) as usize % 7;

        for offset in 0..7 {
            let kind = WorkKind::ALL[(start + offset) % 7];
            let idx = kind.index();

            if self.inflight[idx].load(Ordering::Acquire) >= caps[idx] {
                continue;
            }
            if self.in_cooldown(idx) {
                continue;
            }

            let attempted = if kind == WorkKind::Root {
                self.try_dispatch_root(trees, pool, thresholds)
            } else {
                self.try_dispatch_indexed(kind, trees, pool, thresholds)
            };

            if attempted {
                self.inflight[idx].fetch_add(1, Ordering::AcqRel);
                dispatched += 1;
            }
        }

        dispatched
    }

    fn try_dispatch_root(&self, trees: &TreeMap, pool: &dyn WorkerPool, thresholds: &Thresholds) -> bool {
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        let Some(node_id) = self.root_ready.lock().unwrap().pop_front() else {
            return false;
        };

        let Some((tree_id, node)) = find_node(trees, node_id) else {
            return false;
        };

        if !node.is_root || node.stats().kvset_count == 0 {
            return false;
        }

        let candidate = Candidate {
            kind: WorkKind::Root,
            weight: crate::scheduler::model::PackedWeight::ZERO,
            rule: "root.overlong",
        };

        let Some(item) = planner::plan(candidate, &node, tree_id, None, thresholds, self.alloc_workid())
        else {
            #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
            self.root_ready.lock().unwrap().retry(node_id);
            return false;
        };

        if pool.submit(item.clone()) {
            true
        } else {
            Self::abandon(&node, &item);
            #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
            self.root_ready.lock().unwrap().retry(node_id);
            false
        }
    }

    fn try_dispatch_indexed(
        &self,
        kind: WorkKind,
        trees: &TreeMap,
        pool: &dyn WorkerPool,
        thresholds: &Thresholds,
    ) -> bool {
        let idx = &self.indexes[kind.index()];
        let Some(node_id) = idx.peek() else {
            return false;
        };

        let Some((tree_id, node)) = find_node(trees, node_id) else {
            return false;
        };

        let candidate = Candidate {
            kind,
            weight: crate::scheduler::model::PackedWeight::ZERO,
            rule: match kind {
                WorkKind::Length => "length.overlong",
                WorkKind::Garbage => "garbage.threshold",
                WorkKind::Scatter => "scatter.threshold",
                WorkKind::Idle => "idle.background",
                WorkKind::Split => "split.overcap",
                WorkKind::Join => "join.undersized",
                WorkKind::Root => unreachable!("root dispatched via root_ready queue"),
            },
        };

        let peer = if kind == WorkKind::Join {
            find_join_peer(trees, tree_id, node_id)
        } else {
            None
        };

        let Some(item) =
            planner::plan(candidate, &node, tree_id, peer.map(NodeIdHint), thresholds, self.alloc_workid())
        else {
            return false;
        };

        if pool.submit(item.clone()) {
            true
        } else {
            Self::abandon(&node, &item);
            false
        }
    }
}

fn find_node(trees: &TreeMap, node_id: NodeId) -> Option<(TreeId, std::sync::Arc<Node>)> {
    for tree in trees.values() {
        if let Some(node) = tree.node(node_id) {
            return Some((tree.id, node));
        }
    }
    None
}

/// Finds the join peer for `node_id`: its left neighbor, which is the
/// node absorbed into `node_id` (the anchor/survivor). Grounded on
/// `sp3_work_wtype_join` (`csched_sp3_work.c`): "node-join always merges
/// the left node of the join into right node (i.e., the anchor node)".
fn find_join_peer(trees: &TreeMap, tree_id: TreeId, node_id: NodeId) -> Option<NodeId> {
    let tree = trees.get(&tree_id)?;
    let nodes = tree.nodes();
    let pos = nodes.iter().position(|n| n.id == node_id)?;
    let left = nodes.get(pos.checked_sub(1)?)?;
    if left.begin_join(JoinRole::Left) {
        Some(left.id)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::model::tests::InlineWorkerPool;
    use crate::scheduler::model::Tree;
    use std::sync::Arc;

    fn empty_trees() -> TreeMap {
        TreeMap::default()
    }

    #[test]
    fn root_ready_queue_retries_to_tail() {
        let mut q = RootReadyQueue::default();
        q.push_back(1);
        q.push_back(2);
        assert_eq!(q.pop_front(), Some(1));
        q.retry(1);
        assert_eq!(q.pop_front(), Some(2));
        assert_eq!(q.pop_front(), Some(1));
    }

    #[test]
    fn dispatch_tick_with_no_candidates_dispatches_nothing() {
        let dispatcher = Dispatcher::new();
        let pool = InlineWorkerPool::default();
        let trees = empty_trees();
        let thresholds = Thresholds::compute(&crate::scheduler::config::SchedulerConfig::default(), 1);
        let caps = [2, 2, 2, 2, 2, 2, 2];
        assert_eq!(dispatcher.dispatch_tick(&trees, &pool, &caps, &thresholds), 0);
    }

    #[test]
    fn dispatch_tick_respects_concurrency_caps() {
        let mut dispatcher = Dispatcher::new();
        let pool = InlineWorkerPool::default();

        let tree = Arc::new(Tree::new(0, 1_000_000));
        let node = tree.root();
        node.push_newest(crate::scheduler::model::Kvset {
            id: 1,
            dgen: 1,
            compc: 0,
            keys: 100,
            keys_uniq: 100,
            tombs: 90,
            ptombs: 0,
            kalen: 10,
            valen: 0,
            kwlen: 10,
            vwlen: 0,
            vblocks: 1,
            vgroups: 1,
            workid: AtomicU64::new(0),
        });

        let mut trees = empty_trees();
        trees.insert(0, tree.clone());

        let thresholds = Thresholds::compute(&crate::scheduler::config::SchedulerConfig::default(), 1);
        let candidates = classify(&node, None, &thresholds);
        dispatcher.update_candidates(node.id, &candidates);

        let caps = [0, 0, 0, 0, 0, 0, 0];
        assert_eq!(dispatcher.dispatch_tick(&trees, &pool, &caps, &thresholds), 0);
    }
}
