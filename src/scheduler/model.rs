// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The data model the scheduler operates on, and the trait interfaces
//! through which it reaches out-of-scope collaborators (kvset I/O, metadata
//! logging, media-pool allocation, the worker pool).
//!
//! Concrete [`Tree`]/[`Node`]/[`Kvset`] types live here because classifying
//! and planning work requires direct field access; actually *executing* a
//! planned [`WorkItem`] is delegated to an [`ActionKernels`] implementation,
//! which is the only part of this module a real storage engine has to
//! supply itself.

use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicI8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Identifies a tree within the scheduler.
pub type TreeId = u64;

/// Identifies a node within its tree.
pub type NodeId = u64;

/// Identifies a kvset within its node.
pub type KvsetId = u64;

/// The seven work categories a node can be classified into.
///
/// Order matters: it is the index order used by
/// [`crate::scheduler::config::SchedulerConfig::queue_caps`] and by the
/// dispatcher's round robin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkKind {
    /// Root spill: push a root's kvsets down into its children.
    Root,
    /// Length reduction: compact an overlong run of kvsets in place.
    Length,
    /// Garbage collection: rewrite a kvset run to reclaim tombstoned space.
    Garbage,
    /// Scatter reduction: consolidate a node's vgroup/vblock scatter.
    Scatter,
    /// Idle compaction: low-priority background consolidation.
    Idle,
    /// Split a node whose capacity has grown past its cap.
    Split,
    /// Join two undersized sibling leaves.
    Join,
}

impl WorkKind {
    /// All seven kinds, in index order.
    pub const ALL: [Self; 7] = [
        Self::Root,
        Self::Length,
        Self::Garbage,
        Self::Scatter,
        Self::Idle,
        Self::Split,
        Self::Join,
    ];

    /// Index into a `[T; 7]` array keyed by work kind.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Root => 0,
            Self::Length => 1,
            Self::Garbage => 2,
            Self::Scatter => 3,
            Self::Idle => 4,
            Self::Split => 5,
            Self::Join => 6,
        }
    }
}

/// A packed `(primary, secondary)` priority weight.
///
/// Priority indexes order nodes by a single `u64` key so ties break
/// deterministically on a secondary field, mirroring the original's
/// `primary << 32 | secondary` packing used throughout
/// `csched_sp3_work.c`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackedWeight(u64);

impl PackedWeight {
    /// Packs a primary/secondary pair. Both are truncated to 32 bits.
    #[must_use]
    pub const fn new(primary: u32, secondary: u32) -> Self {
        Self(((primary as u64) << 32) | secondary as u64)
    }

    /// The zero weight, lowest priority.
    pub const ZERO: Self = Self(0);

    /// The raw packed value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Per-kvset statistics and identity.
///
/// Not `Clone`: `workid` is a live claim token, not a value that makes
/// sense to duplicate.
#[derive(Debug)]
pub struct Kvset {
    /// Unique id within the node.
    pub id: KvsetId,
    /// Generation number; higher is newer.
    pub dgen: u64,
    /// Compaction count: how many times this kvset's lineage has been
    /// rewritten.
    pub compc: u32,
    /// Total key count.
    pub keys: u64,
    /// Unique (non-tombstoned, non-duplicate-across-run) key count.
    pub keys_uniq: u64,
    /// Tombstone count.
    pub tombs: u64,
    /// Prefix-tombstone count.
    pub ptombs: u64,
    /// Allocated key-block bytes.
    pub kalen: u64,
    /// Allocated value-block bytes.
    pub valen: u64,
    /// Written (post-compression) key-block bytes.
    pub kwlen: u64,
    /// Written value-block bytes.
    pub vwlen: u64,
    /// Number of vblocks.
    pub vblocks: u32,
    /// Number of distinct vgroups referenced (scatter factor).
    pub vgroups: u32,
    /// Non-zero while a job has claimed this kvset; zero means free.
    pub workid: AtomicU64,
}

impl Kvset {
    /// Total allocated bytes (key + value).
    #[must_use]
    pub fn alen(&self) -> u64 {
        self.kalen + self.valen
    }

    /// Total written bytes (key + value).
    #[must_use]
    pub fn wlen(&self) -> u64 {
        self.kwlen + self.vwlen
    }

    /// Attempts to claim this kvset for `workid` (non-zero). Fails if
    /// already claimed.
    pub fn try_claim(&self, workid: u64) -> bool {
        debug_assert_ne!(workid, 0);
        self.workid
            .compare_exchange(0, workid, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Releases a claim previously taken with `try_claim`.
    pub fn release(&self) {
        self.workid.store(0, Ordering::Release);
    }

    /// Whether this kvset is currently claimed by a job.
    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.workid.load(Ordering::Acquire) != 0
    }
}

/// The tri-state role a node plays in an in-flight split or join.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinRole {
    /// Not participating in a join.
    None,
    /// The left (absorbed) side of a join.
    Left,
    /// The right (anchor/surviving) side of a join.
    Right,
}

impl JoinRole {
    const fn to_i8(self) -> i8 {
        match self {
            Self::None => 0,
            Self::Left => -1,
            Self::Right => 1,
        }
    }

    const fn from_i8(v: i8) -> Self {
        match v {
            -1 => Self::Left,
            1 => Self::Right,
            _ => Self::None,
        }
    }
}

/// Aggregated per-node statistics, computed on demand from its kvset list.
#[derive(Clone, Copy, Debug, Default)]
pub struct NodeStats {
    /// Number of kvsets in the node's run.
    pub kvset_count: u32,
    /// Total keys across the run.
    pub keys: u64,
    /// Total unique keys across the run.
    pub keys_uniq: u64,
    /// Total tombstones across the run.
    pub tombs: u64,
    /// Total prefix tombstones across the run.
    pub ptombs: u64,
    /// Total allocated bytes across the run.
    pub alen: u64,
    /// Total written bytes across the run.
    pub wlen: u64,
    /// Total vgroup count across the run (scatter factor).
    pub vgroups: u32,
}

/// A single node in a tree: an ordered, newest-first run of kvsets plus
/// scheduling-relevant bookkeeping.
#[derive(Debug)]
pub struct Node {
    /// Node id, unique within its tree.
    pub id: NodeId,
    /// Owning tree id.
    pub tree_id: TreeId,
    /// Whether this is the tree's root node.
    pub is_root: bool,
    /// Newest-first kvset run. Index 0 is newest; the back is oldest.
    kvsets: RwLock<VecDeque<Kvset>>,
    /// Packed busy counter: upper 16 bits = active job count, lower 16 bits
    /// = kvsets currently claimed.
    busy: AtomicU32,
    /// Whether this node is the source or destination of an in-flight
    /// split. Split and join are mutually exclusive:
    /// `splitting && join_role != None` never holds.
    splitting: AtomicBool,
    /// Tri-state join participation.
    join_role: AtomicI8,
    /// Nominal split-trigger capacity in bytes for this node (leaves only).
    pub split_size: u64,
}

impl Node {
    /// Creates a new, empty node.
    #[must_use]
    pub fn new(id: NodeId, tree_id: TreeId, is_root: bool, split_size: u64) -> Self {
        Self {
            id,
            tree_id,
            is_root,
            kvsets: RwLock::new(VecDeque::new()),
            busy: AtomicU32::new(0),
            splitting: AtomicBool::new(false),
            join_role: AtomicI8::new(JoinRole::None.to_i8()),
            split_size,
        }
    }

    /// Pushes a freshly-ingested kvset to the front (newest position) of
    /// the run.
    pub fn push_newest(&self, kvset: Kvset) {
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        self.kvsets.write().unwrap().push_front(kvset);
    }

    /// Runs `f` over a read-only snapshot of the kvset run, newest first.
    pub fn with_kvsets<R>(&self, f: impl FnOnce(&VecDeque<Kvset>) -> R) -> R {
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        f(&self.kvsets.read().unwrap())
    }

    /// Replaces the run with `new_run` (newest first), used after a
    /// successful compaction/merge kernel invocation.
    pub fn replace_run(&self, new_run: VecDeque<Kvset>) {
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        {
            *self.kvsets.write().unwrap() = new_run;
        }
    }

    /// Computes aggregated statistics over the current run.
    #[must_use]
    pub fn stats(&self) -> NodeStats {
        self.with_kvsets(|run| {
            let mut s = NodeStats {
                kvset_count: u32::try_from(run.len()).unwrap_or(u32::MAX),
                ..NodeStats::default()
            };
            for kv in run {
                s.keys += kv.keys;
                s.keys_uniq += kv.keys_uniq;
                s.tombs += kv.tombs;
                s.ptombs += kv.ptombs;
                s.alen += kv.alen();
                s.wlen += kv.wlen();
                s.vgroups += kv.vgroups;
            }
            s
        })
    }

    /// Current capacity percent relative to `split_size` (external
    /// percent, e.g. `140` for 1.40x).
    #[must_use]
    pub fn capacity_pct(&self) -> u32 {
        if self.split_size == 0 {
            return 0;
        }
        let alen = self.stats().alen;
        u32::try_from((alen * 100) / self.split_size).unwrap_or(u32::MAX)
    }

    /// Packed busy counter value.
    #[must_use]
    pub fn busy_raw(&self) -> u32 {
        self.busy.load(Ordering::Acquire)
    }

    /// Active job count (upper 16 bits).
    #[must_use]
    pub fn active_jobs(&self) -> u16 {
        (self.busy.load(Ordering::Acquire) >> 16) as u16
    }

    /// Claimed kvset count (lower 16 bits).
    #[must_use]
    pub fn claimed_kvsets(&self) -> u16 {
        (self.busy.load(Ordering::Acquire) & 0xFFFF) as u16
    }

    /// Begins a job: increments the active-job half and adds `n` to the
    /// claimed-kvset half.
    pub fn begin_job(&self, n: u16) {
        self.busy
            .fetch_add((1u32 << 16) | u32::from(n), Ordering::AcqRel);
    }

    /// Ends a job: decrements the active-job half and subtracts `n` from
    /// the claimed-kvset half.
    pub fn end_job(&self, n: u16) {
        self.busy
            .fetch_sub((1u32 << 16) | u32::from(n), Ordering::AcqRel);
    }

    /// Whether this node is free to start a new split.
    #[must_use]
    pub fn can_split(&self) -> bool {
        !self.splitting.load(Ordering::Acquire) && self.join_role() == JoinRole::None
    }

    /// Marks this node as splitting. Returns `false` (no-op) if it was
    /// already splitting or mid-join.
    pub fn begin_split(&self) -> bool {
        if !self.can_split() {
            return false;
        }
        !self.splitting.swap(true, Ordering::AcqRel)
    }

    /// Clears the splitting flag.
    pub fn end_split(&self) {
        self.splitting.store(false, Ordering::Release);
    }

    /// Whether this node is mid-split.
    #[must_use]
    pub fn is_splitting(&self) -> bool {
        self.splitting.load(Ordering::Acquire)
    }

    /// Current join role.
    #[must_use]
    pub fn join_role(&self) -> JoinRole {
        JoinRole::from_i8(self.join_role.load(Ordering::Acquire))
    }

    /// Attempts to set the join role. Fails (returns `false`) if the node
    /// is mid-split or already has a non-`None` join role.
    pub fn begin_join(&self, role: JoinRole) -> bool {
        if self.is_splitting() || self.join_role() != JoinRole::None {
            return false;
        }
        self.join_role.store(role.to_i8(), Ordering::Release);
        true
    }

    /// Clears the join role back to `None`.
    pub fn end_join(&self) {
        self.join_role.store(JoinRole::None.to_i8(), Ordering::Release);
    }
}

/// A tree (one keyspace's node set) the scheduler monitors.
pub struct Tree {
    /// Tree id.
    pub id: TreeId,
    /// Nodes, ordered by key range; index 0 is the root.
    nodes: RwLock<Vec<Arc<Node>>>,
    /// Whether the scheduler is actively scheduling work for this tree.
    pub enabled: AtomicBool,
    /// Cumulative ingested alen since the tree was added (feeds the samp
    /// estimator's `i_alen`).
    pub ingest_alen: AtomicI64,
    /// Cumulative ingested wlen since the tree was added.
    pub ingest_wlen: AtomicI64,
    /// Serializes split/join structural changes against concurrent
    /// classification.
    pub ss_lock: Mutex<()>,
    /// Exponential moving average of root-spill latency, nanoseconds.
    pub rspill_latency_ns: AtomicU64,
    /// Count of rspill jobs currently blocked waiting for room.
    pub rspill_sleepers: AtomicU32,
}

impl Tree {
    /// Creates a new tree with a single root node.
    #[must_use]
    pub fn new(id: TreeId, root_split_size: u64) -> Self {
        let root = Arc::new(Node::new(0, id, true, root_split_size));
        Self {
            id,
            nodes: RwLock::new(vec![root]),
            enabled: AtomicBool::new(true),
            ingest_alen: AtomicI64::new(0),
            ingest_wlen: AtomicI64::new(0),
            ss_lock: Mutex::new(()),
            rspill_latency_ns: AtomicU64::new(0),
            rspill_sleepers: AtomicU32::new(0),
        }
    }

    /// Returns a snapshot `Vec` of the tree's current nodes.
    #[must_use]
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        self.nodes.read().unwrap().clone()
    }

    /// The root node.
    #[must_use]
    pub fn root(&self) -> Arc<Node> {
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        self.nodes
            .read()
            .unwrap()
            .first()
            .cloned()
            .expect("tree always has a root")
    }

    /// Looks up a node by id.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<Arc<Node>> {
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        self.nodes.read().unwrap().iter().find(|n| n.id == id).cloned()
    }

    /// Appends newly created child nodes (from a split) to the tree.
    pub fn add_nodes(&self, new_nodes: impl IntoIterator<Item = Arc<Node>>) {
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        self.nodes.write().unwrap().extend(new_nodes);
    }

    /// Removes a node (from a join/trim) by id.
    pub fn remove_node(&self, id: NodeId) {
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        self.nodes.write().unwrap().retain(|n| n.id != id);
    }

    /// Updates the root-spill latency EWMA with a new sample.
    pub fn record_rspill_latency(&self, sample_ns: u64) {
        const ALPHA_NUM: u64 = 1;
        const ALPHA_DEN: u64 = 8;
        let prev = self.rspill_latency_ns.load(Ordering::Acquire);
        let next = if prev == 0 {
            sample_ns
        } else {
            prev - prev / ALPHA_DEN + sample_ns / ALPHA_DEN * ALPHA_NUM
        };
        self.rspill_latency_ns.store(next, Ordering::Release);
    }
}

/// The concrete action a [`WorkItem`] asks an [`ActionKernels`]
/// implementation to perform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CnAction {
    /// Compact (merge) a run of kvsets in place, keys only (no garbage
    /// collection of orphaned values).
    CompactK,
    /// Compact a run of kvsets in place, keys and values.
    CompactKv,
    /// Spill a root's kvsets down into its children.
    Spill,
    /// Split a node into two.
    Split,
    /// Join two sibling nodes into one.
    Join,
}

/// A fully-planned unit of work, ready for dispatch to the worker pool.
#[derive(Clone, Debug)]
pub struct WorkItem {
    /// Which category produced this item.
    pub kind: WorkKind,
    /// Target tree.
    pub tree_id: TreeId,
    /// Target node (primary input node; for `Join` this is the right/
    /// anchor/surviving side).
    pub node_id: NodeId,
    /// Secondary node, only meaningful for `Join` (the left/absorbed
    /// side).
    pub peer_node_id: Option<NodeId>,
    /// The concrete action to perform.
    pub action: CnAction,
    /// Ids of the kvsets claimed as input, oldest-first.
    pub kvset_ids: Vec<KvsetId>,
    /// Rule tag identifying which classifier predicate produced this item,
    /// for logging/diagnostics.
    pub rule: &'static str,
    /// Estimated change in tree samp (internal SCALE units) this item's
    /// completion should produce; negative means samp improves.
    pub estimated_samp_delta: i64,
    /// Opaque, process-unique, non-zero token identifying this job; used
    /// to claim kvsets and to match completion notifications back to the
    /// scheduler.
    pub workid: u64,
}

/// Handle a dispatched [`WorkItem`] is submitted to.
///
/// This is the scheduler's only outward-facing mutation surface: it does
/// not touch kvset bytes directly, it asks the worker pool to run an
/// action kernel and reports completion back asynchronously via
/// [`crate::scheduler::handle::Scheduler::notify_job_complete`].
pub trait WorkerPool: Send + Sync {
    /// Submits a planned work item for background execution. Returns
    /// `false` if the pool has no free capacity for this item's queue
    /// class (the scheduler will retry later).
    fn submit(&self, item: WorkItem) -> bool;
}

/// Executes the concrete action named by a [`WorkItem`].
///
/// Implemented by the storage engine; the scheduler only calls this
/// through a [`WorkerPool`], never directly, so these can run on worker
/// threads.
pub trait ActionKernels: Send + Sync {
    /// Runs the action named by `item` to completion, returning the
    /// resulting kvset run for the item's primary node (and, for splits,
    /// newly created sibling nodes).
    fn run(&self, item: &WorkItem) -> crate::scheduler::error::Result<ActionOutcome>;
}

/// The result of running an [`ActionKernels::run`] invocation.
#[derive(Debug, Default)]
pub struct ActionOutcome {
    /// The primary node's new kvset run, newest first.
    pub replacement_run: Option<VecDeque<Kvset>>,
    /// Newly created child nodes, for a split.
    pub new_nodes: Vec<Arc<Node>>,
    /// Node ids to remove from the tree, for a join.
    pub removed_node_ids: Vec<NodeId>,
    /// Observed wall-clock duration of the kernel invocation.
    pub duration_ns: u64,
}

/// An owned map of trees the scheduler monitors, keyed by id.
pub type TreeMap = FxHashMap<TreeId, Arc<Tree>>;

#[cfg(test)]
pub mod tests {
    //! In-memory fakes of [`ActionKernels`]/[`WorkerPool`] for unit tests.

    use super::*;
    use std::sync::Mutex as StdMutex;

    /// A kernel that always succeeds, dropping the oldest kvset of the
    /// claimed run and merging the rest into one synthetic kvset.
    #[derive(Default)]
    pub struct FakeKernels;

    impl ActionKernels for FakeKernels {
        fn run(&self, item: &WorkItem) -> crate::scheduler::error::Result<ActionOutcome> {
            let merged = Kvset {
                id: item.workid,
                dgen: item.workid,
                compc: 1,
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
                workid: AtomicU64::new(0),
            };
            let mut run = VecDeque::new();
            run.push_front(merged);
            Ok(ActionOutcome {
                replacement_run: Some(run),
                duration_ns: 1_000_000,
                ..ActionOutcome::default()
            })
        }
    }

    /// A worker pool that runs items synchronously in-line and records
    /// them, for deterministic assertions.
    #[derive(Default)]
    pub struct InlineWorkerPool {
        /// Items submitted so far.
        pub submitted: StdMutex<Vec<WorkItem>>,
    }

    impl WorkerPool for InlineWorkerPool {
        fn submit(&self, item: WorkItem) -> bool {
            #[expect(clippy::unwrap_used, reason = "test-only lock")]
            self.submitted.lock().unwrap().push(item);
            true
        }
    }

    fn kvset(id: KvsetId, keys: u64, tombs: u64, alen: u64) -> Kvset {
        Kvset {
            id,
            dgen: id,
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
            vgroups: 1,
            workid: AtomicU64::new(0),
        }
    }

    #[test]
    fn node_stats_aggregate_run() {
        let node = Node::new(1, 0, false, 1_000);
        node.push_newest(kvset(1, 10, 2, 100));
        node.push_newest(kvset(2, 20, 1, 200));

        let stats = node.stats();
        assert_eq!(stats.kvset_count, 2);
        assert_eq!(stats.keys, 30);
        assert_eq!(stats.tombs, 3);
        assert_eq!(stats.alen, 300);
    }

    #[test]
    fn busy_counter_packs_both_halves() {
        let node = Node::new(1, 0, false, 1_000);
        node.begin_job(3);
        assert_eq!(node.active_jobs(), 1);
        assert_eq!(node.claimed_kvsets(), 3);
        node.begin_job(2);
        assert_eq!(node.active_jobs(), 2);
        assert_eq!(node.claimed_kvsets(), 5);
        node.end_job(3);
        assert_eq!(node.active_jobs(), 1);
        assert_eq!(node.claimed_kvsets(), 2);
    }

    #[test]
    fn split_and_join_are_mutually_exclusive() {
        let node = Node::new(1, 0, false, 1_000);
        assert!(node.begin_split());
        assert!(!node.begin_join(JoinRole::Left));
        node.end_split();
        assert!(node.begin_join(JoinRole::Left));
        assert!(!node.begin_split());
        node.end_join();
        assert!(node.begin_split());
    }

    #[test]
    fn kvset_claim_is_exclusive() {
        let kv = kvset(1, 1, 0, 1);
        assert!(kv.try_claim(42));
        assert!(!kv.try_claim(43));
        kv.release();
        assert!(kv.try_claim(43));
    }
}
