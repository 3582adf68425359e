// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The monitor: a single dedicated thread running a condvar-driven
//! reactor loop with periodic checkpoints at different intervals.
//!
//! Grounded on `sp3_monitor` in `csched_sp3.c`: no async runtime is
//! introduced here, just a plain `std::thread::spawn` loop woken by a
//! `Condvar`.

use crate::scheduler::config::SchedulerConfig;
use crate::scheduler::dirty::DirtyLists;
use crate::scheduler::dispatcher::Dispatcher;
use crate::scheduler::event_queue::{CompletionEvent, EventQueue, IngestEvent};
use crate::scheduler::model::{NodeId, TreeId, TreeMap, WorkerPool};
use crate::scheduler::samp::SampEstimator;
use crate::scheduler::thresholds::Thresholds;
use crate::scheduler::ucomp::UcompController;
use crate::stop_signal::StopSignal;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

/// State shared between [`crate::scheduler::handle::Scheduler`] (and its
/// clones) and the monitor thread.
pub struct MonitorShared {
    pub(crate) trees: RwLock<TreeMap>,
    pub(crate) config: RwLock<SchedulerConfig>,
    pub(crate) pool: Arc<dyn WorkerPool>,
    pub(crate) dispatcher: Mutex<Dispatcher>,
    pub(crate) samp: Mutex<FxHashMap<TreeId, Arc<SampEstimator>>>,
    pub(crate) ucomp: Mutex<FxHashMap<TreeId, Arc<UcompController>>>,
    pub(crate) dirty_nodes: DirtyLists<NodeId>,
    pub(crate) dirty_trees: DirtyLists<TreeId>,
    pub(crate) ingest_queue: EventQueue<IngestEvent>,
    pub(crate) completion_queue: EventQueue<CompletionEvent>,
    pub(crate) wakeup: Condvar,
    pub(crate) wakeup_lock: Mutex<()>,
}

impl MonitorShared {
    /// A cloned snapshot of the current configuration.
    pub(crate) fn config(&self) -> SchedulerConfig {
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        self.config.read().unwrap().clone()
    }

    /// Marks a node dirty for reclassification at the next schedule
    /// checkpoint.
    pub(crate) fn dispatcher_mark_dirty(&self, node_id: NodeId) {
        self.dirty_nodes.mark(node_id);
    }

    /// Queues an ingest event for the monitor thread to apply at the next
    /// schedule checkpoint. Safe to call from any thread.
    pub(crate) fn queue_ingest(&self, event: IngestEvent) {
        self.ingest_queue.push(event);
    }

    /// Queues a job-completion event for the monitor thread to apply at
    /// the next schedule checkpoint. Safe to call from any thread.
    pub(crate) fn queue_completion(&self, event: CompletionEvent) {
        self.completion_queue.push(event);
    }
}

/// The monitor thread body.
pub struct Monitor {
    shared: Arc<MonitorShared>,
    stop_signal: StopSignal,
}

struct Checkpoints {
    last_qos: Instant,
    last_schedule: Instant,
    last_settings: Instant,
    last_shape: Instant,
}

impl Checkpoints {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            last_qos: now,
            last_schedule: now,
            last_settings: now,
            last_shape: now,
        }
    }
}

impl Monitor {
    /// Creates a new monitor body. Call [`Monitor::run`] on a dedicated
    /// thread.
    #[must_use]
    pub fn new(shared: Arc<MonitorShared>, stop_signal: StopSignal) -> Self {
        Self { shared, stop_signal }
    }

    /// Runs the reactor loop until the stop signal is set.
    pub fn run(self) {
        let mut checkpoints = Checkpoints::new();
        let mut tree_count_hint = 1u32;

        while !self.stop_signal.is_stopped() {
            let config = self.shared.config();
            let now = Instant::now();

            if now.duration_since(checkpoints.last_settings) >= config.checkpoint_settings {
                checkpoints.last_settings = now;
                if config.debug.sched {
                    log::trace!("settings-refresh checkpoint");
                }
            }

            if now.duration_since(checkpoints.last_schedule) >= config.checkpoint_schedule {
                checkpoints.last_schedule = now;
                tree_count_hint = self.run_schedule_checkpoint(&config, tree_count_hint);
            }

            if now.duration_since(checkpoints.last_qos) >= config.checkpoint_qos {
                checkpoints.last_qos = now;
                self.run_qos_checkpoint(&config, tree_count_hint);
            }

            if now.duration_since(checkpoints.last_shape) >= config.checkpoint_shape {
                checkpoints.last_shape = now;
                self.run_shape_checkpoint(&config);
            }

            let wait_for = [
                config.checkpoint_qos,
                config.checkpoint_schedule,
                config.checkpoint_settings,
                config.checkpoint_shape,
            ]
            .into_iter()
            .min()
            .unwrap_or(Duration::from_millis(100));

            #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
            let guard = self.shared.wakeup_lock.lock().unwrap();
            let _ = self.shared.wakeup.wait_timeout(guard, wait_for);
        }
    }

    fn run_schedule_checkpoint(&self, config: &SchedulerConfig, _tree_count_hint: u32) -> u32 {
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        let trees = self.shared.trees.read().unwrap();
        let tree_count = u32::try_from(trees.len()).unwrap_or(1).max(1);
        let thresholds = Thresholds::compute(config, tree_count);

        self.apply_completions(&trees, config);
        self.apply_ingests(&trees, config);

        let dirty = self.shared.dirty_nodes.swap_and_drain();
        if !dirty.is_empty() {
            #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
            let mut dispatcher = self.shared.dispatcher.lock().unwrap();
            for node_id in dirty {
                for tree in trees.values() {
                    if let Some(node) = tree.node(node_id) {
                        let nodes = tree.nodes();
                        let left_neighbor = nodes
                            .iter()
                            .position(|n| n.id == node_id)
                            .and_then(|pos| pos.checked_sub(1))
                            .and_then(|i| nodes.get(i));
                        let candidates =
                            crate::scheduler::classifier::classify(&node, left_neighbor.map(std::convert::AsRef::as_ref), &thresholds);
                        if config.debug.dirty_node {
                            log::trace!("reclassified node {node_id}: {} candidates", candidates.len());
                        }
                        dispatcher.update_candidates(node_id, &candidates);
                        break;
                    }
                }
            }
        }

        let dirty_trees = self.shared.dirty_trees.swap_and_drain();
        if !dirty_trees.is_empty() && config.debug.sched {
            log::trace!("applied ingest/completion events touching {} tree(s)", dirty_trees.len());
        }

        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        let dispatcher = self.shared.dispatcher.lock().unwrap();
        let dispatched = dispatcher.dispatch_tick(&trees, self.shared.pool.as_ref(), &config.queue_caps, &thresholds);
        if dispatched > 0 && config.debug.sched {
            log::debug!("dispatched {dispatched} jobs this tick");
        }

        tree_count
    }

    /// Drains the completion queue and applies each finished job's
    /// outcome: node/tree structural updates, dispatcher bookkeeping, and
    /// dirty propagation. Only called from the monitor thread, so this is
    /// the sole place completion outcomes are applied to decision state.
    fn apply_completions(&self, trees: &TreeMap, config: &SchedulerConfig) {
        let events = self.shared.completion_queue.drain();
        if events.is_empty() {
            return;
        }

        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        let dispatcher = self.shared.dispatcher.lock().unwrap();
        for CompletionEvent { item, outcome } in events {
            let Some(tree) = trees.get(&item.tree_id) else {
                continue;
            };
            let Some(node) = tree.node(item.node_id) else {
                continue;
            };

            if let Some(run) = outcome.replacement_run {
                node.replace_run(run);
            }
            for new_node in outcome.new_nodes {
                tree.add_nodes([new_node]);
            }
            for removed in outcome.removed_node_ids {
                tree.remove_node(removed);
            }

            node.end_job(u16::try_from(item.kvset_ids.len()).unwrap_or(u16::MAX));
            match item.action {
                crate::scheduler::model::CnAction::Split => node.end_split(),
                crate::scheduler::model::CnAction::Join => node.end_join(),
                crate::scheduler::model::CnAction::Spill => {
                    tree.record_rspill_latency(outcome.duration_ns);
                }
                crate::scheduler::model::CnAction::CompactK | crate::scheduler::model::CnAction::CompactKv => {}
            }

            dispatcher.job_finished(item.kind);
            if matches!(
                item.kind,
                crate::scheduler::model::WorkKind::Garbage | crate::scheduler::model::WorkKind::Scatter
            ) {
                dispatcher.start_cooldown(item.kind, Duration::from_secs(5));
            }

            self.shared.dirty_nodes.mark(item.node_id);
            self.shared.dirty_trees.mark(item.tree_id);
            if config.debug.sched {
                log::debug!("applied completion for node {} ({:?}, rule {})", item.node_id, item.kind, item.rule);
            }
        }
    }

    /// Drains the ingest queue and applies each ingested kvset: samp
    /// adjustment, the tree's cumulative ingest accumulators, and the
    /// node's kvset run. Only called from the monitor thread, so this is
    /// the sole place ingest deltas are applied to decision state.
    fn apply_ingests(&self, trees: &TreeMap, config: &SchedulerConfig) {
        let events = self.shared.ingest_queue.drain();
        if events.is_empty() {
            return;
        }

        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        let samp_map = self.shared.samp.lock().unwrap();
        for IngestEvent { tree_id, node_id, kvset } in events {
            let Some(tree) = trees.get(&tree_id) else {
                continue;
            };
            let Some(node) = tree.node(node_id) else {
                continue;
            };

            let alen = i64::try_from(kvset.alen()).unwrap_or(i64::MAX);
            let wlen = i64::try_from(kvset.wlen()).unwrap_or(i64::MAX);

            if let Some(samp) = samp_map.get(&tree_id) {
                if node.is_root {
                    samp.adjust_root(alen, wlen);
                } else {
                    samp.adjust_leaf(alen, alen);
                }
            }

            tree.ingest_alen.fetch_add(alen, std::sync::atomic::Ordering::AcqRel);
            tree.ingest_wlen.fetch_add(wlen, std::sync::atomic::Ordering::AcqRel);

            node.push_newest(kvset);
            self.shared.dirty_nodes.mark(node_id);
            self.shared.dirty_trees.mark(tree_id);
            if config.debug.dirty_node {
                log::trace!("applied ingest into node {node_id} of tree {tree_id}");
            }
        }
    }

    fn run_qos_checkpoint(&self, config: &SchedulerConfig, tree_count: u32) {
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        let trees = self.shared.trees.read().unwrap();
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        let samp_map = self.shared.samp.lock().unwrap();
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        let ucomp_map = self.shared.ucomp.lock().unwrap();
        let thresholds = Thresholds::compute(config, tree_count);

        for (tree_id, tree) in trees.iter() {
            let Some(samp) = samp_map.get(tree_id) else {
                continue;
            };
            let value = samp.samp();

            if config.debug.qos {
                let excess = tree
                    .root()
                    .stats()
                    .kvset_count
                    .saturating_sub(thresholds.root_len_max);
                let sval = crate::scheduler::throttle::sensor_value(
                    tree.rspill_latency_ns.load(std::sync::atomic::Ordering::Acquire),
                    excess,
                    tree.rspill_sleepers.load(std::sync::atomic::Ordering::Acquire),
                );
                let (r_alen, r_wlen) = samp.root_bytes();
                let ingest_alen = tree.ingest_alen.load(std::sync::atomic::Ordering::Acquire);
                let ingest_wlen = tree.ingest_wlen.load(std::sync::atomic::Ordering::Acquire);
                log::trace!(
                    "tree {tree_id} samp={value} throttle_sensor={sval} root_alen={r_alen} root_wlen={r_wlen} ingest_alen={ingest_alen} ingest_wlen={ingest_wlen}"
                );
            }

            if let Some(ctl) = ucomp_map.get(tree_id) {
                ctl.update(value, thresholds.samp_lo, thresholds.samp_hi);
            }
        }
    }

    fn run_shape_checkpoint(&self, config: &SchedulerConfig) {
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        let trees = self.shared.trees.read().unwrap();
        let tree_count = u32::try_from(trees.len()).unwrap_or(1).max(1);
        let thresholds = Thresholds::compute(config, tree_count);

        for tree in trees.values() {
            let findings = crate::scheduler::shape::audit(tree, &thresholds);
            if !findings.is_empty() && config.debug.tree_shape {
                log::debug!("tree {} shape findings: {:?}", tree.id, findings);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::model::tests::InlineWorkerPool;
    use crate::scheduler::model::Tree;
    use test_log::test;

    fn make_shared() -> Arc<MonitorShared> {
        let mut config = SchedulerConfig::default();
        config.checkpoint_qos = Duration::from_millis(5);
        config.checkpoint_schedule = Duration::from_millis(5);
        config.checkpoint_settings = Duration::from_millis(5);
        config.checkpoint_shape = Duration::from_millis(5);

        Arc::new(MonitorShared {
            trees: RwLock::new(TreeMap::default()),
            config: RwLock::new(config),
            pool: Arc::new(InlineWorkerPool::default()),
            dispatcher: Mutex::new(Dispatcher::new()),
            samp: Mutex::new(FxHashMap::default()),
            ucomp: Mutex::new(FxHashMap::default()),
            dirty_nodes: DirtyLists::new(),
            dirty_trees: DirtyLists::new(),
            ingest_queue: EventQueue::new(),
            completion_queue: EventQueue::new(),
            wakeup: Condvar::new(),
            wakeup_lock: Mutex::new(()),
        })
    }

    #[test]
    fn monitor_runs_one_pass_and_stops_cleanly() {
        let shared = make_shared();
        #[expect(clippy::unwrap_used)]
        shared
            .trees
            .write()
            .unwrap()
            .insert(0, Arc::new(Tree::new(0, 1_000_000)));

        let stop_signal = StopSignal::default();
        let monitor = Monitor::new(Arc::clone(&shared), stop_signal.clone());

        let handle = std::thread::spawn(move || monitor.run());
        std::thread::sleep(Duration::from_millis(30));
        stop_signal.send();
        shared.wakeup.notify_all();
        handle.join().expect("monitor thread should not panic");
    }

    fn test_kvset(id: crate::scheduler::model::KvsetId, alen: u64) -> crate::scheduler::model::Kvset {
        crate::scheduler::model::Kvset {
            id,
            dgen: id,
            compc: 0,
            keys: 1,
            keys_uniq: 1,
            tombs: 0,
            ptombs: 0,
            kalen: alen,
            valen: 0,
            kwlen: alen,
            vwlen: 0,
            vblocks: 1,
            vgroups: 1,
            workid: std::sync::atomic::AtomicU64::new(0),
        }
    }

    #[test]
    fn queued_ingest_is_not_applied_until_drained() {
        let shared = make_shared();
        #[expect(clippy::unwrap_used)]
        shared.trees.write().unwrap().insert(0, Arc::new(Tree::new(0, 1_000_000)));

        shared.queue_ingest(IngestEvent {
            tree_id: 0,
            node_id: 0,
            kvset: test_kvset(1, 100),
        });

        #[expect(clippy::unwrap_used)]
        let tree = shared.trees.read().unwrap().get(&0).unwrap().clone();
        assert_eq!(tree.root().stats().kvset_count, 0);

        let monitor = Monitor::new(Arc::clone(&shared), StopSignal::default());
        #[expect(clippy::unwrap_used)]
        let trees = shared.trees.read().unwrap();
        monitor.apply_ingests(&trees, &shared.config());
        drop(trees);

        assert_eq!(tree.root().stats().kvset_count, 1);
        assert_eq!(tree.ingest_alen.load(std::sync::atomic::Ordering::Acquire), 100);
    }

    #[test]
    fn queued_completion_is_not_applied_until_drained() {
        let shared = make_shared();
        #[expect(clippy::unwrap_used)]
        shared.trees.write().unwrap().insert(0, Arc::new(Tree::new(0, 1_000_000)));
        #[expect(clippy::unwrap_used)]
        let tree = shared.trees.read().unwrap().get(&0).unwrap().clone();
        let root = tree.root();
        root.push_newest(test_kvset(1, 100));
        root.begin_job(1);

        let item = crate::scheduler::model::WorkItem {
            kind: crate::scheduler::model::WorkKind::Root,
            tree_id: 0,
            node_id: 0,
            peer_node_id: None,
            action: crate::scheduler::model::CnAction::Spill,
            kvset_ids: vec![1],
            rule: "test",
            estimated_samp_delta: 0,
            workid: 1,
        };
        let mut replacement = std::collections::VecDeque::new();
        replacement.push_front(test_kvset(2, 10));
        let outcome = crate::scheduler::model::ActionOutcome {
            replacement_run: Some(replacement),
            duration_ns: 1,
            ..crate::scheduler::model::ActionOutcome::default()
        };

        shared.queue_completion(CompletionEvent { item, outcome });
        assert_eq!(root.stats().alen, 100);
        assert_eq!(root.active_jobs(), 1);

        let monitor = Monitor::new(Arc::clone(&shared), StopSignal::default());
        #[expect(clippy::unwrap_used)]
        let trees = shared.trees.read().unwrap();
        monitor.apply_completions(&trees, &shared.config());
        drop(trees);

        assert_eq!(root.stats().alen, 10);
        assert_eq!(root.active_jobs(), 0);
    }
}
