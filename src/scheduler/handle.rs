// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The scheduler's public external API.
//!
//! Cloning a handle is cheap (an `Arc` clone) and every clone shares the
//! same monitor thread; shutdown uses [`crate::stop_signal::StopSignal`]
//! to stop that thread gracefully.

use crate::scheduler::config::SchedulerConfig;
use crate::scheduler::error::{Error, Result};
use crate::scheduler::model::{ActionOutcome, Kvset, NodeId, Tree, TreeId, TreeMap, WorkItem, WorkerPool};
use crate::scheduler::monitor::{Monitor, MonitorShared};
use crate::stop_signal::StopSignal;
use std::sync::{Arc, Mutex, RwLock};

/// Handle to a running compaction scheduler.
///
/// Cloning a `Scheduler` is cheap and shares the same monitor thread and
/// state. Call [`Scheduler::shutdown`] explicitly to stop the monitor
/// thread and block until it exits; dropping every clone without calling
/// it leaves the monitor thread running.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<MonitorShared>,
    stop_signal: StopSignal,
    join_handle: Arc<Mutex<Option<std::thread::JoinHandle<()>>>>,
}

impl Scheduler {
    /// Creates a new scheduler with the given configuration and worker
    /// pool, and spawns its monitor thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] if the monitor thread could not be
    /// spawned.
    pub fn create(config: SchedulerConfig, pool: Arc<dyn WorkerPool>) -> Result<Self> {
        let stop_signal = StopSignal::default();
        let shared = Arc::new(MonitorShared {
            trees: RwLock::new(TreeMap::default()),
            config: RwLock::new(config),
            pool,
            dispatcher: Mutex::new(crate::scheduler::dispatcher::Dispatcher::new()),
            samp: Mutex::new(rustc_hash::FxHashMap::default()),
            ucomp: Mutex::new(rustc_hash::FxHashMap::default()),
            dirty_nodes: crate::scheduler::dirty::DirtyLists::new(),
            dirty_trees: crate::scheduler::dirty::DirtyLists::new(),
            ingest_queue: crate::scheduler::event_queue::EventQueue::new(),
            completion_queue: crate::scheduler::event_queue::EventQueue::new(),
            wakeup: std::sync::Condvar::new(),
            wakeup_lock: Mutex::new(()),
        });

        let monitor = Monitor::new(Arc::clone(&shared), stop_signal.clone());
        let join_handle = std::thread::Builder::new()
            .name("cn-sched-monitor".into())
            .spawn(move || monitor.run())
            .map_err(|e| Error::Allocation(e.to_string()))?;

        log::info!("scheduler monitor thread started");

        Ok(Self {
            shared,
            stop_signal,
            join_handle: Arc::new(Mutex::new(Some(join_handle))),
        })
    }

    /// Starts monitoring a new tree, giving its root this split-trigger
    /// capacity in bytes.
    pub fn add_tree(&self, tree_id: TreeId, root_split_size: u64) {
        let tree = Arc::new(Tree::new(tree_id, root_split_size));
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        self.shared.trees.write().unwrap().insert(tree_id, tree);
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        self.shared
            .samp
            .lock()
            .unwrap()
            .insert(tree_id, Arc::new(crate::scheduler::samp::SampEstimator::default()));
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        self.shared
            .ucomp
            .lock()
            .unwrap()
            .insert(tree_id, Arc::new(crate::scheduler::ucomp::UcompController::new()));

        if self.shared.config().debug.tree_life {
            log::info!("tree {tree_id} added to scheduler");
        }
        self.wake();
    }

    /// Stops monitoring a tree.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTree`] if `tree_id` was never added.
    pub fn remove_tree(&self, tree_id: TreeId) -> Result<()> {
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        let removed = self.shared.trees.write().unwrap().remove(&tree_id);
        if removed.is_none() {
            return Err(Error::UnknownTree(tree_id));
        }
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        self.shared.samp.lock().unwrap().remove(&tree_id);
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        self.shared.ucomp.lock().unwrap().remove(&tree_id);

        if self.shared.config().debug.tree_life {
            log::info!("tree {tree_id} removed from scheduler");
        }
        Ok(())
    }

    /// Notifies the scheduler that `kvset` was freshly ingested into
    /// `node_id` of `tree_id` (e.g. a memtable flush).
    ///
    /// This only validates the ids and queues the event; the monitor
    /// thread applies the samp adjustment, the tree's ingest accumulators,
    /// and the node's run update at its next schedule checkpoint, so
    /// decision state is only ever touched from that one thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTree`]/[`Error::UnknownNode`] if either id
    /// is not currently monitored.
    pub fn notify_ingest(&self, tree_id: TreeId, node_id: NodeId, kvset: Kvset) -> Result<()> {
        let tree = self.tree(tree_id)?;
        if tree.node(node_id).is_none() {
            return Err(Error::UnknownNode(node_id));
        }

        self.shared.queue_ingest(crate::scheduler::event_queue::IngestEvent { tree_id, node_id, kvset });
        self.wake();
        Ok(())
    }

    /// Notifies the scheduler that a previously-dispatched job finished.
    ///
    /// This only validates the ids and queues the event; the monitor
    /// thread applies the node/tree structural update and dispatcher
    /// bookkeeping at its next schedule checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTree`]/[`Error::UnknownNode`] if either id
    /// is not currently monitored.
    pub fn notify_job_complete(&self, item: &WorkItem, outcome: ActionOutcome) -> Result<()> {
        let tree = self.tree(item.tree_id)?;
        if tree.node(item.node_id).is_none() {
            return Err(Error::UnknownNode(item.node_id));
        }

        self.shared.queue_completion(crate::scheduler::event_queue::CompletionEvent {
            item: item.clone(),
            outcome,
        });
        self.wake();
        Ok(())
    }

    /// Installs a new configuration, taking effect at the next
    /// settings-refresh checkpoint.
    pub fn update_config(&self, config: SchedulerConfig) {
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        {
            *self.shared.config.write().unwrap() = config;
        }
        self.wake();
    }

    /// Signals the monitor thread to stop and blocks until it exits.
    pub fn shutdown(&self) {
        self.stop_signal.send();
        self.wake();
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        if let Some(handle) = self.join_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        log::info!("scheduler monitor thread stopped");
    }

    fn tree(&self, tree_id: TreeId) -> Result<Arc<Tree>> {
        #[expect(clippy::unwrap_used, reason = "lock is only ever held briefly")]
        self.shared
            .trees
            .read()
            .unwrap()
            .get(&tree_id)
            .cloned()
            .ok_or(Error::UnknownTree(tree_id))
    }

    fn wake(&self) {
        self.shared.wakeup.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::model::tests::InlineWorkerPool;
    use test_log::test;

    #[test]
    fn create_add_tree_and_shutdown() -> Result<()> {
        let pool = Arc::new(InlineWorkerPool::default());
        let scheduler = Scheduler::create(SchedulerConfig::default(), pool)?;
        scheduler.add_tree(0, 1_000_000);
        scheduler.remove_tree(0)?;
        scheduler.shutdown();
        Ok(())
    }

    #[test]
    fn notify_ingest_on_unknown_tree_errors() {
        let pool = Arc::new(InlineWorkerPool::default());
        let scheduler = Scheduler::create(SchedulerConfig::default(), pool).expect("create");
        let kvset = crate::scheduler::model::Kvset {
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
        };
        assert!(scheduler.notify_ingest(99, 0, kvset).is_err());
        scheduler.shutdown();
    }

    #[test]
    fn notify_ingest_is_applied_by_the_monitor_thread() {
        let pool = Arc::new(InlineWorkerPool::default());
        let mut config = SchedulerConfig::default();
        config.checkpoint_schedule = std::time::Duration::from_millis(5);
        let scheduler = Scheduler::create(config, pool).expect("create");
        scheduler.add_tree(0, 1_000_000);

        let kvset = crate::scheduler::model::Kvset {
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
        };
        scheduler.notify_ingest(0, 0, kvset).expect("known tree/node");

        let root = {
            #[expect(clippy::unwrap_used, reason = "test-only lock")]
            scheduler.shared.trees.read().unwrap().get(&0).unwrap().root()
        };

        let mut applied = false;
        for _ in 0..50 {
            if root.stats().kvset_count == 1 {
                applied = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(applied, "monitor thread should have applied the queued ingest event");

        scheduler.shutdown();
    }
}
