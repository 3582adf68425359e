// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Space-amplification-driven compaction scheduler for a log-structured,
//! tree-based KV storage engine.
//!
//! The scheduler owns samp estimation, node classification, the seven
//! priority queues, job dispatch, split/join coordination, the throttle
//! sensor, the tree-shape auditor and the user-initiated-compaction
//! hysteresis. It does not perform kvset I/O, write metadata, allocate
//! media, or expose a CLI — those are reached only through the trait
//! interfaces in [`model`].
//!
//! # Example
//!
//! ```
//! use cn_scheduler::scheduler::{config::SchedulerConfig, handle::Scheduler, model::{Kvset, WorkItem, WorkerPool}};
//! use std::sync::{atomic::AtomicU64, Arc};
//!
//! struct NoopPool;
//!
//! impl WorkerPool for NoopPool {
//!     fn submit(&self, _item: WorkItem) -> bool {
//!         true
//!     }
//! }
//!
//! let scheduler = Scheduler::create(SchedulerConfig::default(), Arc::new(NoopPool))?;
//! scheduler.add_tree(/* tree id */ 0, /* root split size */ 64 * 1024 * 1024);
//!
//! scheduler.notify_ingest(0, /* root node id */ 0, Kvset {
//!     id: 1,
//!     dgen: 1,
//!     compc: 0,
//!     keys: 1_000,
//!     keys_uniq: 1_000,
//!     tombs: 0,
//!     ptombs: 0,
//!     kalen: 4_096,
//!     valen: 0,
//!     kwlen: 4_096,
//!     vwlen: 0,
//!     vblocks: 1,
//!     vgroups: 1,
//!     workid: AtomicU64::new(0),
//! })?;
//!
//! scheduler.shutdown();
//! # Ok::<(), cn_scheduler::scheduler::error::Error>(())
//! ```

/// Node classification into the seven work categories.
pub mod classifier;
/// Runtime-mutable scheduler configuration.
pub mod config;
/// Double-buffered dirty-id propagation.
pub mod dirty;
/// Round-robin job dispatch and the root-ready FIFO.
pub mod dispatcher;
/// The scheduler's caller-visible error type.
pub mod error;
/// FIFO event queues the monitor thread drains to apply ingest and job
/// completion notifications.
pub mod event_queue;
/// The scheduler's public external API.
pub mod handle;
/// Data model and external trait interfaces.
pub mod model;
/// The single dedicated monitor thread.
pub mod monitor;
/// Builds claimed work items from classified candidates.
pub mod planner;
/// Ordered, remove-by-key priority index for one work category.
pub mod priority_index;
/// Running space-amplification estimator.
pub mod samp;
/// Tree-shape auditor.
pub mod shape;
/// Derived threshold vector.
pub mod thresholds;
/// Throttle sensor advising callers when to slow ingest.
pub mod throttle;
/// Hysteretic user-initiated-compaction controller.
pub mod ucomp;

pub use config::SchedulerConfig;
pub use error::{Error, Result};
pub use handle::Scheduler;
pub use model::{ActionKernels, ActionOutcome, CnAction, Kvset, Node, Tree, WorkItem, WorkKind, WorkerPool};
