// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A space-amplification-driven compaction scheduler for a log-structured,
//! tree-based KV storage engine.
//!
//! ##### About
//!
//! The scheduler owns the decision of *what to compact next*: it estimates
//! space amplification from running counters, classifies each node into
//! zero or more of seven work categories (root spill, length reduction,
//! garbage collection, scatter reduction, idle compaction, split, join),
//! keeps one ordered priority index per category, and dispatches jobs to a
//! worker pool in round robin under per-category concurrency caps. It also
//! runs a throttle sensor advising callers when to slow down ingest, a
//! tree-shape auditor, and a hysteretic controller for user-initiated
//! compaction.
//!
//! It does not perform kvset I/O, persist metadata, allocate underlying
//! storage, or expose a CLI — see [`scheduler::model`] for the trait
//! interfaces a storage engine implements to plug into it.
//!
//! See [`mod@scheduler`] for the full module map and
//! [`scheduler::handle::Scheduler`] for the entry point.
//!
//! # Example usage
//!
//! ```
//! use cn_scheduler::scheduler::{config::SchedulerConfig, handle::Scheduler, model::WorkerPool};
//! use std::sync::Arc;
//!
//! // A real storage engine submits planned work items to its own worker
//! // pool; here we just drop them.
//! struct NoopPool;
//!
//! impl WorkerPool for NoopPool {
//!     fn submit(&self, _item: cn_scheduler::scheduler::model::WorkItem) -> bool {
//!         true
//!     }
//! }
//!
//! let scheduler = Scheduler::create(SchedulerConfig::default(), Arc::new(NoopPool))?;
//!
//! scheduler.add_tree(/* tree id */ 0, /* root split size */ 64 * 1024 * 1024);
//! scheduler.shutdown();
//! #
//! # Ok::<(), cn_scheduler::scheduler::Error>(())
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

pub mod scheduler;

#[doc(hidden)]
pub mod stop_signal;
