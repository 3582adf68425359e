// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Error type for the scheduler's caller-visible failure path.

/// Errors the scheduler can report back to its caller.
///
/// Everything else (planner refusals, clamped configuration, missed
/// cooldowns) is local recovery and never surfaces as a `Result::Err` — see
/// the module-level docs on [`crate::scheduler`].
#[derive(Debug)]
pub enum Error {
    /// The monitor thread could not be spawned, or a required in-memory
    /// allocation (a priority index, a dirty-list buffer) failed.
    Allocation(String),

    /// A tree with the given id was not found.
    UnknownTree(u64),

    /// A node with the given id was not found on its tree.
    UnknownNode(u64),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allocation(msg) => write!(f, "SchedulerError: allocation failed: {msg}"),
            Self::UnknownTree(id) => write!(f, "SchedulerError: unknown tree {id}"),
            Self::UnknownNode(id) => write!(f, "SchedulerError: unknown node {id}"),
        }
    }
}

impl std::error::Error for Error {}

/// Scheduler result.
pub type Result<T> = std::result::Result<T, Error>;
