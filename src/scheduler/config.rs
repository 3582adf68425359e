// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Runtime-mutable configuration for the scheduler.

/// Internal fixed-point scale used for samp/threshold arithmetic.
pub const SCALE: i64 = 10_000;

/// External fixed-point scale (percent-like) used when reporting samp to
/// callers.
pub const EXT_SCALE: i64 = 100;

/// Per-category debug logging toggles.
///
/// Mirrors `csched_rp_dbg_*` in the original: each subsystem can be made
/// chattier independently without raising the log level crate-wide.
#[derive(Clone, Copy, Debug, Default)]
pub struct SchedulerDebug {
    /// Log tree add/remove lifecycle events.
    pub tree_life: bool,

    /// Log every dirty-node propagation.
    pub dirty_node: bool,

    /// Log classify/plan decisions.
    pub sched: bool,

    /// Log the throttle sensor on every QoS checkpoint.
    pub qos: bool,

    /// Log priority-index insert/remove traffic.
    pub rbtree: bool,

    /// Log tree-shape auditor findings.
    pub tree_shape: bool,
}

/// Scheduler configuration.
///
/// A plain struct with documented public fields, a [`Default`] impl, and
/// `with_*` builder methods. This does not parse text or environment
/// variables — callers construct it programmatically and install it via
/// [`crate::scheduler::handle::Scheduler::update_config`].
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Maximum tolerable space amplification, external percent (e.g. `150`
    /// means samp must stay below 1.50x).
    pub samp_max_pct: u32,

    /// Low watermark percent of `samp_max_pct` at which user-initiated
    /// compaction's samp-reduce flag clears.
    pub lo_th_pct: u32,

    /// High watermark percent of `samp_max_pct` at which user-initiated
    /// compaction's samp-reduce flag sets.
    pub hi_th_pct: u32,

    /// Target percentage of tree capacity that should live in leaves
    /// (as opposed to internal/root nodes).
    pub leaf_pct: u32,

    /// Root length (kvset run length) above which a root is a spill
    /// candidate. Defaults to 48, matching the original's hardcoded
    /// threshold.
    pub root_len_max: u32,

    /// Leaf length above which a leaf is a compaction candidate.
    /// Defaults to 20.
    pub leaf_len_max: u32,

    /// Leaf capacity percent above which a leaf is a split candidate.
    /// Defaults to 140 (1.40x its nominal split size).
    pub leaf_pcap_max: u32,

    /// Starting garbage-percent threshold for the `garbage` category;
    /// escalates as leaf-percent falls behind target (see
    /// `planner::garbage_threshold_escalation`).
    pub garbage_pct_threshold: u32,

    /// Minimum contiguous run of unclaimed root kvsets before a spill is
    /// worth doing at all; a shorter run defers (rule `tspill`).
    pub rspill_runlen_min: u32,

    /// Maximum kvsets a single root spill claims in one job.
    pub rspill_runlen_max: u32,

    /// Maximum kvsets a single garbage/length compaction claims in one
    /// job.
    pub lcomp_runlen_max: u32,

    /// Maximum scatter (vgroup count) run length before a node is a
    /// scatter-reduce candidate.
    pub scatter_runlen_max: u32,

    /// Scatter high-water mark (vgroup count) above which scatter work is
    /// prioritized regardless of cooldown.
    pub scatter_hwm: u32,

    /// Per-category concurrency caps, indexed by
    /// [`crate::scheduler::model::WorkKind`] discriminant order.
    pub queue_caps: [u32; 7],

    /// Worker-pool thread count the dispatcher assumes is available.
    pub qthreads: u32,

    /// QoS checkpoint interval.
    pub checkpoint_qos: std::time::Duration,

    /// Schedule (classify + dispatch) checkpoint interval.
    pub checkpoint_schedule: std::time::Duration,

    /// Settings-refresh checkpoint interval.
    pub checkpoint_settings: std::time::Duration,

    /// Tree-shape audit checkpoint interval.
    pub checkpoint_shape: std::time::Duration,

    /// Global kill switch: disables all non-split/join maintenance work
    /// while leaving split/join coordination active.
    pub maint_disable: bool,

    /// Per-subsystem debug logging toggles.
    pub debug: SchedulerDebug,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            samp_max_pct: 150,
            lo_th_pct: 25,
            hi_th_pct: 75,
            leaf_pct: 90,

            root_len_max: 48,
            leaf_len_max: 20,
            leaf_pcap_max: 140,

            garbage_pct_threshold: 50,

            rspill_runlen_min: 4,
            rspill_runlen_max: 36,
            lcomp_runlen_max: 8,

            scatter_runlen_max: 3,
            scatter_hwm: 6,

            queue_caps: [2, 2, 2, 1, 1, 2, 2],
            qthreads: /* default worker pool size */ 4,

            checkpoint_qos: std::time::Duration::from_millis(333),
            checkpoint_schedule: std::time::Duration::from_secs(3),
            checkpoint_settings: std::time::Duration::from_secs(10),
            checkpoint_shape: std::time::Duration::from_secs(15),

            maint_disable: false,
            debug: SchedulerDebug::default(),
        }
    }
}

impl SchedulerConfig {
    /// Sets the maximum tolerable space amplification, as a percent (e.g.
    /// `150` for 1.50x).
    ///
    /// # Panics
    ///
    /// Panics if `pct` is below 100 (samp can never go below 1.0x).
    #[must_use]
    pub fn samp_max_pct(mut self, pct: u32) -> Self {
        assert!(pct >= 100, "samp_max_pct must be at least 100");
        self.samp_max_pct = pct;
        self
    }

    /// Sets the low/high watermark percentages for the user-initiated
    /// compaction hysteresis.
    ///
    /// # Panics
    ///
    /// Panics if `lo >= hi` or either is outside `0..=100`.
    #[must_use]
    pub fn watermarks_pct(mut self, lo: u32, hi: u32) -> Self {
        assert!(lo < hi && hi <= 100, "invalid watermark percentages");
        self.lo_th_pct = lo;
        self.hi_th_pct = hi;
        self
    }

    /// Sets the target leaf percentage of tree capacity.
    #[must_use]
    pub fn leaf_pct(mut self, pct: u32) -> Self {
        self.leaf_pct = pct;
        self
    }

    /// Sets the per-category concurrency caps.
    #[must_use]
    pub fn queue_caps(mut self, caps: [u32; 7]) -> Self {
        self.queue_caps = caps;
        self
    }

    /// Sets the worker-pool size the dispatcher assumes is available.
    ///
    /// # Panics
    ///
    /// Panics if `n` is 0.
    #[must_use]
    pub fn qthreads(mut self, n: u32) -> Self {
        assert!(n > 0, "qthreads must be non-zero");
        self.qthreads = n;
        self
    }

    /// Enables or disables the global maintenance kill switch.
    #[must_use]
    pub fn maint_disable(mut self, disable: bool) -> Self {
        self.maint_disable = disable;
        self
    }

    /// Sets per-subsystem debug logging toggles.
    #[must_use]
    pub fn debug(mut self, debug: SchedulerDebug) -> Self {
        self.debug = debug;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "samp_max_pct")]
    fn rejects_sub_unity_samp_max() {
        let _ = SchedulerConfig::default().samp_max_pct(50);
    }

    #[test]
    fn builder_roundtrips() {
        let cfg = SchedulerConfig::default()
            .samp_max_pct(200)
            .watermarks_pct(10, 90)
            .leaf_pct(80)
            .qthreads(8);

        assert_eq!(cfg.samp_max_pct, 200);
        assert_eq!(cfg.lo_th_pct, 10);
        assert_eq!(cfg.hi_th_pct, 90);
        assert_eq!(cfg.leaf_pct, 80);
        assert_eq!(cfg.qthreads, 8);
    }
}
