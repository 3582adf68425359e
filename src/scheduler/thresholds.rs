// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Derives the scaled threshold vector consumed by the classifier and
//! planner from the caller-facing [`SchedulerConfig`].

use crate::scheduler::config::{SchedulerConfig, EXT_SCALE, SCALE};

/// Scaled thresholds, recomputed whenever the settings-refresh checkpoint
/// fires or configuration changes.
#[derive(Clone, Copy, Debug)]
pub struct Thresholds {
    /// Maximum samp, internal SCALE units.
    pub samp_max: i64,
    /// Low watermark samp, internal SCALE units.
    pub samp_lo: i64,
    /// High watermark samp, internal SCALE units.
    pub samp_hi: i64,
    /// Target leaf fraction, internal SCALE units.
    pub leaf_target: i64,
    /// Root run-length ceiling before a root is a spill candidate.
    pub root_len_max: u32,
    /// Leaf run-length ceiling before a leaf is a compaction candidate.
    pub leaf_len_max: u32,
    /// Leaf capacity percent ceiling before a leaf is a split candidate.
    pub leaf_pcap_max: u32,
    /// Garbage percent threshold, possibly escalated (see
    /// `planner::garbage_threshold_escalation`).
    pub garbage_pct: u32,
    /// Minimum contiguous unclaimed root run before a spill is worth
    /// doing.
    pub rspill_runlen_min: u32,
    /// Maximum kvsets a single root spill claims.
    pub rspill_runlen_max: u32,
    /// Maximum kvsets a single garbage/length compaction claims.
    pub lcomp_runlen_max: u32,
    /// Scatter run-length ceiling.
    pub scatter_runlen_max: u32,
    /// Scatter high-water mark.
    pub scatter_hwm: u32,
}

impl Thresholds {
    /// Derives thresholds from `config`, scaling the samp watermarks by
    /// `tree_count` the way `sp3_refresh_thresholds` amortizes a single
    /// global samp budget across every monitored tree.
    ///
    /// `samp_lo`/`samp_hi` follow the "Derived scaling" fixed-point
    /// formulas: `good_min = (1 + R)/samp_max`, `good_lwm = good_min + (1 −
    /// lwm)·range`, `good_hwm = good_min + (1 − hwm)·range`, `samp_lwm = (1
    /// + R)/good_lwm`, `samp_hwm = (1 + R)/good_hwm`, where `R = 1 −
    /// leaf_pct` and `range = 1 − good_min`. All quantities are carried as
    /// fractions scaled by [`SCALE`].
    #[must_use]
    pub fn compute(config: &SchedulerConfig, tree_count: u32) -> Self {
        let tree_count = i64::from(tree_count.max(1));

        let ext_to_internal = |pct: u32| (i64::from(pct) * SCALE) / EXT_SCALE;
        let frac_div = |a: i64, b: i64| (a * SCALE) / b.max(1);
        let frac_mul = |a: i64, b: i64| (a * b) / SCALE;

        let samp_max = ext_to_internal(config.samp_max_pct);
        let leaf = ext_to_internal(config.leaf_pct);
        let lwm = ext_to_internal(config.lo_th_pct);
        let hwm = ext_to_internal(config.hi_th_pct);
        let r = SCALE - leaf;

        let good_min = frac_div(SCALE + r, samp_max);
        let range = (SCALE - good_min).max(0);
        let good_lwm = good_min + frac_mul(SCALE - lwm, range);
        let good_hwm = good_min + frac_mul(SCALE - hwm, range);
        let samp_lo = frac_div(SCALE + r, good_lwm);
        let samp_hi = frac_div(SCALE + r, good_hwm);

        Self {
            samp_max,
            samp_lo,
            samp_hi,
            leaf_target: ext_to_internal(config.leaf_pct) / tree_count.max(1),
            root_len_max: config.root_len_max,
            leaf_len_max: config.leaf_len_max,
            leaf_pcap_max: config.leaf_pcap_max,
            garbage_pct: config.garbage_pct_threshold,
            rspill_runlen_min: config.rspill_runlen_min,
            rspill_runlen_max: config.rspill_runlen_max,
            lcomp_runlen_max: config.lcomp_runlen_max,
            scatter_runlen_max: config.scatter_runlen_max,
            scatter_hwm: config.scatter_hwm,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermarks_stay_ordered() {
        let cfg = SchedulerConfig::default();
        let t = Thresholds::compute(&cfg, 1);
        assert!(t.samp_lo < t.samp_hi);
        assert!(t.samp_hi <= t.samp_max);
    }

    #[test]
    fn leaf_target_amortizes_across_trees() {
        let cfg = SchedulerConfig::default();
        let one = Thresholds::compute(&cfg, 1);
        let four = Thresholds::compute(&cfg, 4);
        assert_eq!(one.leaf_target, four.leaf_target * 4);
    }
}
