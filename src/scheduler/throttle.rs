// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Throttle advisor: converts backlog/latency signals into a single
//! sensor value callers use to slow down ingest.
//!
//! Grounded on `sp3_qos_check` in `csched_sp3.c`.

use crate::scheduler::config::SCALE;

/// Latency is clamped to this range (seconds) before entering the sensor
/// formula, matching the original's clamp.
const LATENCY_MIN_S: u64 = 16;
const LATENCY_MAX_S: u64 = 80;

/// Computes the throttle sensor value for one tree.
///
/// `rspill_latency_ns` is the tree's current root-spill latency EWMA;
/// `excess_kvsets` is how many kvsets the root run currently holds above
/// its configured maximum; `sleepers` is the count of rspill jobs
/// currently blocked waiting for room.
///
/// Returns an internal-SCALE value: `0` means no backlog at all; values
/// approaching or exceeding `SCALE` mean ingest should slow down.
#[must_use]
pub fn sensor_value(rspill_latency_ns: u64, excess_kvsets: u32, sleepers: u32) -> i64 {
    let latency_s = (rspill_latency_ns / 1_000_000_000).clamp(LATENCY_MIN_S, LATENCY_MAX_S) as i64;

    // K = (100*latency_s + 475*64) / 64
    let k = (100 * latency_s + 475 * 64) / 64;
    // R = 100 * excess_kvsets
    let r = 100 * i64::from(excess_kvsets);

    let denom = (k + r).max(1);
    let sval = (3 * k * r * SCALE) / (denom * 100);

    // A critically long root (or a sleeper waiting on a split/spill) may
    // need the throttle to climb past unity to catch up, so its clamp is
    // raised to 110%; a normal root is held to 90% to avoid oscillation.
    let clamp_pct = if sleepers > 0 || excess_kvsets > 8 {
        110
    } else {
        90
    };
    let clamp = (i64::from(clamp_pct) * SCALE) / 100;

    sval.clamp(0, clamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_backlog_yields_zero_sensor() {
        assert_eq!(sensor_value(20_000_000_000, 0, 0), 0);
    }

    #[test]
    fn backlog_raises_sensor_value() {
        let no_backlog = sensor_value(20_000_000_000, 0, 0);
        let with_backlog = sensor_value(20_000_000_000, 20, 0);
        assert!(with_backlog > no_backlog);
    }

    #[test]
    fn sleepers_clamp_higher_than_no_sleepers() {
        let with_sleepers = sensor_value(40_000_000_000, 50, 2);
        let without_sleepers = sensor_value(40_000_000_000, 50, 0);
        assert!(with_sleepers <= (110 * SCALE) / 100);
        assert!(without_sleepers <= (90 * SCALE) / 100);
    }

    #[test]
    fn critically_long_root_clamps_higher_without_sleepers() {
        let critical = sensor_value(80_000_000_000, 200, 0);
        assert!(critical <= (110 * SCALE) / 100);
        assert!(critical > (90 * SCALE) / 100);
    }
}
