// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! User-initiated compaction controller: a hysteretic flag telling the
//! dispatcher to prioritize samp reduction over its usual balance,
//! driven by the low/high samp watermarks.
//!
//! Grounded on the `ucomp` watermark fields/transitions in
//! `csched_sp3.c`.

use std::sync::atomic::{AtomicBool, Ordering};

/// Hysteretic samp-reduce controller.
///
/// Sets once samp crosses `samp_hi`, clears once samp falls back below
/// `samp_lo`. Using two watermarks instead of one avoids flapping the
/// flag on every tick when samp is hovering near a single threshold.
#[derive(Default)]
pub struct UcompController {
    reduce: AtomicBool,
}

impl UcompController {
    /// Creates a controller with the reduce flag clear.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-evaluates the flag given the current samp and the tree's
    /// thresholds. Returns the flag's new value.
    pub fn update(&self, samp: i64, samp_lo: i64, samp_hi: i64) -> bool {
        let was = self.reduce.load(Ordering::Acquire);
        let now = if samp >= samp_hi {
            true
        } else if samp <= samp_lo {
            false
        } else {
            was
        };
        if now != was {
            log::info!("ucomp samp_reduce flag -> {now} (samp={samp}, lo={samp_lo}, hi={samp_hi})");
        }
        self.reduce.store(now, Ordering::Release);
        now
    }

    /// Whether samp-reduce work should currently be prioritized.
    #[must_use]
    pub fn should_reduce(&self) -> bool {
        self.reduce.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sets_at_high_watermark_clears_at_low() {
        let ctl = UcompController::new();
        assert!(!ctl.should_reduce());

        ctl.update(100, 10, 90);
        assert!(ctl.should_reduce());

        // Stays set while between watermarks (hysteresis).
        ctl.update(50, 10, 90);
        assert!(ctl.should_reduce());

        ctl.update(5, 10, 90);
        assert!(!ctl.should_reduce());
    }
}
