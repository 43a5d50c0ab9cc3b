//! Timing-driven partitioning of index ranges across devices.
//!
//! [`LinearLoadBalancer`] keeps one weight per device (its fraction of the
//! work, summing to 1) and cuts a range into contiguous, block-aligned
//! [`Segment`]s from those weights. After each dispatch the caller feeds
//! back the measured per-device times and the weights move toward equal
//! completion time.

use sgocl_common::{OclError, Result};
use sgocl_runtime::Segment;
use tracing::{debug, info};

/// Emit at `info` when verbose, `debug` otherwise.
macro_rules! balance_log {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            info!($($arg)+);
        } else {
            debug!($($arg)+);
        }
    };
}

/// Proportional load balancer over `num_devices` devices.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearLoadBalancer {
    weights: Vec<f64>,
    verbose: bool,
}

impl LinearLoadBalancer {
    /// Equal split across `num_devices`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(num_devices: usize, verbose: bool) -> Self {
        let n = num_devices.max(1);
        Self { weights: vec![1.0 / n as f64; n], verbose }
    }

    #[must_use]
    pub fn num_devices(&self) -> usize {
        self.weights.len()
    }

    /// Current fraction of the work assigned to each device.
    #[must_use]
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Back to the equal split.
    #[allow(clippy::cast_precision_loss)]
    pub fn reset(&mut self) {
        let equal = 1.0 / self.weights.len() as f64;
        self.weights.fill(equal);
    }

    /// Cut `[start, end)` into one segment per device.
    ///
    /// Segments tile the range in device order. Every segment except the
    /// one reaching `end` is padded up to a multiple of `block`; once the
    /// range is exhausted the remaining devices get empty segments at `end`.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn partition_segments(&self, start: usize, end: usize, block: usize) -> Result<Vec<Segment>> {
        if block == 0 {
            return Err(OclError::InvalidArgument("partition block size must be non-zero".into()));
        }
        if end < start {
            return Err(OclError::InvalidArgument(format!("partition range [{start}, {end}) is reversed")));
        }
        let total = end - start;
        if total % block != 0 {
            return Err(OclError::InvalidArgument(format!(
                "partition range [{start}, {end}) of {total} elements is not a multiple of block size {block}"
            )));
        }

        let last = self.weights.len() - 1;
        let mut segments = Vec::with_capacity(self.weights.len());
        let mut cursor = start;
        for (i, &weight) in self.weights.iter().enumerate() {
            let mut size = (total as f64 * weight).floor() as usize;
            if size == 0 && cursor < end {
                size = 1;
            }
            let seg_end = if i == last || cursor + size >= end {
                end
            } else {
                // cursor - start is block-aligned, so padding never passes `end`.
                (cursor + size.div_ceil(block) * block).min(end)
            };
            segments.push(Segment::new(cursor, seg_end));
            cursor = seg_end;
        }

        balance_log!(
            self.verbose,
            "partition [{start}, {end}) block {block}: {}",
            segments.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ")
        );
        Ok(segments)
    }

    /// Rebalance from the elapsed seconds of the last run, one per device.
    ///
    /// Each device's cost per unit of work is `timing / weight`; the new
    /// weights are `T / cost` with `T = 1 / sum(1 / cost)`. When `T` is
    /// zero or not finite (a device reported no time) the split resets to
    /// equal.
    pub fn update(&mut self, timings: &[f64]) -> Result<()> {
        if timings.len() != self.weights.len() {
            return Err(OclError::InvalidArgument(format!(
                "expected {} timings, got {}",
                self.weights.len(),
                timings.len()
            )));
        }

        let costs: Vec<f64> = timings.iter().zip(&self.weights).map(|(t, w)| t / w).collect();
        let inverse_sum: f64 = costs.iter().map(|c| 1.0 / c).sum();
        let balanced = 1.0 / inverse_sum;

        if balanced.is_finite() && balanced > 0.0 {
            for (w, c) in self.weights.iter_mut().zip(&costs) {
                *w = balanced / c;
            }
        } else {
            self.reset();
        }

        balance_log!(self.verbose, "timings {timings:?} -> partition weights {:?}", self.weights);
        Ok(())
    }
}
