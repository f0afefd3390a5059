// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Wall-clock-interval progress reporting for a running exploration.

use std::time::{Duration, Instant};

/// A snapshot of exploration progress, handed to
/// [`Model::report_progress`](crate::model::Model::report_progress).
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressReport {
    pub state_count: usize,
    pub branch_pop_count: u64,
    pub branch_push_count: u64,
    pub self_branch_count: u64,
    pub elapsed: Duration,
    /// Sharded mode only: batches received that turned out to already be
    /// locally visited.
    pub cross_shard_misses: u64,
}

/// Tracks when the next progress report is due.
pub struct ProgressTicker {
    interval: Duration,
    started: Instant,
    last_report: Instant,
}

impl ProgressTicker {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        let now = Instant::now();
        ProgressTicker {
            interval,
            started: now,
            last_report: now,
        }
    }

    #[must_use]
    pub fn default_interval() -> Duration {
        Duration::from_secs(5)
    }

    /// Returns `true` and resets the timer if `interval` has elapsed since
    /// the last report.
    pub fn is_due(&mut self) -> bool {
        if self.last_report.elapsed() >= self.interval {
            self.last_report = Instant::now();
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_due_immediately() {
        let mut ticker = ProgressTicker::new(Duration::from_secs(60));
        assert!(!ticker.is_due());
    }

    #[test]
    fn due_after_interval_elapses() {
        let mut ticker = ProgressTicker::new(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(ticker.is_due());
        assert!(!ticker.is_due());
    }
}
