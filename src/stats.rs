//! Statistics tracking for the forwarder.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::session::Outcome;

/// Atomic counters of session outcomes.
pub struct Stats {
    pub requests: AtomicU64,
    pub forwarded: AtomicU64,
    pub fallback: AtomicU64,
    pub dropped: AtomicU64,
    /// Cumulative time to answer in microseconds, answered sessions only.
    total_response_time_us: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            fallback: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
        }
    }

    pub fn record(&self, outcome: Outcome, elapsed: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);

        let counter = match outcome {
            Outcome::Forwarded => &self.forwarded,
            Outcome::Fallback => &self.fallback,
            Outcome::Dropped => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let requests = self.requests.swap(0, Ordering::Relaxed);
        let forwarded = self.forwarded.swap(0, Ordering::Relaxed);
        let fallback = self.fallback.swap(0, Ordering::Relaxed);
        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        let total_us = self.total_response_time_us.swap(0, Ordering::Relaxed);

        let answered = forwarded + fallback;
        let avg_response_ms = if answered > 0 {
            (total_us as f64 / answered as f64) / 1000.0
        } else {
            0.0
        };

        StatsSnapshot {
            requests,
            forwarded,
            fallback,
            dropped,
            avg_response_ms,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub forwarded: u64,
    pub fallback: u64,
    pub dropped: u64,
    pub avg_response_ms: f64,
}
