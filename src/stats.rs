//! Statistics tracking for the router.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::router::Outcome;

/// Atomic per-outcome counters.
pub struct Stats {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    local: AtomicU64,
    remote: AtomicU64,
    fallback: AtomicU64,
    failed: AtomicU64,
    /// Cumulative response time in microseconds for averaging.
    total_response_time_us: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            requests: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            local: AtomicU64::new(0),
            remote: AtomicU64::new(0),
            fallback: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
        }
    }

    pub fn record(&self, outcome: Outcome, elapsed: Duration) {
        let counter = match outcome {
            Outcome::CacheHit => &self.cache_hits,
            Outcome::Local => &self.local,
            Outcome::Remote => &self.remote,
            Outcome::FallbackLocal => &self.fallback,
            Outcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let requests = self.requests.swap(0, Ordering::Relaxed);
        let total_us = self.total_response_time_us.swap(0, Ordering::Relaxed);

        let avg_response_ms = if requests > 0 {
            (total_us as f64 / requests as f64) / 1000.0
        } else {
            0.0
        };

        StatsSnapshot {
            requests,
            cache_hits: self.cache_hits.swap(0, Ordering::Relaxed),
            local: self.local.swap(0, Ordering::Relaxed),
            remote: self.remote.swap(0, Ordering::Relaxed),
            fallback: self.fallback.swap(0, Ordering::Relaxed),
            failed: self.failed.swap(0, Ordering::Relaxed),
            avg_response_ms,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub cache_hits: u64,
    pub local: u64,
    pub remote: u64,
    pub fallback: u64,
    pub failed: u64,
    pub avg_response_ms: f64,
}
