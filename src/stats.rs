use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Process-wide data-plane counters. Bumped from the engine loop, read from
/// the admin command channel.
#[derive(Debug)]
pub struct GateStats {
    pub queries_received: AtomicU64,
    pub queries_blocked: AtomicU64,
    pub queries_forwarded: AtomicU64,
    pub cache_hits: AtomicU64,
    pub servfails: AtomicU64,
    pub format_errors: AtomicU64,
    pub responses_dropped: AtomicU64,
    pub transition_drops: AtomicU64,
    started_at: Instant,
}

impl Default for GateStats {
    fn default() -> Self {
        Self {
            queries_received: AtomicU64::new(0),
            queries_blocked: AtomicU64::new(0),
            queries_forwarded: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            servfails: AtomicU64::new(0),
            format_errors: AtomicU64::new(0),
            responses_dropped: AtomicU64::new(0),
            transition_drops: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }
}

/// Point-in-time snapshot for `getStatus`.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub queries_received: u64,
    pub queries_blocked: u64,
    pub queries_forwarded: u64,
    pub cache_hits: u64,
    pub servfails: u64,
    pub format_errors: u64,
    pub responses_dropped: u64,
    pub transition_drops: u64,
    pub uptime_secs: u64,
    pub block_rate: f64,
}

impl GateStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_query(&self) {
        self.queries_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocked(&self) {
        self.queries_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self) {
        self.queries_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_servfail(&self) {
        self.servfails.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_format_error(&self) {
        self.format_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_response(&self) {
        self.responses_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transition_drop(&self) {
        self.transition_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let received = self.queries_received.load(Ordering::Relaxed);
        let blocked = self.queries_blocked.load(Ordering::Relaxed);
        let block_rate = if received == 0 {
            0.0
        } else {
            blocked as f64 / received as f64 * 100.0
        };
        StatsSnapshot {
            queries_received: received,
            queries_blocked: blocked,
            queries_forwarded: self.queries_forwarded.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            servfails: self.servfails.load(Ordering::Relaxed),
            format_errors: self.format_errors.load(Ordering::Relaxed),
            responses_dropped: self.responses_dropped.load(Ordering::Relaxed),
            transition_drops: self.transition_drops.load(Ordering::Relaxed),
            uptime_secs: self.started_at.elapsed().as_secs(),
            block_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_rate() {
        let stats = GateStats::new();
        for _ in 0..4 {
            stats.record_query();
        }
        stats.record_blocked();
        let snap = stats.snapshot();
        assert_eq!(snap.queries_received, 4);
        assert!((snap.block_rate - 25.0).abs() < f64::EPSILON);
    }
}
