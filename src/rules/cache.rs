use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::rules::types::Verdict;

/// Adaptive-TTL verdict cache in front of the rule store.
///
/// Hot domains keep their verdict longer: the baseline TTL is scaled by the
/// configured multiplier once the domain's rolling query count passes the
/// matching threshold.
#[derive(Debug, Clone)]
pub struct RuleCacheConfig {
    pub capacity: usize,
    pub base_ttl: Duration,
    /// (query-count threshold, multiplier), checked highest first.
    pub tiers: Vec<(u64, f64)>,
}

impl Default for RuleCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            base_ttl: Duration::from_secs(300),
            tiers: vec![(1000, 8.0), (500, 4.0), (100, 2.0), (50, 1.5)],
        }
    }
}

#[derive(Debug, Clone)]
struct CachedVerdict {
    verdict: Verdict,
    inserted_at: Instant,
    ttl: Duration,
    generation: u64,
    last_access: Instant,
}

impl CachedVerdict {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }
}

pub struct RuleCache {
    entries: DashMap<String, CachedVerdict>,
    config: RuleCacheConfig,
    /// Bumped on clear; entries from older generations are dead on arrival.
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RuleCache {
    pub fn new(config: RuleCacheConfig) -> Self {
        Self {
            entries: DashMap::with_capacity(config.capacity.min(4096)),
            config,
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// TTL for a domain with the given rolling query count.
    pub fn adaptive_ttl(&self, query_count: u64) -> Duration {
        for &(threshold, multiplier) in &self.config.tiers {
            if query_count >= threshold {
                return self.config.base_ttl.mul_f64(multiplier);
            }
        }
        self.config.base_ttl
    }

    /// Lookup with lazy expiration: a stale or old-generation entry is
    /// evicted on the spot and reported as a miss.
    pub fn get(&self, domain: &str) -> Option<Verdict> {
        let current_gen = self.generation.load(Ordering::Acquire);
        let verdict = match self.entries.get_mut(domain) {
            Some(mut entry) => {
                if entry.generation != current_gen || entry.is_expired() {
                    drop(entry);
                    self.entries.remove(domain);
                    None
                } else {
                    entry.last_access = Instant::now();
                    Some(entry.verdict)
                }
            }
            None => None,
        };

        match verdict {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        verdict
    }

    /// Memoize a resolved verdict with the adaptive TTL for `query_count`.
    pub fn insert(&self, domain: &str, verdict: Verdict, query_count: u64) {
        self.evict_if_needed();
        let now = Instant::now();
        self.entries.insert(
            domain.to_string(),
            CachedVerdict {
                verdict,
                inserted_at: now,
                ttl: self.adaptive_ttl(query_count),
                generation: self.generation.load(Ordering::Acquire),
                last_access: now,
            },
        );
    }

    /// O(1) wholesale invalidation: bump the generation. Stale entries are
    /// reclaimed lazily on read and by `sweep`.
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Physically remove expired and old-generation entries.
    pub fn sweep(&self) {
        let current_gen = self.generation.load(Ordering::Acquire);
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.generation == current_gen && !entry.is_expired());
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "swept rule cache");
        }
    }

    fn evict_if_needed(&self) {
        if self.entries.len() < self.config.capacity {
            return;
        }
        // Over capacity: drop the least-recently-used overage.
        let overage = self.entries.len() + 1 - self.config.capacity;
        let mut candidates: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().last_access))
            .collect();
        candidates.sort_by_key(|(_, last_access)| *last_access);
        for (key, _) in candidates.into_iter().take(overage) {
            self.entries.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cache(capacity: usize) -> RuleCache {
        RuleCache::new(RuleCacheConfig {
            capacity,
            ..RuleCacheConfig::default()
        })
    }

    #[test]
    fn insert_and_get() {
        let cache = small_cache(16);
        cache.insert("example.com", Verdict::Block, 0);
        assert_eq!(cache.get("example.com"), Some(Verdict::Block));
        assert_eq!(cache.get("other.com"), None);
        assert_eq!(cache.hit_count(), 1);
        assert_eq!(cache.miss_count(), 1);
    }

    #[test]
    fn adaptive_ttl_tiers() {
        let cache = small_cache(16);
        let base = Duration::from_secs(300);
        assert_eq!(cache.adaptive_ttl(0), base);
        assert_eq!(cache.adaptive_ttl(49), base);
        assert_eq!(cache.adaptive_ttl(50), base.mul_f64(1.5));
        assert_eq!(cache.adaptive_ttl(100), base.mul_f64(2.0));
        assert_eq!(cache.adaptive_ttl(500), base.mul_f64(4.0));
        assert_eq!(cache.adaptive_ttl(1000), base.mul_f64(8.0));
        assert_eq!(cache.adaptive_ttl(50_000), base.mul_f64(8.0));
    }

    #[test]
    fn clear_is_generational() {
        let cache = small_cache(16);
        cache.insert("example.com", Verdict::Allow, 0);
        cache.clear();
        assert_eq!(cache.get("example.com"), None);

        // A fresh insert after clear is served again.
        cache.insert("example.com", Verdict::Block, 0);
        assert_eq!(cache.get("example.com"), Some(Verdict::Block));
    }

    #[test]
    fn expired_entries_are_not_returned() {
        let cache = RuleCache::new(RuleCacheConfig {
            capacity: 16,
            base_ttl: Duration::ZERO,
            tiers: vec![],
        });
        cache.insert("example.com", Verdict::Block, 0);
        assert_eq!(cache.get("example.com"), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn capacity_is_bounded() {
        let cache = small_cache(4);
        for i in 0..16 {
            cache.insert(&format!("host{}.example", i), Verdict::NoRule, 0);
        }
        assert!(cache.len() <= 4);
    }

    #[test]
    fn sweep_reclaims_stale_generations() {
        let cache = small_cache(16);
        cache.insert("a.example", Verdict::Block, 0);
        cache.insert("b.example", Verdict::Allow, 0);
        cache.clear();
        cache.sweep();
        assert_eq!(cache.len(), 0);
    }
}
