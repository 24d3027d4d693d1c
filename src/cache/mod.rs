//! TTL-aware response cache: raw wire bytes keyed by (qname, qtype),
//! replayed with the current transaction id and the remaining TTL.

pub mod policy;

pub use policy::{AUTH_DOMAINS, CacheMode, CachePolicy, DomainCacheRule, default_vpn_cidrs};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::dns::{self, QueryType};

#[derive(Debug, Clone)]
pub struct ResponseCacheConfig {
    pub capacity: usize,
    /// Stored TTL is clamped into [min_ttl, max_ttl] regardless of the wire
    /// TTL, unless a per-domain `custom` rule overrides it.
    pub min_ttl: Duration,
    pub max_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            min_ttl: Duration::from_secs(30),
            max_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub qname: String,
    pub qtype: QueryType,
}

impl CacheKey {
    pub fn new(qname: &str, qtype: QueryType) -> Self {
        Self {
            qname: qname.to_ascii_lowercase(),
            qtype,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredResponse {
    bytes: Vec<u8>,
    original_ttl: u32,
    expires_at: Instant,
    last_access: Instant,
}

impl StoredResponse {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    fn remaining_secs(&self) -> u32 {
        self.expires_at
            .saturating_duration_since(Instant::now())
            .as_secs() as u32
    }
}

pub struct ResponseCache {
    entries: DashMap<CacheKey, StoredResponse>,
    config: ResponseCacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResponseCache {
    pub fn new(config: ResponseCacheConfig) -> Self {
        Self {
            entries: DashMap::with_capacity(config.capacity.min(4096)),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Lookup for a live entry. On hit the stored bytes come back with the
    /// caller's transaction id spliced in and every RR TTL rewritten to the
    /// remaining lifetime.
    pub fn get(&self, qname: &str, qtype: QueryType, transaction_id: [u8; 2]) -> Option<Vec<u8>> {
        let key = CacheKey::new(qname, qtype);
        let hit = match self.entries.get_mut(&key) {
            Some(mut entry) => {
                if entry.is_expired() {
                    drop(entry);
                    self.entries.remove(&key);
                    None
                } else {
                    entry.last_access = Instant::now();
                    Some((entry.bytes.clone(), entry.remaining_secs()))
                }
            }
            None => None,
        };

        let Some((bytes, remaining)) = hit else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        self.hits.fetch_add(1, Ordering::Relaxed);
        trace!(qname, ?qtype, remaining, "response cache hit");

        let mut out = dns::rewrite_ttl(&bytes, remaining).unwrap_or(bytes);
        dns::splice_transaction_id(&mut out, transaction_id);
        Some(out)
    }

    /// Store raw response bytes. `wire_ttl` is the minimum TTL observed on
    /// the wire; `ttl_override` comes from a per-domain `custom` rule and
    /// skips the clamp.
    pub fn store(
        &self,
        qname: &str,
        qtype: QueryType,
        bytes: &[u8],
        wire_ttl: u32,
        ttl_override: Option<u32>,
    ) {
        let ttl = match ttl_override {
            Some(custom) => Duration::from_secs(custom as u64),
            None => Duration::from_secs(wire_ttl as u64)
                .clamp(self.config.min_ttl, self.config.max_ttl),
        };

        self.evict_if_needed();
        let now = Instant::now();
        self.entries.insert(
            CacheKey::new(qname, qtype),
            StoredResponse {
                bytes: bytes.to_vec(),
                original_ttl: wire_ttl,
                expires_at: now + ttl,
                last_access: now,
            },
        );
    }

    pub fn original_ttl(&self, qname: &str, qtype: QueryType) -> Option<u32> {
        self.entries
            .get(&CacheKey::new(qname, qtype))
            .map(|entry| entry.original_ttl)
    }

    pub fn clear(&self) {
        let size = self.entries.len();
        self.entries.clear();
        debug!(size, "cleared response cache");
    }

    /// Remove expired entries. Driven by a periodic timer.
    pub fn sweep(&self) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, "swept expired responses");
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        self.config.sweep_interval
    }

    fn evict_if_needed(&self) {
        if self.entries.len() < self.config.capacity {
            return;
        }
        let overage = self.entries.len() + 1 - self.config.capacity;
        let mut candidates: Vec<(CacheKey, Instant)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().last_access))
            .collect();
        candidates.sort_by_key(|(_, last_access)| *last_access);
        for (key, _) in candidates.into_iter().take(overage) {
            self.entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
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
    use crate::dns::{Query, QueryType};

    fn sample_response(qname: &str) -> Vec<u8> {
        let query = Query {
            id: 0x0001,
            opcode: 0,
            recursion_desired: true,
            qname: qname.to_string(),
            qtype: QueryType::A,
        };
        dns::synthesize_block_a(&query)
    }

    #[test]
    fn hit_rewrites_id_and_ttl() {
        let cache = ResponseCache::new(ResponseCacheConfig::default());
        cache.store("example.net", QueryType::A, &sample_response("example.net"), 60, None);

        let out = cache
            .get("example.net", QueryType::A, [0xBE, 0xEF])
            .unwrap();
        assert_eq!(dns::extract_transaction_id(&out).unwrap(), [0xBE, 0xEF]);
        let decoded = dns::decode_response(&out).unwrap();
        assert!(decoded.min_ttl <= 60);
    }

    #[test]
    fn key_is_case_insensitive_and_type_scoped() {
        let cache = ResponseCache::new(ResponseCacheConfig::default());
        cache.store("Example.Net", QueryType::A, &sample_response("example.net"), 60, None);
        assert!(cache.get("example.net", QueryType::A, [0, 1]).is_some());
        assert!(cache.get("example.net", QueryType::Aaaa, [0, 1]).is_none());
    }

    #[test]
    fn ttl_clamp() {
        let cache = ResponseCache::new(ResponseCacheConfig::default());
        cache.store("low.example", QueryType::A, &sample_response("low.example"), 1, None);
        cache.store("high.example", QueryType::A, &sample_response("high.example"), 86_400, None);

        // Clamped to [30, 300]: the 1-second answer lives at least 30s, the
        // day-long answer at most 300s.
        let low = cache.get("low.example", QueryType::A, [0, 1]).unwrap();
        let low_ttl = dns::decode_response(&low).unwrap().min_ttl;
        assert!(low_ttl > 1 && low_ttl <= 30);

        let high = cache.get("high.example", QueryType::A, [0, 1]).unwrap();
        let high_ttl = dns::decode_response(&high).unwrap().min_ttl;
        assert!(high_ttl <= 300);
    }

    #[test]
    fn custom_ttl_skips_clamp() {
        let cache = ResponseCache::new(ResponseCacheConfig::default());
        cache.store("slow.example", QueryType::A, &sample_response("slow.example"), 60, Some(1200));
        let out = cache.get("slow.example", QueryType::A, [0, 1]).unwrap();
        let ttl = dns::decode_response(&out).unwrap().min_ttl;
        assert!(ttl > 300);
    }

    #[test]
    fn expired_entries_are_evicted_on_read() {
        let cache = ResponseCache::new(ResponseCacheConfig {
            min_ttl: Duration::ZERO,
            max_ttl: Duration::ZERO,
            ..ResponseCacheConfig::default()
        });
        cache.store("example.net", QueryType::A, &sample_response("example.net"), 0, None);
        assert!(cache.get("example.net", QueryType::A, [0, 1]).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn capacity_is_bounded() {
        let cache = ResponseCache::new(ResponseCacheConfig {
            capacity: 8,
            ..ResponseCacheConfig::default()
        });
        for i in 0..32 {
            let qname = format!("host{}.example", i);
            cache.store(&qname, QueryType::A, &sample_response(&qname), 60, None);
        }
        assert!(cache.len() <= 8);
    }

    #[test]
    fn clear_empties() {
        let cache = ResponseCache::new(ResponseCacheConfig::default());
        cache.store("example.net", QueryType::A, &sample_response("example.net"), 60, None);
        cache.clear();
        assert!(cache.is_empty());
    }
}
