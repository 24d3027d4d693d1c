use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::error::{GateError, Result};
use crate::rules::matcher::{SuffixTrie, resolve_precedence};
use crate::rules::types::{MatchType, Rule, RuleAction, RuleSource, Verdict};

const STORE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Backing file; `None` keeps the store memory-only (tests).
    pub path: Option<PathBuf>,
    /// Whether `*.example.com` also matches `example.com` itself.
    pub wildcard_matches_root: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            path: None,
            wildcard_matches_root: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedStore {
    version: u32,
    rules: Vec<Rule>,
}

/// Immutable view of the rule set, published on commit. Readers holding an
/// older snapshot stay valid until they drop it.
#[derive(Debug, Default)]
pub struct RuleSnapshot {
    exact: FxHashMap<String, SmallVec<[Rule; 2]>>,
    wildcards: SuffixTrie,
    rule_count: usize,
    wildcard_matches_root: bool,
}

impl RuleSnapshot {
    fn build(
        rules: impl Iterator<Item = Rule>,
        wildcard_matches_root: bool,
    ) -> Self {
        let mut exact: FxHashMap<String, SmallVec<[Rule; 2]>> = FxHashMap::default();
        let mut wildcards = SuffixTrie::new();
        let mut rule_count = 0usize;

        for rule in rules {
            rule_count += 1;
            match rule.match_type {
                MatchType::Exact => exact.entry(rule.domain.clone()).or_default().push(rule),
                MatchType::Wildcard => wildcards.insert(rule),
            }
        }

        Self {
            exact,
            wildcards,
            rule_count,
            wildcard_matches_root,
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rule_count
    }

    /// Every rule matching `domain`, precedence-ordered. Expired rules
    /// never match.
    pub fn all_matching(&self, domain: &str) -> Vec<Rule> {
        let now = Utc::now();
        let exact: Vec<Rule> = self
            .exact
            .get(domain)
            .map(|rules| {
                rules
                    .iter()
                    .filter(|r| !r.is_expired(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let hits = self.wildcards.lookup(domain, self.wildcard_matches_root);
        let live: Vec<_> = hits
            .into_iter()
            .filter(|m| !m.rule.is_expired(now))
            .collect();

        resolve_precedence(&exact, &live)
    }

    /// Best match under precedence, or `None`.
    pub fn rule_for(&self, domain: &str) -> Option<Rule> {
        self.all_matching(domain).into_iter().next()
    }

    /// The resolved action for `domain`.
    pub fn verdict_for(&self, domain: &str) -> Verdict {
        Verdict::from(self.rule_for(domain).map(|r| r.action))
    }

    pub fn iter_all(&self) -> Vec<Rule> {
        let mut out: Vec<Rule> = self
            .exact
            .values()
            .flat_map(|rules| rules.iter().cloned())
            .collect();
        out.extend(self.wildcards.iter_rules().into_iter().cloned());
        out
    }

    pub fn count_by_source(&self, source: RuleSource) -> usize {
        self.iter_all().iter().filter(|r| r.source == source).count()
    }
}

#[derive(Debug)]
struct QueryStat {
    count: u64,
    last_seen: Instant,
}

/// Durable rule store: single writer (transactions serialize on a gate),
/// many readers (published `Arc<RuleSnapshot>`), per-domain rolling query
/// counters feeding the adaptive rule-cache TTL.
pub struct RuleStore {
    options: StoreOptions,
    rules: Mutex<FxHashMap<(String, RuleAction), Rule>>,
    snapshot: RwLock<Arc<RuleSnapshot>>,
    writer: Mutex<()>,
    query_stats: DashMap<String, QueryStat>,
}

impl RuleStore {
    /// Open (or create) the store. A present-but-corrupt backing file is a
    /// hard error; the proxy refuses to start on top of it.
    pub fn open(options: StoreOptions) -> Result<Self> {
        let rules = match &options.path {
            Some(path) if path.exists() => {
                let data = std::fs::read(path)
                    .map_err(|e| GateError::RuleStoreOpen(format!("{}: {}", path.display(), e)))?;
                let persisted: PersistedStore = serde_json::from_slice(&data)
                    .map_err(|e| GateError::RuleStoreOpen(format!("{}: {}", path.display(), e)))?;
                if persisted.version != STORE_FORMAT_VERSION {
                    return Err(GateError::RuleStoreOpen(format!(
                        "unsupported store version {}",
                        persisted.version
                    )));
                }
                info!(
                    rules = persisted.rules.len(),
                    path = %path.display(),
                    "loaded rule store"
                );
                persisted
                    .rules
                    .into_iter()
                    .map(|r| (r.key(), r))
                    .collect()
            }
            _ => FxHashMap::default(),
        };

        let snapshot = RuleSnapshot::build(rules.values().cloned(), options.wildcard_matches_root);
        Ok(Self {
            options,
            rules: Mutex::new(rules),
            snapshot: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
            query_stats: DashMap::new(),
        })
    }

    /// Memory-only store for tests and ephemeral setups.
    pub fn in_memory() -> Self {
        Self::open(StoreOptions::default()).expect("in-memory store cannot fail to open")
    }

    /// The current published snapshot. Cheap; clone of an Arc.
    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn rule_for(&self, domain: &str) -> Option<Rule> {
        self.snapshot().rule_for(domain)
    }

    pub fn all_matching(&self, domain: &str) -> Vec<Rule> {
        self.snapshot().all_matching(domain)
    }

    pub fn rule_count(&self) -> usize {
        self.snapshot().rule_count()
    }

    /// Begin a transaction. Blocks until any in-flight writer finishes.
    pub fn begin_tx(&self) -> RuleTx<'_> {
        let guard = self.writer.lock();
        let staged = self.rules.lock().clone();
        RuleTx {
            store: self,
            _guard: guard,
            staged,
        }
    }

    /// O(1) counter bump used for adaptive TTL and pre-warm selection.
    pub fn record_query(&self, domain: &str) {
        let now = Instant::now();
        self.query_stats
            .entry(domain.to_string())
            .and_modify(|stat| {
                stat.count += 1;
                stat.last_seen = now;
            })
            .or_insert(QueryStat {
                count: 1,
                last_seen: now,
            });
    }

    pub fn query_count(&self, domain: &str) -> u64 {
        self.query_stats.get(domain).map(|s| s.count).unwrap_or(0)
    }

    /// The `limit` most-queried domains, most first.
    pub fn most_queried(&self, limit: usize) -> Vec<(String, u64)> {
        let mut counts: Vec<(String, u64)> = self
            .query_stats
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().count))
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        counts.truncate(limit);
        counts
    }

    /// Drop query counters idle for longer than `older_than`.
    pub fn cleanup_query_stats(&self, older_than: Duration) {
        let before = self.query_stats.len();
        self.query_stats
            .retain(|_, stat| stat.last_seen.elapsed() <= older_than);
        let removed = before - self.query_stats.len();
        if removed > 0 {
            debug!(removed, "pruned idle query counters");
        }
    }

    /// Compact the store: drop expired rules and rewrite the backing file.
    pub fn vacuum(&self) -> Result<usize> {
        let now = Utc::now();
        let mut tx = self.begin_tx();
        let before = tx.staged.len();
        tx.staged.retain(|_, rule| !rule.is_expired(now));
        let dropped = before - tx.staged.len();
        tx.commit()?;
        if dropped > 0 {
            info!(dropped, "vacuumed expired rules");
        }
        Ok(dropped)
    }

    fn persist(&self, rules: &FxHashMap<(String, RuleAction), Rule>) -> Result<()> {
        let Some(path) = &self.options.path else {
            return Ok(());
        };
        let persisted = PersistedStore {
            version: STORE_FORMAT_VERSION,
            rules: rules.values().cloned().collect(),
        };
        let data = serde_json::to_vec(&persisted)
            .map_err(|e| GateError::RuleStoreWrite(e.to_string()))?;

        // Write-to-temp then rename keeps the store file whole even if the
        // process dies mid-write.
        let tmp = path.with_extension("tmp");
        write_atomic(path, &tmp, &data)
    }
}

fn write_atomic(path: &Path, tmp: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| GateError::RuleStoreWrite(format!("{}: {}", parent.display(), e)))?;
    }
    std::fs::write(tmp, data)
        .map_err(|e| GateError::RuleStoreWrite(format!("{}: {}", tmp.display(), e)))?;
    std::fs::rename(tmp, path)
        .map_err(|e| GateError::RuleStoreWrite(format!("{}: {}", path.display(), e)))
}

/// A staged mutation of the rule set. Nothing is visible to readers until
/// `commit` publishes a new snapshot; dropping the transaction (or an
/// explicit `rollback`) leaves the store untouched.
pub struct RuleTx<'a> {
    store: &'a RuleStore,
    _guard: MutexGuard<'a, ()>,
    staged: FxHashMap<(String, RuleAction), Rule>,
}

impl RuleTx<'_> {
    /// Remove every rule from `source`. Returns the removed count.
    pub fn remove_all_from(&mut self, source: RuleSource) -> usize {
        let before = self.staged.len();
        self.staged.retain(|_, rule| rule.source != source);
        before - self.staged.len()
    }

    /// Add rules; duplicates (same domain + action) overwrite. Returns the
    /// number applied.
    pub fn add<I: IntoIterator<Item = Rule>>(&mut self, rules: I) -> usize {
        let mut count = 0usize;
        for rule in rules {
            self.staged.insert(rule.key(), rule);
            count += 1;
        }
        count
    }

    /// Remove one specific rule.
    pub fn remove(&mut self, domain: &str, action: RuleAction) -> bool {
        self.staged.remove(&(domain.to_string(), action)).is_some()
    }

    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    /// Persist and publish. A persistence failure rolls the transaction
    /// back automatically: the old snapshot stays live.
    pub fn commit(self) -> Result<()> {
        if let Err(err) = self.store.persist(&self.staged) {
            warn!(error = %err, "rule store commit failed; rolling back");
            return Err(err);
        }

        let snapshot = Arc::new(RuleSnapshot::build(
            self.staged.values().cloned(),
            self.store.options.wildcard_matches_root,
        ));
        *self.store.rules.lock() = self.staged;
        *self.store.snapshot.write() = snapshot;
        Ok(())
    }

    pub fn rollback(self) {
        // Dropping the staged map and the writer gate is the rollback.
    }
}
