//! Rule update orchestration: scheduled fetch of manifests and rule lists,
//! parse, merge by priority, and atomic republication into the rule store.

pub mod fetch;
pub mod scheduler;
pub mod source;

pub use fetch::{DEFAULT_MANIFEST_IDENTIFIER, Fetcher, manifest_url};
pub use scheduler::{ScheduleStrategy, SourceSchedule, parse_schedule_times};
pub use source::{ManifestDoc, ManifestKind, SourceConfig, SourceFormat, SourceKind, SyncMetadata};

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::ResponseCache;
use crate::error::{GateError, Result};
use crate::rules::{
    ParsedEntry, Rule, RuleAction, RuleCache, RuleListParser, RuleSource, RuleStore,
};

/// Guard against runaway `included` chains.
const MAX_INCLUDED_MANIFESTS: usize = 32;

/// Result of one merge-and-publish pass.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SyncSummary {
    pub rule_count: usize,
    pub sources_ok: usize,
    pub sources_failed: usize,
    pub fallback_used: bool,
}

enum OrchMsg {
    SyncAll {
        reply: Option<oneshot::Sender<Result<SyncSummary>>>,
    },
    Stop,
}

/// Front door to the orchestrator task.
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<OrchMsg>,
    /// The configured primary identifier. Reported even when a sync served
    /// the `default` fallback document.
    primary_identifier: Arc<str>,
}

impl OrchestratorHandle {
    /// Trigger a full sync and wait for its outcome.
    pub async fn sync_now(&self) -> Result<SyncSummary> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(OrchMsg::SyncAll { reply: Some(reply) })
            .await
            .map_err(|_| GateError::Shutdown)?;
        rx.await.map_err(|_| GateError::Shutdown)?
    }

    /// Fire-and-forget sync trigger.
    pub async fn trigger_sync(&self) {
        let _ = self.tx.send(OrchMsg::SyncAll { reply: None }).await;
    }

    pub fn current_manifest_identifier(&self) -> &str {
        &self.primary_identifier
    }

    pub async fn stop(&self) {
        let _ = self.tx.send(OrchMsg::Stop).await;
    }
}

struct SourceState {
    config: SourceConfig,
    schedule: SourceSchedule,
    next_fire: Option<Instant>,
    /// Last successfully parsed entries; the fallback when a fetch fails.
    last_entries: Option<Vec<ParsedEntry>>,
    fallback_used: bool,
}

pub struct Orchestrator {
    sources: Vec<SourceState>,
    fetcher: Arc<Fetcher>,
    store: Arc<RuleStore>,
    rule_cache: Arc<RuleCache>,
    response_cache: Arc<ResponseCache>,
    max_concurrent: usize,
}

impl Orchestrator {
    /// Spawn the orchestrator task. Enabled non-manual sources are fetched
    /// once right away, then on their schedules.
    pub fn spawn(
        sources: Vec<SourceConfig>,
        fetcher: Fetcher,
        store: Arc<RuleStore>,
        rule_cache: Arc<RuleCache>,
        response_cache: Arc<ResponseCache>,
        max_concurrent: usize,
        primary_identifier: &str,
    ) -> (OrchestratorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(16);
        let handle = OrchestratorHandle {
            tx,
            primary_identifier: Arc::from(primary_identifier),
        };

        let now = Instant::now();
        let states = sources
            .into_iter()
            .map(|config| {
                let schedule = SourceSchedule::new(config.strategy.clone());
                let next_fire = match (config.enabled, schedule.strategy()) {
                    (false, _) | (_, ScheduleStrategy::Manual) => None,
                    _ => Some(now),
                };
                SourceState {
                    config,
                    schedule,
                    next_fire,
                    last_entries: None,
                    fallback_used: false,
                }
            })
            .collect();

        let orchestrator = Orchestrator {
            sources: states,
            fetcher: Arc::new(fetcher),
            store,
            rule_cache,
            response_cache,
            max_concurrent: max_concurrent.max(1),
        };

        let join = tokio::spawn(orchestrator.run(rx));
        (handle, join)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<OrchMsg>) {
        info!(sources = self.sources.len(), "rule update orchestrator started");
        loop {
            let wake = self
                .sources
                .iter()
                .filter_map(|s| s.next_fire)
                .min()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                msg = rx.recv() => match msg {
                    None | Some(OrchMsg::Stop) => break,
                    Some(OrchMsg::SyncAll { reply }) => {
                        let due: Vec<usize> = self
                            .sources
                            .iter()
                            .enumerate()
                            .filter(|(_, s)| s.config.enabled)
                            .map(|(i, _)| i)
                            .collect();
                        let outcome = self.sync(&due).await;
                        if let Some(reply) = reply {
                            let _ = reply.send(outcome);
                        }
                    }
                },
                _ = tokio::time::sleep_until(wake) => {
                    let now = Instant::now();
                    let due: Vec<usize> = self
                        .sources
                        .iter()
                        .enumerate()
                        .filter(|(_, s)| s.next_fire.is_some_and(|at| at <= now))
                        .map(|(i, _)| i)
                        .collect();
                    if !due.is_empty() {
                        if let Err(err) = self.sync(&due).await {
                            error!(error = %err, "scheduled rule sync failed");
                        }
                    }
                }
            }
        }
        info!("rule update orchestrator stopped");
    }

    /// Fetch the given sources, merge every source's latest entries, and
    /// publish the result as the new `Manifest` rule set.
    async fn sync(&mut self, due: &[usize]) -> Result<SyncSummary> {
        let mut ok = 0usize;
        let mut failed = 0usize;

        let mut fetches = Vec::with_capacity(due.len());
        for &index in due {
            let config = self.sources[index].config.clone();
            let fetcher = self.fetcher.clone();
            fetches.push(async move {
                let outcome = fetch_and_parse(&fetcher, &config).await;
                (index, outcome)
            });
        }
        let results: Vec<_> = futures::stream::iter(fetches)
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        for (index, outcome) in results {
            let state = &mut self.sources[index];
            match outcome {
                Ok((entries, fallback)) => {
                    debug!(
                        source = %state.config.identifier,
                        entries = entries.len(),
                        fallback,
                        "source updated"
                    );
                    state.last_entries = Some(entries);
                    state.fallback_used = fallback;
                    state.schedule.record_outcome(true);
                    ok += 1;
                }
                Err(err) => {
                    state.schedule.record_outcome(false);
                    failed += 1;
                    match &state.last_entries {
                        Some(entries) => warn!(
                            source = %state.config.identifier,
                            error = %err,
                            cached = entries.len(),
                            "source update failed; keeping last good set"
                        ),
                        None => warn!(
                            source = %state.config.identifier,
                            error = %err,
                            "source update failed; no cached set available"
                        ),
                    }
                }
            }
            let state = &mut self.sources[index];
            state.next_fire = state
                .schedule
                .next_delay(Utc::now())
                .map(|delay| Instant::now() + delay);
        }

        // Nothing fetched and nothing cached to fall back on: report the
        // error and leave the prior snapshot untouched.
        let any_cached = self.sources.iter().any(|s| s.last_entries.is_some());
        if ok == 0 && failed > 0 && !any_cached {
            let err = GateError::ManifestFetch(format!("all {} due sources failed", failed));
            self.fetcher.write_sync_metadata(&SyncMetadata {
                timestamp: Utc::now(),
                rule_count: self.store.rule_count(),
                error: Some(err.to_string()),
            });
            return Err(err);
        }

        let rules = self.merge();
        let rule_count = rules.len();
        let publish = self.publish(rules);

        let fallback_used = self.sources.iter().any(|s| s.fallback_used);
        self.fetcher.write_sync_metadata(&SyncMetadata {
            timestamp: Utc::now(),
            rule_count,
            error: publish.as_ref().err().map(|e| e.to_string()),
        });
        publish?;

        info!(rule_count, ok, failed, "published manifest rule set");
        Ok(SyncSummary {
            rule_count,
            sources_ok: ok,
            sources_failed: failed,
            fallback_used,
        })
    }

    /// Union of every source's latest entries. On a (domain, action)
    /// collision the higher-priority source wins; at equal priority the
    /// rule carrying the newer document timestamp wins.
    fn merge(&self) -> Vec<Rule> {
        let mut order: Vec<&SourceState> = self
            .sources
            .iter()
            .filter(|s| s.config.enabled && s.last_entries.is_some())
            .collect();
        order.sort_by(|a, b| b.config.priority.cmp(&a.config.priority));

        let mut merged: HashMap<(String, RuleAction), Rule> = HashMap::new();
        for state in order {
            let entries = state.last_entries.as_ref().expect("filtered above");
            for entry in entries {
                let Some(mut rule) = Rule::from_pattern(
                    &entry.pattern,
                    entry.action,
                    state.config.priority,
                    RuleSource::Manifest,
                ) else {
                    continue;
                };
                if let Some(updated_at) = entry.updated_at {
                    rule.updated_at = updated_at;
                }

                match merged.entry(rule.key()) {
                    Entry::Vacant(slot) => {
                        slot.insert(rule);
                    }
                    Entry::Occupied(mut slot) => {
                        // Sources are walked priority-descending, so an
                        // occupant from a higher-priority source keeps its
                        // slot; only a same-priority, fresher rule replaces
                        // it.
                        let current = slot.get();
                        if rule.priority == current.priority
                            && rule.updated_at > current.updated_at
                        {
                            slot.insert(rule);
                        }
                    }
                }
            }
        }
        merged.into_values().collect()
    }

    /// Swap the `Manifest`-sourced rules in one transaction and invalidate
    /// both caches wholesale; queries repopulate them lazily.
    fn publish(&self, rules: Vec<Rule>) -> Result<()> {
        let mut tx = self.store.begin_tx();
        let removed = tx.remove_all_from(RuleSource::Manifest);
        let added = tx.add(rules);
        tx.commit()?;
        debug!(removed, added, "manifest rules republished");

        self.rule_cache.clear();
        self.response_cache.clear();
        Ok(())
    }
}

/// Fetch one source and parse it into entries. Returns the entries plus
/// whether the manifest `default` fallback was used.
async fn fetch_and_parse(
    fetcher: &Fetcher,
    config: &SourceConfig,
) -> Result<(Vec<ParsedEntry>, bool)> {
    match config.format {
        SourceFormat::Manifest => {
            let (doc, fallback) = fetcher
                .fetch_manifest(
                    &config.location,
                    &config.identifier,
                    config.credentials.as_deref(),
                )
                .await?;
            let mut entries = doc.entries();

            // Walk included manifests breadth-first with a cycle guard.
            let mut visited: HashSet<String> = HashSet::new();
            visited.insert(config.identifier.clone());
            visited.insert(doc.identifier.clone());
            let mut worklist: Vec<String> = doc.included;
            while let Some(identifier) = worklist.pop() {
                if !visited.insert(identifier.clone()) {
                    continue;
                }
                if visited.len() > MAX_INCLUDED_MANIFESTS {
                    warn!(source = %config.identifier, "included manifest limit reached");
                    break;
                }
                match fetcher
                    .fetch_included(
                        &config.location,
                        &identifier,
                        config.credentials.as_deref(),
                    )
                    .await
                {
                    Ok(included) => {
                        entries.extend(included.entries());
                        worklist.extend(included.included);
                    }
                    Err(err) => {
                        warn!(identifier = %identifier, error = %err, "included manifest skipped");
                    }
                }
            }
            Ok((entries, fallback))
        }
        other => {
            let format = other
                .rule_list_format()
                .expect("non-manifest formats map to a parser");
            let bytes = fetcher.fetch_rule_list(config).await?;
            let parser = RuleListParser::new(format);
            let (entries, skipped) = parser.parse(&bytes)?;
            if skipped > 0 {
                debug!(source = %config.identifier, skipped, "skipped invalid entries");
            }
            Ok((entries, false))
        }
    }
}
