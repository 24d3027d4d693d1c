mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dnsgate::cache::{ResponseCache, ResponseCacheConfig};
use dnsgate::manifest::{
    Fetcher, Orchestrator, OrchestratorHandle, ScheduleStrategy, SourceConfig, SourceFormat,
    SourceKind,
};
use dnsgate::rules::{
    Rule, RuleAction, RuleCache, RuleCacheConfig, RuleSource, RuleStore, Verdict,
};

use common::HttpStub;

struct SyncHarness {
    handle: OrchestratorHandle,
    store: Arc<RuleStore>,
    rule_cache: Arc<RuleCache>,
}

fn spawn_orchestrator(sources: Vec<SourceConfig>, primary: &str) -> SyncHarness {
    let store = Arc::new(RuleStore::in_memory());
    let rule_cache = Arc::new(RuleCache::new(RuleCacheConfig::default()));
    let response_cache = Arc::new(ResponseCache::new(ResponseCacheConfig::default()));
    let (handle, _join) = Orchestrator::spawn(
        sources,
        Fetcher::new(None),
        store.clone(),
        rule_cache.clone(),
        response_cache,
        3,
        primary,
    );
    SyncHarness {
        handle,
        store,
        rule_cache,
    }
}

fn file_source(identifier: &str, path: &std::path::Path, format: SourceFormat, priority: i32) -> SourceConfig {
    SourceConfig {
        identifier: identifier.to_string(),
        kind: SourceKind::File,
        format,
        location: path.to_string_lossy().to_string(),
        priority,
        update_interval: Duration::from_secs(300),
        enabled: true,
        credentials: None,
        strategy: ScheduleStrategy::Manual,
        timeout: Duration::from_secs(30),
    }
}


/// Manifest source pinned to Manual scheduling so tests control every fetch.
fn manifest_source(base: &str, identifier: &str) -> SourceConfig {
    let mut source =
        SourceConfig::primary_manifest(base, identifier, Duration::from_secs(300));
    source.strategy = ScheduleStrategy::Manual;
    source
}

#[tokio::test]
async fn manifest_404_falls_back_to_default_once() {
    let mut routes = HashMap::new();
    routes.insert(
        "/manifests/default".to_string(),
        (
            200,
            r#"{
                "identifier": "default",
                "displayName": "Fallback policy",
                "type": "global",
                "ruleCount": 2,
                "lastUpdated": "2025-06-01T12:00:00Z",
                "allow": ["ok.example.com"],
                "block": ["ads.example.com"]
            }"#
            .to_string(),
        ),
    );
    // machine-serial is absent: the stub answers 404.
    let stub = HttpStub::spawn(routes).await;

    let harness = spawn_orchestrator(
        vec![manifest_source(&format!("{}/manifests", stub.base_url), "machine-serial")],
        "machine-serial",
    );

    // A pre-existing user rule must survive manifest publication.
    {
        let mut tx = harness.store.begin_tx();
        tx.add([
            Rule::from_pattern("user.example", RuleAction::Block, 0, RuleSource::User).unwrap(),
        ]);
        tx.commit().unwrap();
    }

    let summary = harness.handle.sync_now().await.unwrap();
    assert!(summary.fallback_used);
    assert_eq!(summary.rule_count, 2);
    assert_eq!(summary.sources_ok, 1);

    let snapshot = harness.store.snapshot();
    assert_eq!(snapshot.count_by_source(RuleSource::Manifest), 2);
    assert_eq!(snapshot.count_by_source(RuleSource::User), 1);
    assert_eq!(snapshot.verdict_for("ads.example.com"), Verdict::Block);
    assert_eq!(snapshot.verdict_for("ok.example.com"), Verdict::Allow);

    // The fallback never changes the reported identifier.
    assert_eq!(
        harness.handle.current_manifest_identifier(),
        "machine-serial"
    );
}

#[tokio::test]
async fn repeated_sync_is_idempotent() {
    let mut routes = HashMap::new();
    routes.insert(
        "/m/host-1".to_string(),
        (
            200,
            r#"{"identifier": "host-1", "block": ["a.example", "b.example"], "allow": []}"#
                .to_string(),
        ),
    );
    let stub = HttpStub::spawn(routes).await;

    let harness = spawn_orchestrator(
        vec![manifest_source(&format!("{}/m", stub.base_url), "host-1")],
        "host-1",
    );

    for _ in 0..3 {
        let summary = harness.handle.sync_now().await.unwrap();
        assert_eq!(summary.rule_count, 2);
        assert!(!summary.fallback_used);
        assert_eq!(
            harness.store.snapshot().count_by_source(RuleSource::Manifest),
            2
        );
    }
}

#[tokio::test]
async fn included_manifests_are_walked_with_cycle_guard() {
    let mut routes = HashMap::new();
    routes.insert(
        "/m/host-1".to_string(),
        (
            200,
            r#"{"identifier": "host-1", "block": ["primary.example"], "included": ["team-a"]}"#
                .to_string(),
        ),
    );
    routes.insert(
        "/m/team-a".to_string(),
        (
            200,
            r#"{"identifier": "team-a", "type": "included", "block": ["team-a.example"], "included": ["team-b"]}"#
                .to_string(),
        ),
    );
    // team-b includes team-a again: the cycle must terminate.
    routes.insert(
        "/m/team-b".to_string(),
        (
            200,
            r#"{"identifier": "team-b", "type": "included", "block": ["team-b.example"], "included": ["team-a", "host-1"]}"#
                .to_string(),
        ),
    );
    let stub = HttpStub::spawn(routes).await;

    let harness = spawn_orchestrator(
        vec![manifest_source(&format!("{}/m", stub.base_url), "host-1")],
        "host-1",
    );

    let summary = harness.handle.sync_now().await.unwrap();
    assert_eq!(summary.rule_count, 3);
    let snapshot = harness.store.snapshot();
    for domain in ["primary.example", "team-a.example", "team-b.example"] {
        assert_eq!(snapshot.verdict_for(domain), Verdict::Block, "{}", domain);
    }
}

#[tokio::test]
async fn merge_prefers_higher_priority_source() {
    let dir = tempfile::tempdir().unwrap();
    let high = dir.path().join("high.txt");
    std::fs::write(&high, "dup.example\n").unwrap();
    let low = dir.path().join("low.json");
    std::fs::write(
        &low,
        r#"{"blocked": ["dup.example", "only-low.example"], "whitelist": []}"#,
    )
    .unwrap();

    let harness = spawn_orchestrator(
        vec![
            file_source("high", &high, SourceFormat::DomainList, 50),
            file_source("low", &low, SourceFormat::Json, 5),
        ],
        "high",
    );

    let summary = harness.handle.sync_now().await.unwrap();
    assert_eq!(summary.rule_count, 2);
    assert_eq!(summary.sources_ok, 2);

    let rule = harness.store.rule_for("dup.example").unwrap();
    assert_eq!(rule.priority, 50);
    assert!(harness.store.rule_for("only-low.example").is_some());
}

#[tokio::test]
async fn same_priority_merge_prefers_fresher_document() {
    let mut routes = HashMap::new();
    routes.insert(
        "/m/stale".to_string(),
        (
            200,
            r#"{"identifier": "stale", "lastUpdated": "2025-05-01T00:00:00Z", "block": ["dup.example"]}"#
                .to_string(),
        ),
    );
    routes.insert(
        "/m/fresh".to_string(),
        (
            200,
            r#"{"identifier": "fresh", "lastUpdated": "2025-07-01T00:00:00Z", "block": ["dup.example"]}"#
                .to_string(),
        ),
    );
    let stub = HttpStub::spawn(routes).await;

    // Both sources sit at the same priority, stale listed first: plain
    // first-seen ordering would keep the stale document's rule.
    let harness = spawn_orchestrator(
        vec![
            manifest_source(&format!("{}/m", stub.base_url), "stale"),
            manifest_source(&format!("{}/m", stub.base_url), "fresh"),
        ],
        "stale",
    );

    let summary = harness.handle.sync_now().await.unwrap();
    assert_eq!(summary.rule_count, 1);
    assert_eq!(summary.sources_ok, 2);

    let rule = harness.store.rule_for("dup.example").unwrap();
    let fresh = chrono::DateTime::parse_from_rfc3339("2025-07-01T00:00:00Z")
        .unwrap()
        .with_timezone(&chrono::Utc);
    assert_eq!(rule.updated_at, fresh);
}

#[tokio::test]
async fn failed_source_falls_back_to_last_good_set() {
    let dir = tempfile::tempdir().unwrap();
    let list = dir.path().join("list.txt");
    std::fs::write(&list, "keep.example\n").unwrap();

    let harness = spawn_orchestrator(
        vec![file_source("team", &list, SourceFormat::DomainList, 10)],
        "team",
    );

    let summary = harness.handle.sync_now().await.unwrap();
    assert_eq!(summary.rule_count, 1);

    // The file disappears; the in-memory last-good set keeps the rule
    // alive through the next publish.
    std::fs::remove_file(&list).unwrap();
    let summary = harness.handle.sync_now().await.unwrap();
    assert_eq!(summary.sources_failed, 1);
    assert_eq!(summary.rule_count, 1);
    assert_eq!(harness.store.snapshot().verdict_for("keep.example"), Verdict::Block);
}

#[tokio::test]
async fn total_failure_preserves_prior_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("never-existed.txt");

    let harness = spawn_orchestrator(
        vec![file_source("team", &missing, SourceFormat::DomainList, 10)],
        "team",
    );

    // Seed a previously published manifest rule.
    {
        let mut tx = harness.store.begin_tx();
        tx.add([
            Rule::from_pattern("previous.example", RuleAction::Block, 0, RuleSource::Manifest)
                .unwrap(),
        ]);
        tx.commit().unwrap();
    }

    let outcome = harness.handle.sync_now().await;
    assert!(outcome.is_err());
    assert_eq!(
        harness.store.snapshot().count_by_source(RuleSource::Manifest),
        1
    );
}

#[tokio::test]
async fn sync_invalidates_rule_cache() {
    let dir = tempfile::tempdir().unwrap();
    let list = dir.path().join("list.txt");
    std::fs::write(&list, "newly-blocked.example\n").unwrap();

    let harness = spawn_orchestrator(
        vec![file_source("team", &list, SourceFormat::DomainList, 10)],
        "team",
    );

    // A stale NoRule verdict memoized before the sync must not survive it.
    harness
        .rule_cache
        .insert("newly-blocked.example", Verdict::NoRule, 0);
    harness.handle.sync_now().await.unwrap();
    assert_eq!(harness.rule_cache.get("newly-blocked.example"), None);
}

#[tokio::test]
async fn unauthorized_primary_also_falls_back() {
    let mut routes = HashMap::new();
    routes.insert("/m/host-1".to_string(), (401, "denied".to_string()));
    routes.insert(
        "/m/default".to_string(),
        (
            200,
            r#"{"identifier": "default", "block": ["ads.example.com"]}"#.to_string(),
        ),
    );
    let stub = HttpStub::spawn(routes).await;

    let harness = spawn_orchestrator(
        vec![manifest_source(&format!("{}/m", stub.base_url), "host-1")],
        "host-1",
    );

    let summary = harness.handle.sync_now().await.unwrap();
    assert!(summary.fallback_used);
    assert_eq!(summary.rule_count, 1);
}

#[tokio::test]
async fn default_identifier_does_not_fall_back_further() {
    // `default` itself missing: the sync fails rather than looping.
    let stub = HttpStub::spawn(HashMap::new()).await;

    let harness = spawn_orchestrator(
        vec![manifest_source(&format!("{}/m", stub.base_url), "default")],
        "default",
    );

    assert!(harness.handle.sync_now().await.is_err());
    // Exactly one request: no retry against another identifier.
    assert_eq!(stub.hit_count(), 1);
}
