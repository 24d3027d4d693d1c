use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::manifest::scheduler::ScheduleStrategy;
use crate::rules::{ParsedEntry, RuleAction, RuleListFormat};

/// Where a source's bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Https,
    File,
}

/// What the fetched bytes contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFormat {
    /// A manifest document (`allow` / `block` / `included`).
    Manifest,
    Json,
    Hosts,
    #[serde(alias = "yaml")]
    DomainList,
}

impl SourceFormat {
    pub fn rule_list_format(self) -> Option<RuleListFormat> {
        match self {
            SourceFormat::Manifest => None,
            SourceFormat::Json => Some(RuleListFormat::Json),
            SourceFormat::Hosts => Some(RuleListFormat::Hosts),
            SourceFormat::DomainList => Some(RuleListFormat::DomainList),
        }
    }
}

/// One configured rule source.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub identifier: String,
    pub kind: SourceKind,
    pub format: SourceFormat,
    /// URL for `Https`, path for `File`. For manifest sources this is the
    /// endpoint base; the identifier selects the document.
    pub location: String,
    pub priority: i32,
    pub update_interval: Duration,
    pub enabled: bool,
    /// Bearer token presented on HTTPS fetches.
    pub credentials: Option<String>,
    pub strategy: ScheduleStrategy,
    pub timeout: Duration,
}

impl SourceConfig {
    /// The host's primary manifest source.
    pub fn primary_manifest(
        base_url: &str,
        identifier: &str,
        update_interval: Duration,
    ) -> Self {
        Self {
            identifier: identifier.to_string(),
            kind: SourceKind::Https,
            format: SourceFormat::Manifest,
            location: base_url.to_string(),
            priority: 100,
            update_interval,
            enabled: true,
            credentials: None,
            strategy: ScheduleStrategy::Interval {
                every: update_interval,
            },
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestKind {
    #[default]
    Primary,
    Team,
    Domain,
    Global,
    Included,
}

/// `lastUpdated` arrives either as an RFC 3339 string or Unix seconds.
fn deserialize_last_updated<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Seconds(i64),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Seconds(secs)) => Ok(DateTime::<Utc>::from_timestamp(secs, 0)),
        Some(Raw::Text(text)) => Ok(DateTime::parse_from_rfc3339(&text)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))),
    }
}

/// A fetched manifest document.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestDoc {
    pub identifier: String,
    #[serde(rename = "displayName", default)]
    pub display_name: String,
    #[serde(rename = "type", default)]
    pub kind: ManifestKind,
    #[serde(rename = "ruleCount", default)]
    pub rule_count: u64,
    #[serde(
        rename = "lastUpdated",
        default,
        deserialize_with = "deserialize_last_updated"
    )]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub block: Vec<String>,
    #[serde(default)]
    pub included: Vec<String>,
}

impl ManifestDoc {
    /// The document's rule patterns as parse entries, invalid ones skipped.
    /// Each entry carries the document's `lastUpdated` so the merge can
    /// break same-priority collisions by freshness.
    pub fn entries(&self) -> Vec<ParsedEntry> {
        let mut entries = Vec::with_capacity(self.allow.len() + self.block.len());
        for (patterns, action) in [
            (&self.block, RuleAction::Block),
            (&self.allow, RuleAction::Allow),
        ] {
            for pattern in patterns {
                let pattern = pattern.trim().to_ascii_lowercase();
                if crate::rules::is_valid_pattern(&pattern) {
                    entries.push(ParsedEntry {
                        pattern,
                        action,
                        updated_at: self.last_updated,
                    });
                }
            }
        }
        entries
    }
}

/// Outcome of the most recent sync, persisted next to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub timestamp: DateTime<Utc>,
    pub rule_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_parses_rfc3339_timestamp() {
        let doc: ManifestDoc = serde_json::from_str(
            r#"{
                "identifier": "machine-serial",
                "displayName": "Host policy",
                "type": "primary",
                "ruleCount": 2,
                "lastUpdated": "2025-06-01T12:00:00Z",
                "allow": ["ok.example.com"],
                "block": ["ads.example.com"],
                "included": ["team-default"]
            }"#,
        )
        .unwrap();
        assert_eq!(doc.kind, ManifestKind::Primary);
        assert_eq!(doc.rule_count, 2);
        assert!(doc.last_updated.is_some());
        assert_eq!(doc.included, vec!["team-default"]);
        // Entries inherit the document freshness.
        assert!(
            doc.entries()
                .iter()
                .all(|entry| entry.updated_at == doc.last_updated)
        );
    }

    #[test]
    fn manifest_parses_unix_timestamp() {
        let doc: ManifestDoc = serde_json::from_str(
            r#"{"identifier": "x", "lastUpdated": 1748779200, "block": []}"#,
        )
        .unwrap();
        assert_eq!(
            doc.last_updated.unwrap().timestamp(),
            1_748_779_200
        );
    }

    #[test]
    fn entries_skip_invalid_patterns() {
        let doc: ManifestDoc = serde_json::from_str(
            r#"{"identifier": "x", "block": ["ads.example.com", "bad..domain"], "allow": ["*.ok.example"]}"#,
        )
        .unwrap();
        let entries = doc.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, RuleAction::Block);
        assert_eq!(entries[1].pattern, "*.ok.example");
    }
}
