use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dns::name;

/// What a matching rule does to a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Block,
    Allow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    Wildcard,
}

/// Where a rule came from. Bulk replacement happens per source so manifest
/// syncs never disturb user or system rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSource {
    User,
    Manifest,
    Remote,
    System,
}

/// A single block/allow rule. Uniquely keyed by (domain, action); wildcard
/// domains carry the `*.` prefix in `domain`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub domain: String,
    pub action: RuleAction,
    pub match_type: MatchType,
    pub priority: i32,
    pub source: RuleSource,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Rule {
    /// Build a rule from a presentation-form pattern, inferring the match
    /// type from a `*.` prefix. The stored domain is canonicalized.
    pub fn from_pattern(
        pattern: &str,
        action: RuleAction,
        priority: i32,
        source: RuleSource,
    ) -> Option<Self> {
        let (match_type, base) = match pattern.strip_prefix("*.") {
            Some(base) => (MatchType::Wildcard, base),
            None => (MatchType::Exact, pattern),
        };
        let canonical = name::canonicalize(base).ok()?;
        let domain = match match_type {
            MatchType::Wildcard => format!("*.{}", canonical),
            MatchType::Exact => canonical,
        };
        Some(Rule {
            domain,
            action,
            match_type,
            priority,
            source,
            updated_at: Utc::now(),
            expires_at: None,
            comment: None,
        })
    }

    /// The domain without any wildcard prefix.
    pub fn base_domain(&self) -> &str {
        self.domain.strip_prefix("*.").unwrap_or(&self.domain)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// The unique key within the store.
    pub fn key(&self) -> (String, RuleAction) {
        (self.domain.clone(), self.action)
    }
}

/// Verdict after precedence resolution. `NoRule` is normal control flow,
/// not an error: the query proceeds to forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Block,
    Allow,
    NoRule,
}

impl From<Option<RuleAction>> for Verdict {
    fn from(action: Option<RuleAction>) -> Self {
        match action {
            Some(RuleAction::Block) => Verdict::Block,
            Some(RuleAction::Allow) => Verdict::Allow,
            None => Verdict::NoRule,
        }
    }
}
