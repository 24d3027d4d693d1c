use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{GateError, Result};
use crate::rules::types::RuleAction;

/// Supported rule-list formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleListFormat {
    /// `{ "blocked": [...], "whitelist": [...], "metadata": {...} }`
    Json,
    /// `IP domain [comment]`; 0.0.0.0 / 127.0.0.1 targets mean block.
    Hosts,
    /// One domain per line, `#` comments, `*.` wildcard prefix, `!` allow.
    #[serde(alias = "yaml")]
    DomainList,
}

/// One pattern extracted from a rule list, before priority/source are
/// stamped on by the caller. `updated_at` carries the source document's
/// freshness when the format provides one (manifest `lastUpdated`); plain
/// rule-list formats have none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEntry {
    pub pattern: String,
    pub action: RuleAction,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct JsonRuleList {
    #[serde(default)]
    blocked: Vec<String>,
    #[serde(default)]
    whitelist: Vec<String>,
    #[serde(default)]
    #[allow(dead_code)]
    metadata: Option<serde_json::Value>,
}

/// What one line amounted to. `Ignored` covers content that is valid but
/// not a rule (ordinary hosts mappings, localhost); `Invalid` counts
/// toward the skip total and fails the parse in strict mode.
enum LineOutcome {
    Entry(ParsedEntry),
    Ignored,
    Invalid,
}

pub struct RuleListParser {
    format: RuleListFormat,
    /// In strict mode an invalid entry fails the whole parse; otherwise it
    /// is skipped and counted.
    strict: bool,
}

impl RuleListParser {
    pub fn new(format: RuleListFormat) -> Self {
        Self {
            format,
            strict: false,
        }
    }

    pub fn strict(format: RuleListFormat) -> Self {
        Self {
            format,
            strict: true,
        }
    }

    /// Parse a whole document into entries. Invalid entries are skipped in
    /// non-strict mode; the skipped count is returned alongside.
    pub fn parse(&self, data: &[u8]) -> Result<(Vec<ParsedEntry>, usize)> {
        match self.format {
            RuleListFormat::Json => self.parse_json(data),
            RuleListFormat::Hosts | RuleListFormat::DomainList => self.parse_lines(data),
        }
    }

    fn parse_json(&self, data: &[u8]) -> Result<(Vec<ParsedEntry>, usize)> {
        let list: JsonRuleList = serde_json::from_slice(data)
            .map_err(|e| GateError::ManifestParse(format!("rule list JSON: {}", e)))?;

        let mut entries = Vec::with_capacity(list.blocked.len() + list.whitelist.len());
        let mut skipped = 0usize;
        for (patterns, action) in [
            (&list.blocked, RuleAction::Block),
            (&list.whitelist, RuleAction::Allow),
        ] {
            for pattern in patterns {
                let pattern = pattern.trim();
                match self.classify(pattern, action)? {
                    LineOutcome::Entry(entry) => entries.push(entry),
                    LineOutcome::Ignored => {}
                    LineOutcome::Invalid => skipped += 1,
                }
            }
        }
        Ok((entries, skipped))
    }

    fn parse_lines(&self, data: &[u8]) -> Result<(Vec<ParsedEntry>, usize)> {
        let text = String::from_utf8_lossy(data);
        let mut entries = Vec::new();
        let mut skipped = 0usize;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parsed = match self.format {
                RuleListFormat::Hosts => self.parse_hosts_line(line)?,
                RuleListFormat::DomainList => self.parse_domain_line(line)?,
                RuleListFormat::Json => unreachable!("json is not line-oriented"),
            };
            match parsed {
                LineOutcome::Entry(entry) => entries.push(entry),
                LineOutcome::Ignored => {}
                LineOutcome::Invalid => skipped += 1,
            }
        }
        Ok((entries, skipped))
    }

    /// `IP domain [comment...]`. Only blocking sink addresses count; a line
    /// mapping a domain to a real address is ordinary hosts content, not a
    /// rule, and is ignored without touching the skip counter.
    fn parse_hosts_line(&self, line: &str) -> Result<LineOutcome> {
        let mut parts = line.split_whitespace();
        let (Some(addr), Some(domain)) = (parts.next(), parts.next()) else {
            return self.reject(line);
        };
        let Ok(ip) = addr.parse::<IpAddr>() else {
            return self.reject(line);
        };
        let is_sink = match ip {
            IpAddr::V4(v4) => v4.is_unspecified() || v4.is_loopback(),
            IpAddr::V6(v6) => v6.is_unspecified() || v6.is_loopback(),
        };
        if !is_sink || domain.eq_ignore_ascii_case("localhost") {
            return Ok(LineOutcome::Ignored);
        }
        match is_valid_pattern(domain) {
            true => Ok(LineOutcome::Entry(ParsedEntry {
                pattern: domain.to_ascii_lowercase(),
                action: RuleAction::Block,
                updated_at: None,
            })),
            false => self.reject(line),
        }
    }

    /// Plain domain per line. A leading `!` marks an allow entry.
    fn parse_domain_line(&self, line: &str) -> Result<LineOutcome> {
        let (action, pattern) = match line.strip_prefix('!') {
            Some(rest) => (RuleAction::Allow, rest.trim()),
            None => (RuleAction::Block, line),
        };
        // Drop a trailing inline comment.
        let pattern = pattern
            .split_whitespace()
            .next()
            .unwrap_or_default();
        match is_valid_pattern(pattern) {
            true => Ok(LineOutcome::Entry(ParsedEntry {
                pattern: pattern.to_ascii_lowercase(),
                action,
                updated_at: None,
            })),
            false => self.reject(line),
        }
    }

    fn classify(&self, pattern: &str, action: RuleAction) -> Result<LineOutcome> {
        match is_valid_pattern(pattern) {
            true => Ok(LineOutcome::Entry(ParsedEntry {
                pattern: pattern.to_ascii_lowercase(),
                action,
                updated_at: None,
            })),
            false => self.reject(pattern),
        }
    }

    fn reject(&self, entry: &str) -> Result<LineOutcome> {
        if self.strict {
            Err(GateError::ManifestParse(format!(
                "invalid rule entry: {:?}",
                entry
            )))
        } else {
            Ok(LineOutcome::Invalid)
        }
    }
}

/// Validate a domain pattern, allowing a single leading `*.` wildcard.
pub fn is_valid_pattern(pattern: &str) -> bool {
    let domain = pattern.strip_prefix("*.").unwrap_or(pattern);
    if domain.is_empty() || domain.len() > 253 || domain.contains('*') {
        return false;
    }

    for label in domain.split('.') {
        if label.is_empty() || label.len() > 63 {
            return false;
        }
        let bytes = label.as_bytes();
        for (i, &ch) in bytes.iter().enumerate() {
            let edge = i == 0 || i == bytes.len() - 1;
            let ok = if edge {
                ch.is_ascii_alphanumeric() || ch == b'_'
            } else {
                ch.is_ascii_alphanumeric() || ch == b'-' || ch == b'_'
            };
            if !ok {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_list_parsing() {
        let parser = RuleListParser::new(RuleListFormat::DomainList);
        let data = b"# comment\nads.example.com\n*.tracker.io\n!allow.tracker.io\n\nbad..domain\n";
        let (entries, skipped) = parser.parse(data).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].pattern, "ads.example.com");
        assert_eq!(entries[0].action, RuleAction::Block);
        assert_eq!(entries[1].pattern, "*.tracker.io");
        assert_eq!(entries[2].action, RuleAction::Allow);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn hosts_parsing() {
        let parser = RuleListParser::new(RuleListFormat::Hosts);
        let data = b"0.0.0.0 ads.example.com some comment\n127.0.0.1 tracker.com\n127.0.0.1 localhost\n192.0.2.1 real-host.lan\nnot-an-ip example.com\n";
        let (entries, skipped) = parser.parse(data).unwrap();
        assert_eq!(
            entries
                .iter()
                .map(|e| e.pattern.as_str())
                .collect::<Vec<_>>(),
            vec!["ads.example.com", "tracker.com"]
        );
        assert!(entries.iter().all(|e| e.action == RuleAction::Block));
        // localhost and the real-address mapping are silently ignored; the
        // unparseable line is counted as skipped.
        assert_eq!(skipped, 1);
    }

    #[test]
    fn json_parsing() {
        let parser = RuleListParser::new(RuleListFormat::Json);
        let data = br#"{"blocked": ["ads.example.com", "*.tracker.io"], "whitelist": ["ok.tracker.io"], "metadata": {"v": 2}}"#;
        let (entries, skipped) = parser.parse(data).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(skipped, 0);
        assert_eq!(entries[2].action, RuleAction::Allow);
    }

    #[test]
    fn strict_mode_fails_on_invalid() {
        let parser = RuleListParser::strict(RuleListFormat::DomainList);
        assert!(parser.parse(b"ok.example.com\nbad..domain\n").is_err());
    }

    #[test]
    fn pattern_validation() {
        assert!(is_valid_pattern("example.com"));
        assert!(is_valid_pattern("*.example.com"));
        assert!(is_valid_pattern("xn--dmin-moa0i.example"));
        assert!(!is_valid_pattern("*."));
        assert!(!is_valid_pattern("foo.*.com"));
        assert!(!is_valid_pattern("-bad.com"));
        assert!(!is_valid_pattern("bad-.com"));
        assert!(!is_valid_pattern(&format!("{}.com", "a".repeat(64))));
    }
}
