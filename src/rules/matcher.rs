use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::rules::types::{MatchType, Rule, RuleAction};

/// Wildcard rules stored in a trie keyed by reversed labels, so matching a
/// query walks from the TLD inward and finds every `*.suffix` rule whose
/// suffix is a label-boundary suffix of the queried domain.
#[derive(Debug, Default)]
pub struct SuffixTrie {
    root: TrieNode,
    len: usize,
}

#[derive(Debug, Default)]
struct TrieNode {
    children: FxHashMap<Box<str>, TrieNode>,
    rules: SmallVec<[Rule; 1]>,
}

/// A wildcard hit: the rule plus how many labels its suffix spans.
/// More labels means more specific and wins within a tier.
#[derive(Debug, Clone)]
pub struct WildcardMatch<'a> {
    pub rule: &'a Rule,
    pub suffix_labels: usize,
}

impl SuffixTrie {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a wildcard rule. Exact rules never belong here.
    pub fn insert(&mut self, rule: Rule) {
        debug_assert_eq!(rule.match_type, MatchType::Wildcard);
        let mut node = &mut self.root;
        for label in rule.base_domain().rsplit('.') {
            node = node
                .children
                .entry(Box::from(label))
                .or_default();
        }
        node.rules.push(rule);
        self.len += 1;
    }

    /// Collect every wildcard rule matching `domain`.
    ///
    /// A rule `*.S` matches proper subdomains of S. When `match_root` is
    /// set it additionally matches S itself.
    pub fn lookup<'a>(&'a self, domain: &str, match_root: bool) -> Vec<WildcardMatch<'a>> {
        let total_labels = domain.split('.').count();
        let mut matches = Vec::new();
        let mut node = &self.root;
        let mut depth = 0usize;

        for label in domain.rsplit('.') {
            let Some(child) = node.children.get(label) else {
                break;
            };
            node = child;
            depth += 1;
            let is_whole_domain = depth == total_labels;
            if !is_whole_domain || match_root {
                for rule in &node.rules {
                    matches.push(WildcardMatch {
                        rule,
                        suffix_labels: depth,
                    });
                }
            }
        }

        matches
    }

    pub fn iter_rules(&self) -> Vec<&Rule> {
        let mut out = Vec::with_capacity(self.len);
        let mut stack = vec![&self.root];
        while let Some(node) = stack.pop() {
            out.extend(node.rules.iter());
            stack.extend(node.children.values());
        }
        out
    }
}

/// Order matched rules by precedence:
/// exact Allow, exact Block, wildcard Allow (longer suffix first),
/// wildcard Block (longer suffix first); within a tier higher priority
/// wins, then the more recently updated rule.
pub fn resolve_precedence(
    exact: &[Rule],
    wildcards: &[WildcardMatch<'_>],
) -> Vec<Rule> {
    fn tier_of(action: RuleAction, match_type: MatchType) -> u8 {
        match (match_type, action) {
            (MatchType::Exact, RuleAction::Allow) => 0,
            (MatchType::Exact, RuleAction::Block) => 1,
            (MatchType::Wildcard, RuleAction::Allow) => 2,
            (MatchType::Wildcard, RuleAction::Block) => 3,
        }
    }

    let mut ranked: Vec<(u8, usize, Rule)> = Vec::with_capacity(exact.len() + wildcards.len());
    for rule in exact {
        ranked.push((tier_of(rule.action, MatchType::Exact), 0, rule.clone()));
    }
    for matched in wildcards {
        ranked.push((
            tier_of(matched.rule.action, MatchType::Wildcard),
            matched.suffix_labels,
            matched.rule.clone(),
        ));
    }

    ranked.sort_by(|(tier_a, len_a, rule_a), (tier_b, len_b, rule_b)| {
        tier_a
            .cmp(tier_b)
            .then(len_b.cmp(len_a))
            .then(rule_b.priority.cmp(&rule_a.priority))
            .then(rule_b.updated_at.cmp(&rule_a.updated_at))
    });

    ranked.into_iter().map(|(_, _, rule)| rule).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::types::RuleSource;

    fn wildcard(pattern: &str, action: RuleAction, priority: i32) -> Rule {
        Rule::from_pattern(pattern, action, priority, RuleSource::Manifest).unwrap()
    }

    #[test]
    fn suffix_matching_at_label_boundaries() {
        let mut trie = SuffixTrie::new();
        trie.insert(wildcard("*.tracker.io", RuleAction::Block, 0));
        trie.insert(wildcard("*.io", RuleAction::Block, 0));

        let matches = trie.lookup("metrics.tracker.io", false);
        let suffixes: Vec<usize> = matches.iter().map(|m| m.suffix_labels).collect();
        assert_eq!(suffixes, vec![1, 2]);

        // "nottracker.io" must not match "*.tracker.io".
        let matches = trie.lookup("nottracker.io", false);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].rule.domain, "*.io");
    }

    #[test]
    fn root_matching_is_opt_in() {
        let mut trie = SuffixTrie::new();
        trie.insert(wildcard("*.tracker.io", RuleAction::Block, 0));

        assert!(trie.lookup("tracker.io", false).is_empty());
        assert_eq!(trie.lookup("tracker.io", true).len(), 1);
    }

    #[test]
    fn precedence_tiers() {
        let exact_allow = Rule::from_pattern(
            "allow.tracker.io",
            RuleAction::Allow,
            0,
            RuleSource::User,
        )
        .unwrap();
        let wild_block = wildcard("*.tracker.io", RuleAction::Block, 100);
        let matches = vec![WildcardMatch {
            rule: &wild_block,
            suffix_labels: 2,
        }];

        let resolved = resolve_precedence(std::slice::from_ref(&exact_allow), &matches);
        assert_eq!(resolved[0].action, RuleAction::Allow);
        assert_eq!(resolved[1].action, RuleAction::Block);
    }

    #[test]
    fn longer_suffix_wins_within_tier() {
        let broad = wildcard("*.io", RuleAction::Block, 500);
        let narrow = wildcard("*.tracker.io", RuleAction::Block, 0);
        let matches = vec![
            WildcardMatch {
                rule: &broad,
                suffix_labels: 1,
            },
            WildcardMatch {
                rule: &narrow,
                suffix_labels: 2,
            },
        ];
        let resolved = resolve_precedence(&[], &matches);
        assert_eq!(resolved[0].domain, "*.tracker.io");
    }

    #[test]
    fn priority_breaks_ties() {
        let low = wildcard("*.a.example", RuleAction::Block, 1);
        let high = wildcard("*.b.example", RuleAction::Block, 9);
        let matches = vec![
            WildcardMatch {
                rule: &low,
                suffix_labels: 2,
            },
            WildcardMatch {
                rule: &high,
                suffix_labels: 2,
            },
        ];
        let resolved = resolve_precedence(&[], &matches);
        assert_eq!(resolved[0].domain, "*.b.example");
    }
}
