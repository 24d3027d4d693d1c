//! Rule model: persistent store with published snapshots, wildcard matching
//! with precedence, adaptive-TTL verdict cache, and rule-list parsers.

pub mod cache;
pub mod matcher;
pub mod parser;
pub mod store;
pub mod types;

pub use cache::{RuleCache, RuleCacheConfig};
pub use matcher::{SuffixTrie, resolve_precedence};
pub use parser::{ParsedEntry, RuleListFormat, RuleListParser, is_valid_pattern};
pub use store::{RuleSnapshot, RuleStore, RuleTx, StoreOptions};
pub use types::{MatchType, Rule, RuleAction, RuleSource, Verdict};
