use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::dns::{AnswerData, Response, rcode};

/// Auth and certificate infrastructure whose responses must never be served
/// stale: identity providers rotate answers during auth flows and caching
/// them breaks sign-in behind VPN split-DNS.
pub const AUTH_DOMAINS: &[&str] = &[
    "okta.com",
    "oktapreview.com",
    "oktacdn.com",
    "twingate.com",
    "okta-emea.com",
    "okta-gov.com",
    "okta.mil",
    "kerberos.okta.com",
    "mtls.okta.com",
    "awsglobalaccelerator.com",
    "digicert.com",
];

/// CGNAT and local-scope ranges VPN resolvers typically answer from.
pub fn default_vpn_cidrs() -> Vec<IpNet> {
    ["100.64.0.0/10", "fc00::/7", "fd00::/8", "fe80::/10"]
        .iter()
        .map(|cidr| cidr.parse().expect("built-in CIDR is valid"))
        .collect()
}

/// Per-domain cache behavior override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    Never,
    Always,
    Custom,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainCacheRule {
    /// Domain suffix the rule applies to.
    pub pattern: String,
    pub mode: CacheMode,
    /// TTL seconds, meaningful for `Custom`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
}

/// The do-not-cache policy from configuration, applied before any response
/// is stored.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub enabled: bool,
    pub vpn_cidrs: Vec<IpNet>,
    pub bypass_suffixes: Vec<String>,
    pub domain_rules: Vec<DomainCacheRule>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            vpn_cidrs: default_vpn_cidrs(),
            bypass_suffixes: Vec::new(),
            domain_rules: Vec::new(),
        }
    }
}

fn domain_has_suffix(domain: &str, suffix: &str) -> bool {
    if domain.len() < suffix.len() {
        return false;
    }
    if !domain.ends_with(suffix) {
        return false;
    }
    let prefix_len = domain.len() - suffix.len();
    prefix_len == 0 || domain.as_bytes()[prefix_len - 1] == b'.'
}

impl CachePolicy {
    pub fn is_vpn_addr(&self, addr: IpAddr) -> bool {
        self.vpn_cidrs.iter().any(|net| net.contains(&addr))
    }

    fn is_bypass_domain(&self, qname: &str) -> bool {
        AUTH_DOMAINS
            .iter()
            .any(|suffix| domain_has_suffix(qname, suffix))
            || self
                .bypass_suffixes
                .iter()
                .any(|suffix| domain_has_suffix(qname, suffix))
    }

    fn domain_mode(&self, qname: &str) -> Option<&DomainCacheRule> {
        self.domain_rules
            .iter()
            .find(|rule| domain_has_suffix(qname, rule.pattern.trim_start_matches("*.")))
    }

    /// Whether a response may be stored. `upstream` is the resolver the
    /// answer came from.
    pub fn should_store(&self, response: &Response, upstream: IpAddr) -> bool {
        if !self.enabled {
            return false;
        }
        // Only clean answers are worth replaying.
        if response.rcode != rcode::NOERROR {
            return false;
        }

        match self.domain_mode(&response.qname).map(|rule| rule.mode) {
            Some(CacheMode::Never) => return false,
            // `always` trusts the answer even through VPN infrastructure.
            Some(CacheMode::Always) => return true,
            Some(CacheMode::Custom) | None => {}
        }

        if self.is_bypass_domain(&response.qname) {
            return false;
        }
        if self.is_vpn_addr(upstream) {
            return false;
        }
        for answer in &response.answers {
            if let AnswerData::Ipv4(addr) = answer {
                if self.is_vpn_addr(IpAddr::V4(*addr)) {
                    return false;
                }
            }
        }
        true
    }

    /// A `custom` per-domain rule overrides the stored TTL.
    pub fn ttl_override(&self, qname: &str) -> Option<u32> {
        match self.domain_mode(qname) {
            Some(rule) if rule.mode == CacheMode::Custom => rule.ttl,
            _ => None,
        }
    }
}
