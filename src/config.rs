use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::cache::{CachePolicy, DomainCacheRule, default_vpn_cidrs};
use crate::error::{GateError, Result};

pub const DEFAULT_MANIFEST_UPDATE_INTERVAL: Duration = Duration::from_secs(300);

/// How upstream sockets pick a local interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindInterfaceStrategy {
    #[default]
    Default,
    ResolverCidr,
    InterfaceIndex,
    Adaptive,
}

impl BindInterfaceStrategy {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "default" => Some(Self::Default),
            "resolver_cidr" => Some(Self::ResolverCidr),
            "interface_index" => Some(Self::InterfaceIndex),
            "adaptive" => Some(Self::Adaptive),
            _ => None,
        }
    }
}

/// The full configuration surface. Precedence: environment (`DNSGATE_*`)
/// over the TOML file over built-in defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upstream resolver addresses, port 53 implied.
    pub dns_servers: Vec<IpAddr>,

    /// Managed cache toggle; wins over everything when set.
    pub enable_dns_cache_managed: Option<bool>,
    /// User preference consulted when no managed value is delivered.
    pub user_can_adjust_cache: Option<bool>,
    /// Legacy user toggle, lowest precedence.
    pub enable_dns_cache_user: Option<bool>,

    pub domain_cache_rules: Vec<DomainCacheRule>,
    pub vpn_resolvers: Vec<IpNet>,
    pub cache_bypass_domains: Vec<String>,

    pub enable_chain_preservation: bool,
    pub max_retries: u8,
    pub initial_backoff_ms: u64,
    pub bind_interface_strategy: BindInterfaceStrategy,
    pub sticky_interface_per_transaction: bool,

    pub manifest_url: Option<String>,
    /// Identifier of this host's primary manifest.
    pub manifest_identifier: String,
    pub manifest_update_interval: Duration,
    pub max_concurrent_fetches: usize,

    pub rule_store_path: Option<PathBuf>,
    /// Per-source fetched-list cache and last-sync metadata live here.
    pub state_dir: Option<PathBuf>,
    pub command_socket: Option<PathBuf>,

    pub wildcard_matches_root: bool,
    pub response_cache_capacity: usize,
    pub rule_cache_capacity: usize,
    pub rule_cache_base_ttl: Duration,
    pub rule_cache_tiers: Vec<(u64, f64)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dns_servers: vec![
                "1.1.1.1".parse().expect("Cloudflare DNS is valid"),
                "8.8.8.8".parse().expect("Google DNS is valid"),
            ],
            enable_dns_cache_managed: None,
            user_can_adjust_cache: None,
            enable_dns_cache_user: None,
            domain_cache_rules: Vec::new(),
            vpn_resolvers: default_vpn_cidrs(),
            cache_bypass_domains: Vec::new(),
            enable_chain_preservation: true,
            max_retries: 3,
            initial_backoff_ms: 250,
            bind_interface_strategy: BindInterfaceStrategy::Default,
            sticky_interface_per_transaction: true,
            manifest_url: None,
            manifest_identifier: "default".to_string(),
            manifest_update_interval: DEFAULT_MANIFEST_UPDATE_INTERVAL,
            max_concurrent_fetches: 3,
            rule_store_path: None,
            state_dir: None,
            command_socket: None,
            wildcard_matches_root: false,
            response_cache_capacity: 10_000,
            rule_cache_capacity: 10_000,
            rule_cache_base_ttl: Duration::from_secs(300),
            rule_cache_tiers: vec![(1000, 8.0), (500, 4.0), (100, 2.0), (50, 1.5)],
        }
    }
}

/// TOML file shape. Every field optional; present fields override defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
struct FileConfig {
    dns_servers: Option<Vec<String>>,
    enable_dns_cache: Option<bool>,
    user_can_adjust_cache: Option<bool>,
    domain_cache_rules: Option<Vec<DomainCacheRule>>,
    vpn_resolvers: Option<Vec<String>>,
    cache_bypass_domains: Option<Vec<String>>,
    enable_dns_chain_preservation: Option<bool>,
    max_retries: Option<u8>,
    initial_backoff_ms: Option<u64>,
    bind_interface_strategy: Option<BindInterfaceStrategy>,
    sticky_interface_per_transaction: Option<bool>,
    manifest_url: Option<String>,
    manifest_identifier: Option<String>,
    manifest_update_interval: Option<u64>,
    max_concurrent_fetches: Option<usize>,
    rule_store_path: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    command_socket: Option<PathBuf>,
    wildcard_matches_root: Option<bool>,
    response_cache_capacity: Option<usize>,
    rule_cache_capacity: Option<usize>,
    rule_cache_base_ttl: Option<u64>,
}

fn parse_bool(value: &str, default: bool) -> bool {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_addr_list(raw: &str) -> Result<Vec<IpAddr>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpAddr>()
                .map_err(|_| GateError::ConfigInvalid(format!("invalid resolver address: {}", s)))
        })
        .collect()
}

fn parse_cidr_list(raw: &[String]) -> Result<Vec<IpNet>> {
    raw.iter()
        .map(|s| {
            s.trim()
                .parse::<IpNet>()
                .map_err(|_| GateError::ConfigInvalid(format!("invalid CIDR: {}", s)))
        })
        .collect()
}

impl Config {
    /// Load from an optional TOML file, then apply environment overrides,
    /// then validate.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut config = Config::default();
        if let Some(path) = file {
            config.apply_file(path)?;
        }
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| GateError::ConfigInvalid(format!("{}: {}", path.display(), e)))?;
        let file: FileConfig = toml::from_str(&text)
            .map_err(|e| GateError::ConfigInvalid(format!("{}: {}", path.display(), e)))?;

        if let Some(servers) = file.dns_servers {
            self.dns_servers = parse_addr_list(&servers.join(","))?;
        }
        if file.enable_dns_cache.is_some() {
            self.enable_dns_cache_user = file.enable_dns_cache;
        }
        if file.user_can_adjust_cache.is_some() {
            self.user_can_adjust_cache = file.user_can_adjust_cache;
        }
        if let Some(rules) = file.domain_cache_rules {
            self.domain_cache_rules = rules;
        }
        if let Some(cidrs) = file.vpn_resolvers {
            self.vpn_resolvers = parse_cidr_list(&cidrs)?;
        }
        if let Some(domains) = file.cache_bypass_domains {
            self.cache_bypass_domains = domains;
        }
        if let Some(value) = file.enable_dns_chain_preservation {
            self.enable_chain_preservation = value;
        }
        if let Some(value) = file.max_retries {
            self.max_retries = value;
        }
        if let Some(value) = file.initial_backoff_ms {
            self.initial_backoff_ms = value;
        }
        if let Some(value) = file.bind_interface_strategy {
            self.bind_interface_strategy = value;
        }
        if let Some(value) = file.sticky_interface_per_transaction {
            self.sticky_interface_per_transaction = value;
        }
        if file.manifest_url.is_some() {
            self.manifest_url = file.manifest_url;
        }
        if let Some(value) = file.manifest_identifier {
            self.manifest_identifier = value;
        }
        if let Some(secs) = file.manifest_update_interval {
            self.manifest_update_interval = Duration::from_secs(secs);
        }
        if let Some(value) = file.max_concurrent_fetches {
            self.max_concurrent_fetches = value;
        }
        if file.rule_store_path.is_some() {
            self.rule_store_path = file.rule_store_path;
        }
        if file.state_dir.is_some() {
            self.state_dir = file.state_dir;
        }
        if file.command_socket.is_some() {
            self.command_socket = file.command_socket;
        }
        if let Some(value) = file.wildcard_matches_root {
            self.wildcard_matches_root = value;
        }
        if let Some(value) = file.response_cache_capacity {
            self.response_cache_capacity = value;
        }
        if let Some(value) = file.rule_cache_capacity {
            self.rule_cache_capacity = value;
        }
        if let Some(secs) = file.rule_cache_base_ttl {
            self.rule_cache_base_ttl = Duration::from_secs(secs);
        }
        Ok(())
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(raw) = env_var("DNSGATE_DNS_SERVERS") {
            self.dns_servers = parse_addr_list(&raw)?;
        }
        if let Some(raw) = env_var("DNSGATE_ENABLE_DNS_CACHE_MANAGED") {
            self.enable_dns_cache_managed = Some(parse_bool(&raw, true));
        }
        if let Some(raw) = env_var("DNSGATE_USER_CAN_ADJUST_CACHE") {
            self.user_can_adjust_cache = Some(parse_bool(&raw, true));
        }
        if let Some(raw) = env_var("DNSGATE_ENABLE_DNS_CACHE") {
            self.enable_dns_cache_user = Some(parse_bool(&raw, true));
        }
        if let Some(raw) = env_var("DNSGATE_VPN_RESOLVERS") {
            let parts: Vec<String> = raw.split(',').map(|s| s.trim().to_string()).collect();
            self.vpn_resolvers = parse_cidr_list(&parts)?;
        }
        if let Some(raw) = env_var("DNSGATE_CACHE_BYPASS_DOMAINS") {
            self.cache_bypass_domains = raw
                .split(',')
                .map(|s| s.trim().to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(raw) = env_var("DNSGATE_ENABLE_CHAIN_PRESERVATION") {
            self.enable_chain_preservation = parse_bool(&raw, true);
        }
        if let Some(raw) = env_var("DNSGATE_MAX_RETRIES") {
            self.max_retries = raw
                .parse()
                .map_err(|_| GateError::ConfigInvalid(format!("invalid max retries: {}", raw)))?;
        }
        if let Some(raw) = env_var("DNSGATE_INITIAL_BACKOFF_MS") {
            self.initial_backoff_ms = raw.parse().map_err(|_| {
                GateError::ConfigInvalid(format!("invalid initial backoff: {}", raw))
            })?;
        }
        if let Some(raw) = env_var("DNSGATE_BIND_INTERFACE_STRATEGY") {
            self.bind_interface_strategy = BindInterfaceStrategy::parse(&raw).ok_or_else(|| {
                GateError::ConfigInvalid(format!("invalid bind interface strategy: {}", raw))
            })?;
        }
        if let Some(raw) = env_var("DNSGATE_STICKY_INTERFACE") {
            self.sticky_interface_per_transaction = parse_bool(&raw, true);
        }
        if let Some(raw) = env_var("DNSGATE_MANIFEST_URL") {
            self.manifest_url = Some(raw);
        }
        if let Some(raw) = env_var("DNSGATE_MANIFEST_IDENTIFIER") {
            self.manifest_identifier = raw;
        }
        if let Some(raw) = env_var("DNSGATE_MANIFEST_UPDATE_INTERVAL") {
            let secs: u64 = raw.parse().map_err(|_| {
                GateError::ConfigInvalid(format!("invalid manifest interval: {}", raw))
            })?;
            self.manifest_update_interval = Duration::from_secs(secs);
        }
        if let Some(raw) = env_var("DNSGATE_RULE_STORE_PATH") {
            self.rule_store_path = Some(PathBuf::from(raw));
        }
        if let Some(raw) = env_var("DNSGATE_STATE_DIR") {
            self.state_dir = Some(PathBuf::from(raw));
        }
        if let Some(raw) = env_var("DNSGATE_COMMAND_SOCKET") {
            self.command_socket = Some(PathBuf::from(raw));
        }
        if let Some(raw) = env_var("DNSGATE_WILDCARD_MATCHES_ROOT") {
            self.wildcard_matches_root = parse_bool(&raw, false);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.dns_servers.is_empty() {
            return Err(GateError::ConfigInvalid(
                "at least one upstream resolver is required".to_string(),
            ));
        }
        if self.max_retries > 10 {
            return Err(GateError::ConfigInvalid(format!(
                "max retries {} outside [0, 10]",
                self.max_retries
            )));
        }
        if !(50..=5000).contains(&self.initial_backoff_ms) {
            return Err(GateError::ConfigInvalid(format!(
                "initial backoff {}ms outside [50, 5000]",
                self.initial_backoff_ms
            )));
        }
        if self.manifest_update_interval < Duration::from_secs(10) {
            return Err(GateError::ConfigInvalid(
                "manifest update interval below 10s".to_string(),
            ));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(GateError::ConfigInvalid(
                "max concurrent fetches must be at least 1".to_string(),
            ));
        }
        if self.manifest_url.is_none() && self.manifest_identifier.is_empty() {
            return Err(GateError::ConfigInvalid(
                "manifest identifier must not be empty".to_string(),
            ));
        }
        for rule in &self.domain_cache_rules {
            if rule.mode == crate::cache::CacheMode::Custom && rule.ttl.is_none() {
                return Err(GateError::ConfigInvalid(format!(
                    "custom cache rule for {} is missing a ttl",
                    rule.pattern
                )));
            }
        }
        Ok(())
    }

    /// Response caching on/off: managed value wins when delivered, then the
    /// user adjustment, then the legacy user toggle, then on.
    pub fn cache_enabled(&self) -> bool {
        self.enable_dns_cache_managed
            .or(self.user_can_adjust_cache)
            .or(self.enable_dns_cache_user)
            .unwrap_or(true)
    }

    /// The do-not-cache policy derived from this configuration.
    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            enabled: self.cache_enabled(),
            vpn_cidrs: self.vpn_resolvers.clone(),
            bypass_suffixes: self.cache_bypass_domains.clone(),
            domain_rules: self.domain_cache_rules.clone(),
        }
    }

    pub fn is_vpn_resolver(&self, addr: IpAddr) -> bool {
        self.vpn_resolvers.iter().any(|net| net.contains(&addr))
    }
}

/// Shared, reloadable configuration. `update` rejects invalid replacements
/// and keeps the previous config live; subscribers learn about accepted
/// changes through the watch channel.
pub struct ConfigHandle {
    current: RwLock<Arc<Config>>,
    notify: watch::Sender<u64>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            current: RwLock::new(Arc::new(config)),
            notify,
        }
    }

    pub fn get(&self) -> Arc<Config> {
        self.current.read().clone()
    }

    /// Replace the live config. Invalid updates are rejected in full.
    pub fn update(&self, config: Config) -> Result<()> {
        config.validate()?;
        *self.current.write() = Arc::new(config);
        self.notify.send_modify(|generation| *generation += 1);
        info!("configuration updated");
        Ok(())
    }

    /// Ticks once per accepted update.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }
}

/// Watch the TOML config file and reload on change. Invalid files are
/// logged and ignored; the previous config stays in effect.
pub fn spawn_file_watcher(handle: Arc<ConfigHandle>, path: PathBuf) {
    tokio::spawn(async move {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

        let watcher_result: std::result::Result<RecommendedWatcher, notify::Error> = Watcher::new(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(err) => error!(error = %err, "config watch error"),
            },
            notify::Config::default(),
        );

        let mut watcher = match watcher_result {
            Ok(w) => w,
            Err(err) => {
                error!(error = %err, "failed to create config watcher");
                return;
            }
        };
        if let Err(err) = watcher.watch(&path, RecursiveMode::NonRecursive) {
            error!(error = %err, path = %path.display(), "failed to watch config file");
            return;
        }
        info!(path = %path.display(), "watching configuration file");

        while let Some(event) = rx.recv().await {
            if !event.kind.is_modify() && !event.kind.is_create() {
                continue;
            }
            match Config::load(Some(&path)) {
                Ok(config) => {
                    if let Err(err) = handle.update(config) {
                        warn!(error = %err, "rejected configuration update");
                    }
                }
                Err(err) => warn!(error = %err, "ignored invalid configuration file"),
            }
        }
    });
}
