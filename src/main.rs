use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dnsgate::cache::{ResponseCache, ResponseCacheConfig};
use dnsgate::command::{CommandContext, CommandHandler, spawn_command_server};
use dnsgate::config::{Config, ConfigHandle, spawn_file_watcher};
use dnsgate::engine::{EngineConfig, EnginePrefs, FlowEngine};
use dnsgate::listen;
use dnsgate::manifest::{Fetcher, Orchestrator, SourceConfig};
use dnsgate::rules::{RuleCache, RuleCacheConfig, RuleStore, StoreOptions};
use dnsgate::stats::GateStats;

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 1;
const EXIT_STORE: i32 = 2;
const EXIT_INIT: i32 = 3;

#[derive(Parser, Debug)]
#[command(name = "dnsgate", about = "Host-level DNS filtering proxy", version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// UDP/TCP listen address for the local resolver front end
    #[arg(short, long, default_value = "127.0.0.1:5353")]
    listen: SocketAddr,

    /// Log filter, e.g. "dnsgate=debug" (overrides RUST_LOG)
    #[arg(long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = cli
        .log
        .clone()
        .map(EnvFilter::new)
        .unwrap_or_else(|| {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
        });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration invalid");
            return EXIT_CONFIG;
        }
    };

    let store = match RuleStore::open(StoreOptions {
        path: config.rule_store_path.clone(),
        wildcard_matches_root: config.wildcard_matches_root,
    }) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(error = %err, "rule store unusable");
            return EXIT_STORE;
        }
    };

    let rule_cache = Arc::new(RuleCache::new(RuleCacheConfig {
        capacity: config.rule_cache_capacity,
        base_ttl: config.rule_cache_base_ttl,
        tiers: config.rule_cache_tiers.clone(),
    }));
    let response_cache = Arc::new(ResponseCache::new(ResponseCacheConfig {
        capacity: config.response_cache_capacity,
        ..ResponseCacheConfig::default()
    }));
    let stats = Arc::new(GateStats::new());

    let (engine, _pool, _engine_join) = FlowEngine::spawn(
        EngineConfig::from(&config),
        store.clone(),
        rule_cache.clone(),
        response_cache.clone(),
        stats.clone(),
    );

    // Rule update orchestration, when a manifest endpoint is configured.
    let orchestrator = config.manifest_url.as_ref().map(|url| {
        let source = SourceConfig::primary_manifest(
            url,
            &config.manifest_identifier,
            config.manifest_update_interval,
        );
        let fetcher = Fetcher::new(config.state_dir.clone());
        let (handle, _join) = Orchestrator::spawn(
            vec![source],
            fetcher,
            store.clone(),
            rule_cache.clone(),
            response_cache.clone(),
            config.max_concurrent_fetches,
            &config.manifest_identifier,
        );
        handle
    });

    let config_handle = Arc::new(ConfigHandle::new(config.clone()));
    if let Some(path) = cli.config.clone() {
        spawn_file_watcher(config_handle.clone(), path);
    }

    // Propagate accepted preference changes into the engine.
    {
        let mut updates = config_handle.subscribe();
        let config_handle = config_handle.clone();
        let engine = engine.clone();
        tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let current = config_handle.get();
                engine
                    .preferences_changed(EnginePrefs {
                        upstreams: current
                            .dns_servers
                            .iter()
                            .map(|ip| SocketAddr::new(*ip, 53))
                            .collect(),
                        vpn_cidrs: current.vpn_resolvers.clone(),
                        cache_policy: current.cache_policy(),
                        chain_preservation: current.enable_chain_preservation,
                    })
                    .await;
            }
        });
    }

    if let Some(socket_path) = config.command_socket.clone() {
        let handler = Arc::new(CommandHandler::new(CommandContext {
            store: store.clone(),
            rule_cache: rule_cache.clone(),
            response_cache: response_cache.clone(),
            stats: stats.clone(),
            engine: engine.clone(),
            orchestrator: orchestrator.clone(),
            config: config_handle.clone(),
            config_path: cli.config.clone(),
        }));
        if let Err(err) = spawn_command_server(socket_path, handler) {
            error!(error = %err, "command channel failed to start");
            return EXIT_INIT;
        }
    }

    if let Err(err) = listen::serve_udp(engine.clone(), cli.listen).await {
        error!(error = %err, "UDP listener failed to start");
        return EXIT_INIT;
    }
    if let Err(err) = listen::serve_tcp(engine.clone(), cli.listen).await {
        error!(error = %err, "TCP listener failed to start");
        return EXIT_INIT;
    }

    if let Some(orchestrator) = &orchestrator {
        orchestrator.trigger_sync().await;
    }
    engine.startup_complete().await;
    info!(listen = %cli.listen, "dnsgate running");

    wait_for_shutdown().await;
    info!("shutting down");
    if let Some(orchestrator) = &orchestrator {
        orchestrator.stop().await;
    }
    engine.shutdown().await;
    EXIT_OK
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installs");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
