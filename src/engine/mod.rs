//! The flow engine: a single serial task owns every piece of mutable flow
//! state (active flows, pending queries, TCP transaction map, transition
//! queue) and runs the per-query pipeline. All I/O completions re-enter the
//! task as typed messages; nothing here blocks on the network.

pub mod flow;
pub mod pending;
pub mod transition;

pub use flow::{
    FlowProto, FlowRecord, FlowShared, FlowToken, READ_BACKOFF, TcpFlowHandle, UdpFlowHandle,
};
pub use pending::{PendingMap, PendingQuery};
pub use transition::{QueuedQuery, TransitionQueue};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use ipnet::IpNet;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::cache::{CachePolicy, ResponseCache};
use crate::config::Config;
use crate::dns::{self, QueryType};
use crate::engine::flow::{FlowHandleKind, WriteJob, next_backoff};
use crate::error::GateError;
use crate::rules::{RuleCache, RuleStore, Verdict};
use crate::stats::GateStats;
use crate::upstream::{RetryPolicy, UpstreamEvent, UpstreamPool};

const ENGINE_QUEUE_DEPTH: usize = 1024;
const FLOW_WRITE_QUEUE_DEPTH: usize = 64;

/// Engine lifecycle. Queries are only processed in `Running`; `Transition`
/// parks them in the bounded queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum EngineState {
    Starting,
    Running,
    Transition,
    Stopping,
    Stopped,
}

/// Data-plane knobs the engine needs, cut from the full configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub upstreams: Vec<SocketAddr>,
    pub chain_preservation: bool,
    pub vpn_cidrs: Vec<IpNet>,
    pub cache_policy: CachePolicy,
    pub retry: RetryPolicy,
    /// How long a query may wait for its upstream to connect.
    pub connect_grace: Duration,
    /// Delay before re-attempting a forward on a non-connected upstream.
    pub retry_delay: Duration,
    /// Pending queries older than this are failed with SERVFAIL.
    pub pending_timeout: Duration,
    pub cleanup_interval: Duration,
    pub transition_capacity: usize,
}

impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        Self {
            upstreams: config
                .dns_servers
                .iter()
                .map(|ip| SocketAddr::new(*ip, 53))
                .collect(),
            chain_preservation: config.enable_chain_preservation,
            vpn_cidrs: config.vpn_resolvers.clone(),
            cache_policy: config.cache_policy(),
            retry: RetryPolicy::clamped(config.max_retries, config.initial_backoff_ms),
            connect_grace: Duration::from_secs(2),
            retry_delay: Duration::from_millis(500),
            pending_timeout: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(5),
            transition_capacity: 1000,
        }
    }
}

/// Preference changes applied to a running engine.
#[derive(Debug, Clone)]
pub struct EnginePrefs {
    pub upstreams: Vec<SocketAddr>,
    pub vpn_cidrs: Vec<IpNet>,
    pub cache_policy: CachePolicy,
    pub chain_preservation: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub active_flows: usize,
    pub pending_queries: usize,
    pub transition_queued: usize,
    pub reachable: bool,
}

enum EngineMsg {
    NewUdpFlow {
        token: FlowToken,
        handle: Arc<dyn UdpFlowHandle>,
        remote: SocketAddr,
    },
    NewTcpFlow {
        token: FlowToken,
        handle: Arc<dyn TcpFlowHandle>,
        remote: SocketAddr,
    },
    Datagram {
        token: FlowToken,
        data: Bytes,
        client: SocketAddr,
    },
    TcpQuery {
        token: FlowToken,
        data: Bytes,
    },
    ForwardRetry {
        txid: u16,
    },
    FlowClosed {
        token: FlowToken,
    },
    PathChanged,
    StartupComplete,
    SetReachable(bool),
    PreferencesChanged(EnginePrefs),
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    Shutdown,
}

/// Cloneable front door to the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineMsg>,
    next_flow_id: Arc<AtomicU64>,
}

impl EngineHandle {
    fn allocate_token(&self) -> FlowToken {
        let id = self.next_flow_id.fetch_add(1, Ordering::Relaxed);
        FlowToken { id, generation: id }
    }

    /// Accept a new UDP flow from the OS. Returns the token the caller can
    /// correlate in logs; the engine owns the handle from here on.
    pub async fn register_udp_flow(
        &self,
        handle: Arc<dyn UdpFlowHandle>,
        remote: SocketAddr,
    ) -> FlowToken {
        let token = self.allocate_token();
        let _ = self
            .tx
            .send(EngineMsg::NewUdpFlow {
                token,
                handle,
                remote,
            })
            .await;
        token
    }

    pub async fn register_tcp_flow(
        &self,
        handle: Arc<dyn TcpFlowHandle>,
        remote: SocketAddr,
    ) -> FlowToken {
        let token = self.allocate_token();
        let _ = self
            .tx
            .send(EngineMsg::NewTcpFlow {
                token,
                handle,
                remote,
            })
            .await;
        token
    }

    /// Signal a VPN state flip or a significant network-path change: the
    /// engine re-enters Transition and drops its upstream connections.
    pub async fn path_changed(&self) {
        let _ = self.tx.send(EngineMsg::PathChanged).await;
    }

    /// Finish startup (or a transition): warm upstreams, drain the queue,
    /// run.
    pub async fn startup_complete(&self) {
        let _ = self.tx.send(EngineMsg::StartupComplete).await;
    }

    pub async fn set_reachable(&self, reachable: bool) {
        let _ = self.tx.send(EngineMsg::SetReachable(reachable)).await;
    }

    pub async fn preferences_changed(&self, prefs: EnginePrefs) {
        let _ = self.tx.send(EngineMsg::PreferencesChanged(prefs)).await;
    }

    pub async fn status(&self) -> Option<EngineStatus> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(EngineMsg::Status { reply }).await.ok()?;
        rx.await.ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(EngineMsg::Shutdown).await;
    }
}

pub struct FlowEngine;

impl FlowEngine {
    /// Spawn the engine task. The engine starts in Transition (queries are
    /// queued) until `startup_complete` is signalled.
    pub fn spawn(
        config: EngineConfig,
        store: Arc<RuleStore>,
        rule_cache: Arc<RuleCache>,
        response_cache: Arc<ResponseCache>,
        stats: Arc<GateStats>,
    ) -> (EngineHandle, Arc<UpstreamPool>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(ENGINE_QUEUE_DEPTH);
        let (upstream_tx, upstream_rx) = mpsc::channel(ENGINE_QUEUE_DEPTH);
        let pool = Arc::new(UpstreamPool::new(config.retry, upstream_tx));

        let handle = EngineHandle {
            tx: tx.clone(),
            next_flow_id: Arc::new(AtomicU64::new(1)),
        };

        let actor = EngineActor {
            transition: TransitionQueue::new(config.transition_capacity),
            upstreams: config.upstreams.clone(),
            config,
            state: EngineState::Starting,
            reachable: true,
            flows: HashMap::new(),
            pending: PendingMap::new(),
            tcp_flows: HashMap::new(),
            pool: pool.clone(),
            store,
            rule_cache,
            response_cache,
            stats,
            engine_tx: tx,
        };

        let join = tokio::spawn(actor.run(rx, upstream_rx));
        (handle, pool, join)
    }
}

struct EngineActor {
    config: EngineConfig,
    state: EngineState,
    reachable: bool,
    flows: HashMap<u64, FlowRecord>,
    pending: PendingMap,
    /// transaction id → TCP flow, captured on the fast path at admission.
    /// TCP responses route through this association; the pending record's
    /// token is the fallback once cleanup has dropped the entry.
    tcp_flows: HashMap<u16, FlowToken>,
    transition: TransitionQueue,
    /// Working upstream list; chain-preserved resolvers get prepended.
    upstreams: Vec<SocketAddr>,
    pool: Arc<UpstreamPool>,
    store: Arc<RuleStore>,
    rule_cache: Arc<RuleCache>,
    response_cache: Arc<ResponseCache>,
    stats: Arc<GateStats>,
    engine_tx: mpsc::Sender<EngineMsg>,
}

impl EngineActor {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<EngineMsg>,
        mut upstream_rx: mpsc::Receiver<UpstreamEvent>,
    ) {
        // Start queued: everything that arrives before startup completes is
        // parked in the transition queue.
        self.state = EngineState::Transition;
        info!("flow engine started in transition");

        let mut cleanup = tokio::time::interval(self.config.cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep = tokio::time::interval(self.response_cache.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(EngineMsg::Shutdown) | None => {
                            self.shutdown();
                            break;
                        }
                        Some(msg) => self.handle_message(msg).await,
                    }
                }
                event = upstream_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_upstream_response(event);
                    }
                }
                _ = cleanup.tick() => self.cleanup(),
                _ = sweep.tick() => {
                    self.response_cache.sweep();
                    self.rule_cache.sweep();
                }
            }
        }
        info!("flow engine stopped");
    }

    async fn handle_message(&mut self, msg: EngineMsg) {
        match msg {
            EngineMsg::NewUdpFlow {
                token,
                handle,
                remote,
            } => self.accept_udp_flow(token, handle, remote),
            EngineMsg::NewTcpFlow {
                token,
                handle,
                remote,
            } => self.accept_tcp_flow(token, handle, remote),
            EngineMsg::Datagram {
                token,
                data,
                client,
            } => self.admit_query(token, data, client, FlowProto::Udp).await,
            EngineMsg::TcpQuery { token, data } => {
                let Some(record) = self.flows.get(&token.id) else {
                    return;
                };
                let client = record.remote;
                self.admit_query(token, data, client, FlowProto::Tcp).await;
            }
            EngineMsg::ForwardRetry { txid } => self.forward_pending(txid).await,
            EngineMsg::FlowClosed { token } => self.close_flow(token),
            EngineMsg::PathChanged => {
                if self.state == EngineState::Running {
                    info!("network path changed; entering transition");
                    self.state = EngineState::Transition;
                }
                self.pool.close_all();
            }
            EngineMsg::StartupComplete => self.complete_transition().await,
            EngineMsg::SetReachable(reachable) => {
                if self.reachable != reachable {
                    info!(reachable, "network reachability changed");
                    self.reachable = reachable;
                }
            }
            EngineMsg::PreferencesChanged(prefs) => {
                info!("applying preference change");
                self.upstreams = prefs.upstreams.clone();
                self.config.upstreams = prefs.upstreams;
                self.config.vpn_cidrs = prefs.vpn_cidrs;
                self.config.cache_policy = prefs.cache_policy;
                self.config.chain_preservation = prefs.chain_preservation;
                self.pool.close_all();
            }
            EngineMsg::Status { reply } => {
                let _ = reply.send(EngineStatus {
                    state: self.state,
                    active_flows: self.flows.len(),
                    pending_queries: self.pending.len(),
                    transition_queued: self.transition.len(),
                    reachable: self.reachable,
                });
            }
            EngineMsg::Shutdown => unreachable!("handled in run loop"),
        }
    }

    // ---- flow acceptance ----

    fn accept_udp_flow(
        &mut self,
        token: FlowToken,
        handle: Arc<dyn UdpFlowHandle>,
        remote: SocketAddr,
    ) {
        if matches!(self.state, EngineState::Stopping | EngineState::Stopped) {
            handle.close_read();
            handle.close_write();
            return;
        }

        let shared = Arc::new(FlowShared::default());
        let (write_tx, write_rx) = mpsc::channel(FLOW_WRITE_QUEUE_DEPTH);
        let record = FlowRecord {
            token,
            remote,
            proto: FlowProto::Udp,
            shared: shared.clone(),
            write_tx,
            handle: FlowHandleKind::Udp(handle.clone()),
        };
        debug!(flow = token.id, %remote, "accepted UDP flow");
        self.flows.insert(token.id, record);

        spawn_udp_writer(
            handle.clone(),
            shared.clone(),
            write_rx,
            self.engine_tx.clone(),
            token,
        );
        spawn_udp_reader(handle, shared, self.engine_tx.clone(), token);
    }

    fn accept_tcp_flow(
        &mut self,
        token: FlowToken,
        handle: Arc<dyn TcpFlowHandle>,
        remote: SocketAddr,
    ) {
        if matches!(self.state, EngineState::Stopping | EngineState::Stopped) {
            handle.close_read();
            handle.close_write();
            return;
        }

        let shared = Arc::new(FlowShared::default());
        let (write_tx, write_rx) = mpsc::channel(FLOW_WRITE_QUEUE_DEPTH);
        let record = FlowRecord {
            token,
            remote,
            proto: FlowProto::Tcp,
            shared: shared.clone(),
            write_tx,
            handle: FlowHandleKind::Tcp(handle.clone()),
        };
        debug!(flow = token.id, %remote, "accepted TCP flow");
        self.flows.insert(token.id, record);

        spawn_tcp_writer(
            handle.clone(),
            shared.clone(),
            write_rx,
            self.engine_tx.clone(),
            token,
        );
        spawn_tcp_reader(handle, shared, self.engine_tx.clone(), token);
    }

    /// Remove a flow from the active set and mark it closed, in the same
    /// engine turn. A closed flow is never written again, and any query
    /// still in flight on it can never be answered, so its pending state
    /// goes with it.
    fn close_flow(&mut self, token: FlowToken) {
        if let Some(record) = self.flows.remove(&token.id) {
            record.shared.mark_closed();
            debug!(flow = token.id, "flow closed");
        }
        for txid in self.pending.on_flow(token) {
            debug!(txid, flow = token.id, "evicting pending query on closed flow");
            self.pending.take(txid);
            self.tcp_flows.remove(&txid);
        }
        self.tcp_flows.retain(|_, flow| *flow != token);
    }

    // ---- query admission ----

    async fn admit_query(
        &mut self,
        token: FlowToken,
        data: Bytes,
        client: SocketAddr,
        proto: FlowProto,
    ) {
        match self.state {
            EngineState::Running => self.process_query(token, data, client, proto).await,
            EngineState::Starting | EngineState::Transition => {
                let dropped = self.transition.enqueue(QueuedQuery {
                    token,
                    data,
                    client,
                    proto,
                    enqueued_at: Instant::now(),
                });
                if let Some(dropped) = dropped {
                    self.stats.record_transition_drop();
                    warn!(
                        flow = dropped.token.id,
                        queued = self.transition.len(),
                        "transition queue overflow; dropped oldest query"
                    );
                }
            }
            EngineState::Stopping | EngineState::Stopped => {
                trace!(flow = token.id, "query dropped during shutdown");
            }
        }
    }

    async fn complete_transition(&mut self) {
        if matches!(self.state, EngineState::Stopping | EngineState::Stopped) {
            return;
        }

        for upstream in self.upstreams.clone() {
            self.pool.get_or_create(upstream).await;
        }

        self.state = EngineState::Running;
        let queued = self.transition.drain();
        if !queued.is_empty() {
            info!(count = queued.len(), "draining transition queue");
        }
        for entry in queued {
            self.process_query(entry.token, entry.data, entry.client, entry.proto)
                .await;
        }
    }

    // ---- the per-query pipeline ----

    async fn process_query(
        &mut self,
        token: FlowToken,
        data: Bytes,
        client: SocketAddr,
        proto: FlowProto,
    ) {
        self.stats.record_query();

        let query = match dns::decode_query(&data) {
            Ok(query) => query,
            Err(err) => {
                debug!(error = %err, flow = token.id, "query failed to decode");
                self.stats.record_format_error();
                self.write_to_flow(token, dns::synthesize_format_error(&data).into(), client);
                return;
            }
        };

        // Offline: serve from cache when possible, otherwise admit failure
        // quickly instead of timing the client out.
        if !self.reachable {
            if let Some(hit) =
                self.response_cache
                    .get(&query.qname, query.qtype, query.id.to_be_bytes())
            {
                self.stats.record_cache_hit();
                self.write_to_flow(token, hit.into(), client);
            } else {
                self.stats.record_servfail();
                self.write_to_flow(token, dns::synthesize_servfail(&query).into(), client);
            }
            return;
        }

        if self.config.cache_policy.enabled {
            if let Some(hit) =
                self.response_cache
                    .get(&query.qname, query.qtype, query.id.to_be_bytes())
            {
                trace!(qname = %query.qname, "served from response cache");
                self.stats.record_cache_hit();
                self.write_to_flow(token, hit.into(), client);
                return;
            }
        }

        self.store.record_query(&query.qname);

        let verdict = match self.rule_cache.get(&query.qname) {
            Some(verdict) => verdict,
            None => {
                let verdict = self.store.snapshot().verdict_for(&query.qname);
                let count = self.store.query_count(&query.qname);
                self.rule_cache.insert(&query.qname, verdict, count);
                verdict
            }
        };

        if verdict == Verdict::Block {
            self.stats.record_blocked();
            let reply = match query.qtype {
                QueryType::A => dns::synthesize_block_a(&query),
                QueryType::Aaaa => dns::synthesize_block_aaaa(&query),
                _ => dns::synthesize_nxdomain(&query),
            };
            debug!(qname = %query.qname, qtype = %query.qtype, "blocked");
            self.write_to_flow(token, reply.into(), client);
            return;
        }

        // Forward. Capture the originating resolver when the client is
        // itself a resolver (port 53, or a VPN-range source address) so the
        // existing DNS chain stays intact.
        let original_resolver = if self.config.chain_preservation
            && (client.port() == 53 || self.is_vpn_addr(client))
        {
            Some(SocketAddr::new(client.ip(), 53))
        } else {
            None
        };

        let txid = query.id;
        let pending = PendingQuery {
            token,
            client,
            proto,
            query,
            wire: data,
            original_resolver,
            forwarded_to: None,
            submitted_at: Instant::now(),
            attempts: 0,
        };

        // One pending query per transaction id: a duplicate id fails the
        // older in-flight query first, along with its flow association.
        if let Some(displaced) = self.pending.insert(txid, pending) {
            warn!(txid, "duplicate transaction id; failing older query");
            self.tcp_flows.remove(&txid);
            self.write_servfail(&displaced);
        }
        if proto == FlowProto::Tcp {
            self.tcp_flows.insert(txid, token);
        }

        self.forward_pending(txid).await;
    }

    fn is_vpn_addr(&self, addr: SocketAddr) -> bool {
        self.config
            .vpn_cidrs
            .iter()
            .any(|net| net.contains(&addr.ip()))
    }

    /// Upstream selection and dispatch for a pending query, including the
    /// connect-grace, chain-preservation retry, and failover rules.
    async fn forward_pending(&mut self, txid: u16) {
        let Some(pending) = self.pending.get(txid) else {
            return;
        };
        let age = pending.submitted_at.elapsed();
        let original_resolver = pending.original_resolver;
        let wire = pending.wire.clone();

        // A chain-preserved resolver joins the front of the upstream list.
        if let Some(resolver) = original_resolver {
            if !self.upstreams.contains(&resolver) {
                self.upstreams.insert(0, resolver);
            }
        }

        let primary = original_resolver
            .or_else(|| self.upstreams.first().copied());
        let Some(primary) = primary else {
            self.fail_pending(txid);
            return;
        };

        let conn = self.pool.get_or_create(primary).await;
        if conn.is_connected() {
            self.dispatch(txid, primary, wire);
            return;
        }

        if age >= self.config.connect_grace {
            debug!(txid, upstream = %primary, "connect grace expired");
            self.fail_pending(txid);
            return;
        }

        // Chain preservation pins the query to its resolver: no failover,
        // just retry once the connection has had time to come up.
        if original_resolver.is_some() && self.config.chain_preservation {
            self.schedule_retry(txid);
            return;
        }

        let fallback = self
            .upstreams
            .iter()
            .copied()
            .find(|addr| *addr != primary);
        if let Some(fallback) = fallback {
            let conn = self.pool.get_or_create(fallback).await;
            if conn.is_connected() {
                debug!(txid, from = %primary, to = %fallback, "failing over");
                self.dispatch(txid, fallback, wire);
                return;
            }
        }

        self.schedule_retry(txid);
    }

    fn dispatch(&mut self, txid: u16, upstream: SocketAddr, wire: Bytes) {
        let Some(conn) = self.pool.get(upstream) else {
            self.schedule_retry(txid);
            return;
        };
        match conn.send(wire) {
            Ok(()) => {
                if let Some(pending) = self.pending.get_mut(txid) {
                    pending.forwarded_to = Some(upstream);
                    pending.attempts += 1;
                }
                self.stats.record_forwarded();
                trace!(txid, %upstream, "forwarded");
            }
            Err(err) => {
                debug!(txid, %upstream, error = %err, "dispatch failed");
                self.schedule_retry(txid);
            }
        }
    }

    fn schedule_retry(&self, txid: u16) {
        let tx = self.engine_tx.clone();
        let delay = self.config.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(EngineMsg::ForwardRetry { txid }).await;
        });
    }

    /// SERVFAIL the pending query and evict its state.
    fn fail_pending(&mut self, txid: u16) {
        if let Some(pending) = self.pending.take(txid) {
            self.tcp_flows.remove(&txid);
            self.write_servfail(&pending);
        }
    }

    fn write_servfail(&mut self, pending: &PendingQuery) {
        self.stats.record_servfail();
        let reply = dns::synthesize_servfail(&pending.query);
        self.write_to_flow(pending.token, reply.into(), pending.client);
    }

    // ---- upstream responses ----

    fn handle_upstream_response(&mut self, event: UpstreamEvent) {
        let Ok(id) = dns::extract_transaction_id(&event.data) else {
            self.stats.record_dropped_response();
            return;
        };
        let txid = u16::from_be_bytes(id);

        let Some(pending) = self.pending.take(txid) else {
            trace!(txid, "response without pending query; dropped");
            self.stats.record_dropped_response();
            return;
        };
        // TCP responses route through the flow association captured at
        // admission; the pending record's token is the fallback when
        // cleanup already dropped the map entry.
        let target = match (pending.proto, self.tcp_flows.remove(&txid)) {
            (FlowProto::Tcp, Some(mapped)) => mapped,
            _ => pending.token,
        };

        // Best-effort decode: an undecodable answer is still forwarded raw,
        // it just cannot be cached.
        if let Ok(response) = dns::decode_response(&event.data) {
            let policy = &self.config.cache_policy;
            if policy.should_store(&response, event.server.ip()) {
                self.response_cache.store(
                    &response.qname,
                    response.qtype,
                    &event.data,
                    response.min_ttl,
                    policy.ttl_override(&response.qname),
                );
            }
        }

        let data = if pending.proto == FlowProto::Udp && event.data.len() > dns::MAX_UDP_PAYLOAD {
            Bytes::from(dns::synthesize_truncated_from(&event.data))
        } else {
            event.data
        };

        self.write_to_flow(target, data, pending.client);
    }

    // ---- writes ----

    fn write_to_flow(&mut self, token: FlowToken, data: Bytes, endpoint: SocketAddr) {
        let Some(record) = self.flows.get(&token.id) else {
            trace!(flow = token.id, "write skipped; flow gone");
            return;
        };
        if !record.shared.is_active() {
            trace!(flow = token.id, "write skipped; flow closed");
            return;
        }
        if record
            .write_tx
            .try_send(WriteJob { data, endpoint })
            .is_err()
        {
            warn!(flow = token.id, "flow write queue full; dropping response");
        }
    }

    // ---- periodic maintenance ----

    /// SERVFAIL and evict pending queries past the age limit; drop closed
    /// flows from the tracking set.
    fn cleanup(&mut self) {
        for txid in self.pending.expired(self.config.pending_timeout) {
            debug!(txid, "pending query timed out");
            self.fail_pending(txid);
        }

        let closed: Vec<u64> = self
            .flows
            .iter()
            .filter(|(_, record)| !record.shared.is_active())
            .map(|(id, _)| *id)
            .collect();
        for id in closed {
            if let Some(record) = self.flows.remove(&id) {
                self.tcp_flows.retain(|_, flow| *flow != record.token);
            }
        }

        self.store.cleanup_query_stats(Duration::from_secs(24 * 3600));
    }

    fn shutdown(&mut self) {
        info!("flow engine stopping");
        self.state = EngineState::Stopping;
        for record in self.flows.values() {
            record.close();
        }
        self.flows.clear();
        self.tcp_flows.clear();
        self.pool.close_all();
        self.state = EngineState::Stopped;
    }
}

// ---- reader / writer tasks ----

fn spawn_udp_reader(
    handle: Arc<dyn UdpFlowHandle>,
    shared: Arc<FlowShared>,
    engine_tx: mpsc::Sender<EngineMsg>,
    token: FlowToken,
) {
    tokio::spawn(async move {
        let mut backoff_idx = 0usize;
        loop {
            if !shared.is_active() {
                break;
            }
            match handle.read_datagrams().await {
                Ok(datagrams) if !datagrams.is_empty() => {
                    backoff_idx = 0;
                    for (data, client) in datagrams {
                        if engine_tx
                            .send(EngineMsg::Datagram {
                                token,
                                data,
                                client,
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                Ok(_) => {
                    tokio::time::sleep(READ_BACKOFF[backoff_idx]).await;
                    backoff_idx = next_backoff(backoff_idx);
                }
                Err(err) => {
                    trace!(flow = token.id, error = %err, "flow read failed");
                    let _ = engine_tx.send(EngineMsg::FlowClosed { token }).await;
                    break;
                }
            }
        }
    });
}

fn spawn_tcp_reader(
    handle: Arc<dyn TcpFlowHandle>,
    shared: Arc<FlowShared>,
    engine_tx: mpsc::Sender<EngineMsg>,
    token: FlowToken,
) {
    tokio::spawn(async move {
        loop {
            if !shared.is_active() {
                break;
            }
            match handle.read_message().await {
                Ok(Some(data)) => {
                    if engine_tx
                        .send(EngineMsg::TcpQuery { token, data })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Ok(None) | Err(_) => {
                    let _ = engine_tx.send(EngineMsg::FlowClosed { token }).await;
                    break;
                }
            }
        }
    });
}

fn spawn_udp_writer(
    handle: Arc<dyn UdpFlowHandle>,
    shared: Arc<FlowShared>,
    mut write_rx: mpsc::Receiver<WriteJob>,
    engine_tx: mpsc::Sender<EngineMsg>,
    token: FlowToken,
) {
    tokio::spawn(async move {
        while let Some(job) = write_rx.recv().await {
            if !shared.is_active() {
                break;
            }
            if let Err(err) = handle.write_datagrams(&[job.data], &[job.endpoint]).await {
                if GateError::indicates_flow_closed(&err.to_string()) {
                    shared.mark_closed();
                    let _ = engine_tx.send(EngineMsg::FlowClosed { token }).await;
                    break;
                }
                debug!(flow = token.id, error = %err, "flow write failed");
            }
        }
    });
}

fn spawn_tcp_writer(
    handle: Arc<dyn TcpFlowHandle>,
    shared: Arc<FlowShared>,
    mut write_rx: mpsc::Receiver<WriteJob>,
    engine_tx: mpsc::Sender<EngineMsg>,
    token: FlowToken,
) {
    tokio::spawn(async move {
        while let Some(job) = write_rx.recv().await {
            if !shared.is_active() {
                break;
            }
            match handle.write_message(&job.data).await {
                Ok(()) => {
                    // One response per TCP exchange; half-close our side.
                    handle.close_write();
                }
                Err(err) => {
                    if GateError::indicates_flow_closed(&err.to_string()) {
                        shared.mark_closed();
                        let _ = engine_tx.send(EngineMsg::FlowClosed { token }).await;
                        break;
                    }
                    debug!(flow = token.id, error = %err, "tcp write failed");
                }
            }
        }
    });
}
