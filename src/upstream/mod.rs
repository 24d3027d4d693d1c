//! Per-resolver upstream connections: a connected UDP socket with a serial
//! send queue, a reader task publishing responses back to the flow engine,
//! and health/retry bookkeeping.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::error::{GateError, Result};

/// Connection lifecycle. `Failed` connections are replaced on the next
/// `get_or_create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// Transient-failure retry knobs, clamped to their configured bounds.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u8,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn clamped(max_retries: u8, initial_backoff_ms: u64) -> Self {
        Self {
            max_retries: max_retries.min(10),
            initial_backoff: Duration::from_millis(initial_backoff_ms.clamp(50, 5000)),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(250),
        }
    }
}

/// A datagram received from an upstream resolver, tagged with the server it
/// came from so cache policy can see the origin.
#[derive(Debug, Clone)]
pub struct UpstreamEvent {
    pub server: SocketAddr,
    pub data: Bytes,
}

#[derive(Debug, Default)]
struct ConnHealth {
    consecutive_failures: AtomicU64,
    total_sends: AtomicU64,
    successful_sends: AtomicU64,
}

impl ConnHealth {
    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.total_sends.fetch_add(1, Ordering::Relaxed);
        self.successful_sends.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) -> u64 {
        self.total_sends.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Health counters exposed to status reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnStats {
    pub server: SocketAddr,
    pub connected: bool,
    pub total_sends: u64,
    pub successful_sends: u64,
    pub consecutive_failures: u64,
}

pub struct UpstreamConnection {
    addr: SocketAddr,
    state: watch::Sender<ConnState>,
    send_tx: mpsc::Sender<Bytes>,
    health: Arc<ConnHealth>,
}

const SEND_QUEUE_DEPTH: usize = 256;
const RECV_BUFFER_SIZE: usize = 4096;

impl UpstreamConnection {
    /// Open a connection to `addr`. The socket is bound and connected
    /// before this returns; failures leave the connection in `Failed`, and
    /// the engine treats it as not Connected.
    pub async fn open(
        addr: SocketAddr,
        retry: RetryPolicy,
        response_tx: mpsc::Sender<UpstreamEvent>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnState::Connecting);
        let (send_tx, send_rx) = mpsc::channel::<Bytes>(SEND_QUEUE_DEPTH);
        let health = Arc::new(ConnHealth::default());

        let conn = Arc::new(Self {
            addr,
            state,
            send_tx,
            health: health.clone(),
        });

        let bind_addr: SocketAddr = match addr.ip() {
            IpAddr::V4(_) => "0.0.0.0:0".parse().expect("wildcard v4 addr is valid"),
            IpAddr::V6(_) => "[::]:0".parse().expect("wildcard v6 addr is valid"),
        };

        match UdpSocket::bind(bind_addr).await {
            Ok(socket) => match socket.connect(addr).await {
                Ok(()) => {
                    let socket = Arc::new(socket);
                    conn.state.send_replace(ConnState::Connected);
                    debug!(server = %addr, "upstream connected");
                    tokio::spawn(Self::sender_loop(
                        socket.clone(),
                        send_rx,
                        retry,
                        conn.state.clone(),
                        health.clone(),
                        addr,
                    ));
                    tokio::spawn(Self::reader_loop(
                        socket,
                        response_tx,
                        conn.state.subscribe(),
                        addr,
                    ));
                }
                Err(err) => {
                    warn!(server = %addr, error = %err, "upstream connect failed");
                    conn.state.send_replace(ConnState::Failed);
                }
            },
            Err(err) => {
                warn!(server = %addr, error = %err, "upstream bind failed");
                conn.state.send_replace(ConnState::Failed);
            }
        }

        conn
    }

    /// Serial sender: datagrams go out in queue order; transient failures
    /// are retried with exponential backoff, and exhaustion marks the
    /// connection Failed.
    async fn sender_loop(
        socket: Arc<UdpSocket>,
        mut send_rx: mpsc::Receiver<Bytes>,
        retry: RetryPolicy,
        state: watch::Sender<ConnState>,
        health: Arc<ConnHealth>,
        addr: SocketAddr,
    ) {
        while let Some(data) = send_rx.recv().await {
            if *state.borrow() == ConnState::Closed {
                break;
            }
            let mut attempt = 0u8;
            let mut backoff = retry.initial_backoff;
            loop {
                match socket.send(&data).await {
                    Ok(_) => {
                        health.record_success();
                        trace!(server = %addr, bytes = data.len(), "sent upstream");
                        break;
                    }
                    Err(err) => {
                        let failures = health.record_failure();
                        if attempt >= retry.max_retries {
                            warn!(
                                server = %addr,
                                error = %err,
                                failures,
                                "upstream send exhausted retries"
                            );
                            state.send_replace(ConnState::Failed);
                            break;
                        }
                        attempt += 1;
                        debug!(server = %addr, attempt, "retrying upstream send");
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.saturating_mul(2);
                    }
                }
            }
        }
    }

    /// Reader: publishes every datagram to the engine, tagged with the
    /// server address. Stops once the connection is closed.
    async fn reader_loop(
        socket: Arc<UdpSocket>,
        response_tx: mpsc::Sender<UpstreamEvent>,
        mut state_rx: watch::Receiver<ConnState>,
        addr: SocketAddr,
    ) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() || matches!(*state_rx.borrow(), ConnState::Closed | ConnState::Failed) {
                        break;
                    }
                }
                received = socket.recv(&mut buf) => {
                    match received {
                        Ok(len) => {
                            let event = UpstreamEvent {
                                server: addr,
                                data: Bytes::copy_from_slice(&buf[..len]),
                            };
                            if response_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            debug!(server = %addr, error = %err, "upstream read error");
                            if matches!(*state_rx.borrow(), ConnState::Closed | ConnState::Failed) {
                                break;
                            }
                        }
                    }
                }
            }
        }
        trace!(server = %addr, "upstream reader stopped");
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ConnState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// Fire-and-forget enqueue onto the serial send queue.
    pub fn send(&self, data: Bytes) -> Result<()> {
        self.send_tx
            .try_send(data)
            .map_err(|_| GateError::UpstreamTransient(format!("send queue full for {}", self.addr)))
    }

    pub fn close(&self) {
        self.state.send_replace(ConnState::Closed);
    }

    pub fn stats(&self) -> ConnStats {
        ConnStats {
            server: self.addr,
            connected: self.is_connected(),
            total_sends: self.health.total_sends.load(Ordering::Relaxed),
            successful_sends: self.health.successful_sends.load(Ordering::Relaxed),
            consecutive_failures: self.health.consecutive_failures.load(Ordering::Relaxed),
        }
    }
}

/// One connection per distinct server address. Connections are owned here;
/// the engine borrows them for the duration of one forward.
pub struct UpstreamPool {
    connections: DashMap<SocketAddr, Arc<UpstreamConnection>>,
    retry: RetryPolicy,
    response_tx: mpsc::Sender<UpstreamEvent>,
}

impl UpstreamPool {
    pub fn new(retry: RetryPolicy, response_tx: mpsc::Sender<UpstreamEvent>) -> Self {
        Self {
            connections: DashMap::new(),
            retry,
            response_tx,
        }
    }

    /// Existing live connection, or a freshly opened one. Failed and closed
    /// connections are replaced.
    pub async fn get_or_create(&self, addr: SocketAddr) -> Arc<UpstreamConnection> {
        if let Some(existing) = self.connections.get(&addr) {
            if !matches!(existing.state(), ConnState::Failed | ConnState::Closed) {
                return existing.clone();
            }
        }

        let conn = UpstreamConnection::open(addr, self.retry, self.response_tx.clone()).await;
        self.connections.insert(addr, conn.clone());
        conn
    }

    pub fn get(&self, addr: SocketAddr) -> Option<Arc<UpstreamConnection>> {
        self.connections.get(&addr).map(|c| c.clone())
    }

    /// Tear down every connection; used on VPN/path changes. The engine
    /// re-acquires connections on the next query.
    pub fn close_all(&self) {
        let count = self.connections.len();
        for entry in self.connections.iter() {
            entry.value().close();
        }
        self.connections.clear();
        if count > 0 {
            info!(count, "closed all upstream connections");
        }
    }

    pub fn stats(&self) -> Vec<ConnStats> {
        self.connections
            .iter()
            .map(|entry| entry.value().stats())
            .collect()
    }
}
