//! Southbound flow abstraction: the OS network-flow API is consumed through
//! these traits, and the engine tracks each accepted flow with a token the
//! reader/writer tasks use to prove liveness before touching it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// A client UDP conversation handed to the proxy by the OS.
#[async_trait]
pub trait UdpFlowHandle: Send + Sync {
    /// Read pending datagrams with their source endpoints. An empty vec is
    /// a valid result; readers back off on it.
    async fn read_datagrams(&self) -> io::Result<Vec<(Bytes, SocketAddr)>>;

    /// Write datagrams attributed to the given endpoints.
    async fn write_datagrams(
        &self,
        datagrams: &[Bytes],
        endpoints: &[SocketAddr],
    ) -> io::Result<()>;

    fn close_read(&self);
    fn close_write(&self);
}

/// A client TCP conversation carrying length-prefixed DNS messages.
#[async_trait]
pub trait TcpFlowHandle: Send + Sync {
    /// Read one `u16be(len) || message` frame; `None` on clean EOF.
    async fn read_message(&self) -> io::Result<Option<Bytes>>;

    /// Write one message with the length prefix prepended.
    async fn write_message(&self, message: &[u8]) -> io::Result<()>;

    fn close_read(&self);
    fn close_write(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowProto {
    Udp,
    Tcp,
}

/// Identity of a tracked flow. The generation disambiguates a recycled id,
/// so a stale reader can never write into a newer flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowToken {
    pub id: u64,
    pub generation: u64,
}

/// Liveness flag shared between the engine (owner) and the flow's reader
/// and writer tasks, which hold only this weak view.
#[derive(Debug, Default)]
pub struct FlowShared {
    closed: AtomicBool,
}

impl FlowShared {
    pub fn is_active(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// One queued client write. For TCP flows the endpoint is the flow's remote
/// and carries no routing meaning.
#[derive(Debug)]
pub struct WriteJob {
    pub data: Bytes,
    pub endpoint: SocketAddr,
}

#[derive(Clone)]
pub enum FlowHandleKind {
    Udp(Arc<dyn UdpFlowHandle>),
    Tcp(Arc<dyn TcpFlowHandle>),
}

/// Engine-owned state for one accepted flow.
pub struct FlowRecord {
    pub token: FlowToken,
    pub remote: SocketAddr,
    pub proto: FlowProto,
    pub shared: Arc<FlowShared>,
    pub write_tx: mpsc::Sender<WriteJob>,
    pub handle: FlowHandleKind,
}

impl FlowRecord {
    /// Close both directions and flip the liveness flag. Callers remove the
    /// record from the active set in the same engine turn.
    pub fn close(&self) {
        self.shared.mark_closed();
        match &self.handle {
            FlowHandleKind::Udp(handle) => {
                handle.close_read();
                handle.close_write();
            }
            FlowHandleKind::Tcp(handle) => {
                handle.close_read();
                handle.close_write();
            }
        }
    }
}

/// Empty-read backoff schedule for flow readers; resets on any datagram.
pub const READ_BACKOFF: &[Duration] = &[
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

/// The next backoff step after `current`, saturating at the table's end.
pub fn next_backoff(current: usize) -> usize {
    (current + 1).min(READ_BACKOFF.len() - 1)
}
