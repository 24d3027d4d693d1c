//! Shared fixtures: an in-memory southbound flow, a scripted loopback
//! resolver, and a canned HTTP stub for manifest fetches.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{Mutex, mpsc};

use dnsgate::dns::{self, Query, QueryType};
use dnsgate::engine::UdpFlowHandle;

pub const CLIENT: &str = "192.0.2.10:49152";

pub fn client_addr() -> SocketAddr {
    CLIENT.parse().unwrap()
}

pub fn query(id: u16, qname: &str, qtype: QueryType) -> Query {
    Query {
        id,
        opcode: 0,
        recursion_desired: true,
        qname: qname.to_string(),
        qtype,
    }
}

pub fn query_wire(id: u16, qname: &str, qtype: QueryType) -> Bytes {
    Bytes::from(dns::encode_query(&query(id, qname, qtype)))
}

/// An in-memory UDP flow: the test pushes datagrams in and reads the
/// engine's writes out.
pub struct FakeUdpFlow {
    incoming: Mutex<mpsc::UnboundedReceiver<(Bytes, SocketAddr)>>,
    writes: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
}

pub struct FakeFlowDriver {
    pub queries: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
    pub written: mpsc::UnboundedReceiver<(Bytes, SocketAddr)>,
}

impl FakeFlowDriver {
    pub fn push(&self, data: Bytes, client: SocketAddr) {
        self.queries.send((data, client)).unwrap();
    }

    /// Next datagram the engine wrote to this flow.
    pub async fn expect_write(&mut self) -> (Bytes, SocketAddr) {
        tokio::time::timeout(Duration::from_secs(5), self.written.recv())
            .await
            .expect("engine wrote a response in time")
            .expect("flow still open")
    }

    pub async fn expect_no_write(&mut self, within: Duration) {
        let outcome = tokio::time::timeout(within, self.written.recv()).await;
        assert!(outcome.is_err(), "unexpected write: {:?}", outcome);
    }
}

pub fn fake_udp_flow() -> (Arc<FakeUdpFlow>, FakeFlowDriver) {
    let (query_tx, query_rx) = mpsc::unbounded_channel();
    let (write_tx, write_rx) = mpsc::unbounded_channel();
    let flow = Arc::new(FakeUdpFlow {
        incoming: Mutex::new(query_rx),
        writes: write_tx,
    });
    let driver = FakeFlowDriver {
        queries: query_tx,
        written: write_rx,
    };
    (flow, driver)
}

#[async_trait]
impl UdpFlowHandle for FakeUdpFlow {
    async fn read_datagrams(&self) -> io::Result<Vec<(Bytes, SocketAddr)>> {
        let mut incoming = self.incoming.lock().await;
        match incoming.recv().await {
            Some(datagram) => Ok(vec![datagram]),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "flow is closed")),
        }
    }

    async fn write_datagrams(
        &self,
        datagrams: &[Bytes],
        endpoints: &[SocketAddr],
    ) -> io::Result<()> {
        for (data, endpoint) in datagrams.iter().zip(endpoints) {
            self.writes
                .send((data.clone(), *endpoint))
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "flow is closed"))?;
        }
        Ok(())
    }

    fn close_read(&self) {}

    fn close_write(&self) {}
}

/// An in-memory TCP flow speaking whole DNS messages.
pub struct FakeTcpFlow {
    incoming: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    writes: mpsc::UnboundedSender<Bytes>,
    write_closed: std::sync::atomic::AtomicBool,
}

pub struct FakeTcpDriver {
    pub queries: mpsc::UnboundedSender<Bytes>,
    pub written: mpsc::UnboundedReceiver<Bytes>,
    flow: Arc<FakeTcpFlow>,
}

impl FakeTcpDriver {
    pub fn push(&self, data: Bytes) {
        self.queries.send(data).unwrap();
    }

    pub async fn expect_write(&mut self) -> Bytes {
        tokio::time::timeout(Duration::from_secs(5), self.written.recv())
            .await
            .expect("engine wrote a response in time")
            .expect("flow still open")
    }

    pub fn write_half_closed(&self) -> bool {
        self.flow.write_closed.load(Ordering::SeqCst)
    }
}

pub fn fake_tcp_flow() -> (Arc<FakeTcpFlow>, FakeTcpDriver) {
    let (query_tx, query_rx) = mpsc::unbounded_channel();
    let (write_tx, write_rx) = mpsc::unbounded_channel();
    let flow = Arc::new(FakeTcpFlow {
        incoming: Mutex::new(query_rx),
        writes: write_tx,
        write_closed: std::sync::atomic::AtomicBool::new(false),
    });
    let driver = FakeTcpDriver {
        queries: query_tx,
        written: write_rx,
        flow: flow.clone(),
    };
    (flow, driver)
}

#[async_trait]
impl dnsgate::engine::TcpFlowHandle for FakeTcpFlow {
    async fn read_message(&self) -> io::Result<Option<Bytes>> {
        let mut incoming = self.incoming.lock().await;
        Ok(incoming.recv().await)
    }

    async fn write_message(&self, message: &[u8]) -> io::Result<()> {
        self.writes
            .send(Bytes::copy_from_slice(message))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "flow is closed"))
    }

    fn close_read(&self) {}

    fn close_write(&self) {
        self.write_closed.store(true, Ordering::SeqCst);
    }
}

/// A scripted loopback resolver: answers every query with one A record and
/// counts what it has seen.
pub struct FakeResolver {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl FakeResolver {
    /// Spawn a resolver answering `answer_ip` with `ttl` for any A query.
    pub async fn spawn(answer_ip: [u8; 4], ttl: u32) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                hits_clone.fetch_add(1, Ordering::SeqCst);
                if let Ok(query) = dns::decode_query(&buf[..len]) {
                    let reply = build_a_response(&query, answer_ip, ttl);
                    let _ = socket.send_to(&reply, from).await;
                }
            }
        });

        Self { addr, hits }
    }

    /// Spawn a resolver that swallows every query.
    pub async fn spawn_silent() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            while let Ok(_) = socket.recv_from(&mut buf).await {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        Self { addr, hits }
    }

    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Wire-format NOERROR response with a single A answer.
pub fn build_a_response(query: &Query, answer_ip: [u8; 4], ttl: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    dns::DnsHeader {
        id: query.id,
        qr: true,
        rd: query.recursion_desired,
        ra: true,
        qdcount: 1,
        ancount: 1,
        ..dns::DnsHeader::default()
    }
    .encode(&mut out)
    .unwrap();
    dns::write_name(&mut out, &query.qname).unwrap();
    out.extend_from_slice(&u16::from(query.qtype).to_be_bytes());
    out.extend_from_slice(&dns::CLASS_IN.to_be_bytes());
    dns::write_name(&mut out, &query.qname).unwrap();
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&dns::CLASS_IN.to_be_bytes());
    out.extend_from_slice(&ttl.to_be_bytes());
    out.extend_from_slice(&4u16.to_be_bytes());
    out.extend_from_slice(&answer_ip);
    out
}

/// Minimal canned HTTP server for manifest fetches: path → (status, body).
pub struct HttpStub {
    pub base_url: String,
    hits: Arc<AtomicUsize>,
}

impl HttpStub {
    pub async fn spawn(routes: HashMap<String, (u16, String)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let routes = Arc::new(routes);

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                hits_clone.fetch_add(1, Ordering::SeqCst);
                let routes = routes.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut read = 0usize;
                    loop {
                        match stream.read(&mut buf[read..]).await {
                            Ok(0) => return,
                            Ok(n) => read += n,
                            Err(_) => return,
                        }
                        if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                        if read == buf.len() {
                            return;
                        }
                    }
                    let request = String::from_utf8_lossy(&buf[..read]);
                    let path = request
                        .split_whitespace()
                        .nth(1)
                        .unwrap_or("/")
                        .to_string();
                    let (status, body) = routes
                        .get(&path)
                        .cloned()
                        .unwrap_or((404, "not found".to_string()));
                    let reason = match status {
                        200 => "OK",
                        401 => "Unauthorized",
                        404 => "Not Found",
                        _ => "Error",
                    };
                    let response = format!(
                        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{}",
                        status,
                        reason,
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self {
            base_url: format!("http://{}", addr),
            hits,
        }
    }

    pub fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}
