//! Local socket front end: adapts plain UDP/TCP listeners to the engine's
//! flow traits, for running the proxy as an ordinary host resolver.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::engine::{EngineHandle, TcpFlowHandle, UdpFlowHandle};
use crate::error::Result;

/// One bound UDP socket exposed as a single datagram flow: every client
/// that sends to the socket shares it, attributed by source endpoint.
pub struct UdpSocketFlow {
    socket: Arc<UdpSocket>,
}

#[async_trait]
impl UdpFlowHandle for UdpSocketFlow {
    async fn read_datagrams(&self) -> io::Result<Vec<(Bytes, SocketAddr)>> {
        let mut buf = vec![0u8; 4096];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        Ok(vec![(Bytes::copy_from_slice(&buf[..len]), from)])
    }

    async fn write_datagrams(
        &self,
        datagrams: &[Bytes],
        endpoints: &[SocketAddr],
    ) -> io::Result<()> {
        for (data, endpoint) in datagrams.iter().zip(endpoints) {
            self.socket.send_to(data, endpoint).await?;
        }
        Ok(())
    }

    fn close_read(&self) {}

    fn close_write(&self) {}
}

/// One accepted TCP connection carrying length-prefixed DNS messages.
/// Read and write halves lock independently so a pending read of the next
/// frame never holds up a response write.
pub struct TcpStreamFlow {
    read: Mutex<OwnedReadHalf>,
    write: Mutex<OwnedWriteHalf>,
}

impl TcpStreamFlow {
    fn new(stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self {
            read: Mutex::new(read),
            write: Mutex::new(write),
        }
    }
}

#[async_trait]
impl TcpFlowHandle for TcpStreamFlow {
    async fn read_message(&self) -> io::Result<Option<Bytes>> {
        let mut read = self.read.lock().await;
        let mut len_buf = [0u8; 2];
        match read.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err),
        }
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        read.read_exact(&mut buf).await?;
        Ok(Some(Bytes::from(buf)))
    }

    async fn write_message(&self, message: &[u8]) -> io::Result<()> {
        let mut write = self.write.lock().await;
        let len = u16::try_from(message.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;
        write.write_all(&len.to_be_bytes()).await?;
        write.write_all(message).await?;
        write.flush().await
    }

    fn close_read(&self) {}

    fn close_write(&self) {
        // The write half is shut down lazily; dropping the flow closes the
        // stream, and clients treat the response as final anyway.
    }
}

/// Bind the UDP front end and register it with the engine. Returns the
/// bound address.
pub async fn serve_udp(engine: EngineHandle, bind: SocketAddr) -> Result<SocketAddr> {
    let socket = UdpSocket::bind(bind).await?;
    let local = socket.local_addr()?;
    info!(%local, "UDP listener bound");
    let flow = Arc::new(UdpSocketFlow {
        socket: Arc::new(socket),
    });
    engine.register_udp_flow(flow, local).await;
    Ok(local)
}

/// Accept TCP connections and register each as a flow. Returns the bound
/// address.
pub async fn serve_tcp(engine: EngineHandle, bind: SocketAddr) -> Result<SocketAddr> {
    let listener = TcpListener::bind(bind).await?;
    let local = listener.local_addr()?;
    info!(%local, "TCP listener bound");

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted TCP connection");
                    let flow = Arc::new(TcpStreamFlow::new(stream));
                    engine.register_tcp_flow(flow, peer).await;
                }
                Err(err) => {
                    debug!(error = %err, "TCP accept failed");
                }
            }
        }
    });
    Ok(local)
}
