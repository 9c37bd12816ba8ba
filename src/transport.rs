//! Network collaborators used by the rover loops.
//!
//! The loops only see [`DatagramTransport`] and [`TelemetrySink`]; the tokio
//! socket implementations live here next to an in-memory pair used to drive
//! the loops without a network.

use crate::protocol::{Datagram, ProtocolError, TelemetryRecord};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, ToSocketAddrs, UdpSocket};
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Transport closed")]
    Closed,
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

#[async_trait]
pub trait DatagramTransport: Send + Sync {
    async fn send_to(&self, bytes: &[u8], peer: SocketAddr) -> Result<usize, TransportError>;

    /// `Ok(None)` means nothing arrived within `timeout`.
    async fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, SocketAddr)>, TransportError>;
}

#[async_trait]
pub trait TelemetrySink: Send {
    /// Write one encoded, newline-terminated record.
    async fn send_record(&mut self, line: &[u8]) -> Result<(), TransportError>;
}

pub async fn send_datagram<T: DatagramTransport + ?Sized>(
    transport: &T,
    datagram: &Datagram,
    peer: SocketAddr,
) -> Result<(), TransportError> {
    let bytes = datagram.encode()?;
    transport.send_to(&bytes, peer).await?;
    Ok(())
}

pub async fn send_telemetry<S: TelemetrySink + ?Sized>(sink: &mut S, record: &TelemetryRecord) -> Result<(), TransportError> {
    let line = record.encode_line()?;
    sink.send_record(&line).await
}

pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn send_to(&self, bytes: &[u8], peer: SocketAddr) -> Result<usize, TransportError> {
        Ok(self.socket.send_to(bytes, peer).await?)
    }

    async fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, SocketAddr)>, TransportError> {
        match tokio::time::timeout(timeout, self.socket.recv_from(buf)).await {
            Ok(result) => Ok(Some(result?)),
            Err(_) => Ok(None),
        }
    }
}

pub struct TcpTelemetrySink {
    stream: TcpStream,
}

impl TcpTelemetrySink {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }
}

#[async_trait]
impl TelemetrySink for TcpTelemetrySink {
    async fn send_record(&mut self, line: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(line).await?;
        Ok(())
    }
}

type Packet = (alloc::vec::Vec<u8>, SocketAddr);

/// One end of an in-process datagram link. Whatever one end sends, the other
/// receives, with the sender's address as the source.
pub struct MemoryTransport {
    local: SocketAddr,
    outbound: mpsc::UnboundedSender<Packet>,
    inbound: Mutex<mpsc::UnboundedReceiver<Packet>>,
}

impl MemoryTransport {
    pub fn pair(a: SocketAddr, b: SocketAddr) -> (Self, Self) {
        let (to_b, from_a) = mpsc::unbounded_channel();
        let (to_a, from_b) = mpsc::unbounded_channel();
        (
            Self {
                local: a,
                outbound: to_b,
                inbound: Mutex::new(from_b),
            },
            Self {
                local: b,
                outbound: to_a,
                inbound: Mutex::new(from_a),
            },
        )
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

#[async_trait]
impl DatagramTransport for MemoryTransport {
    async fn send_to(&self, bytes: &[u8], _peer: SocketAddr) -> Result<usize, TransportError> {
        self.outbound
            .send((bytes.to_vec(), self.local))
            .map_err(|_| TransportError::Closed)?;
        Ok(bytes.len())
    }

    async fn recv_from(
        &self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Option<(usize, SocketAddr)>, TransportError> {
        let mut inbound = self.inbound.lock().await;
        match tokio::time::timeout(timeout, inbound.recv()).await {
            Ok(Some((bytes, from))) => {
                let len = bytes.len().min(buf.len());
                buf[..len].copy_from_slice(&bytes[..len]);
                Ok(Some((len, from)))
            }
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Ok(None),
        }
    }
}

/// Telemetry sink that forwards each record over a channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<alloc::vec::Vec<u8>>,
}

impl ChannelSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<alloc::vec::Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TelemetrySink for ChannelSink {
    async fn send_record(&mut self, line: &[u8]) -> Result<(), TransportError> {
        self.tx.send(line.to_vec()).map_err(|_| TransportError::Closed)
    }
}
