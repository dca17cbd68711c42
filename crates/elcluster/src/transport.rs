//! # Transport Abstraction
//!
//! A minimal, async interface for moving frames between processes.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: a Transport knows nothing about invocations or control records.
//!   It moves opaque, already-delimited frames.
//! - **Duplex**: `send` and `recv` are independent; correlation of requests and replies is
//!   built on top of this, not defined here.

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

use elwire::frame::MAX_FRAME_LEN;

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The peer is unreachable or the connection was dropped.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    /// The operation did not complete within its bound.
    #[error("Transport operation timed out")]
    Timeout,
    /// A frame exceeded `MAX_FRAME_LEN`.
    #[error("Payload too large for transport: {0} bytes")]
    PayloadTooLarge(usize),
    /// The address does not name a transport this connector understands.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    /// Generic I/O error or internal transport failure.
    #[error("I/O error: {0}")]
    Io(String),
}

pub type Error = TransportError;

pub type Result<T> = std::result::Result<T, TransportError>;

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => Self::ConnectionLost(e.to_string()),
            _ => Self::Io(e.to_string()),
        }
    }
}

/// A duplex channel of frames.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one frame.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Receives the next frame; `Ok(None)` once the peer closed the stream.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Releases the underlying connection. Later sends fail.
    async fn close(&self) {}
}

/// Turns an address into a connected transport.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, address: &str) -> Result<Box<dyn Transport>>;
}

/// Strips the `tcp://` scheme, leaving `host:port`.
pub fn tcp_authority(address: &str) -> Result<&str> {
    address
        .strip_prefix("tcp://")
        .filter(|rest| rest.contains(':'))
        .ok_or_else(|| TransportError::InvalidAddress(address.to_string()))
}

/// Reads one length-prefixed frame. `Ok(None)` on a clean close between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncReadExt + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(TransportError::PayloadTooLarge(len));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(TransportError::PayloadTooLarge(payload.len()));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Length-prefixed frames over one TCP stream.
pub struct TcpTransport {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
}

impl TcpTransport {
    pub fn from_stream(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }

    /// Connects to a `tcp://host:port` address within `timeout`.
    pub async fn connect(address: &str, timeout: Duration) -> Result<Self> {
        let authority = tcp_authority(address)?;
        let stream = tokio::time::timeout(timeout, TcpStream::connect(authority))
            .await
            .map_err(|_| TransportError::Timeout)??;
        Ok(Self::from_stream(stream))
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, payload).await
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;
        read_frame(&mut *reader).await
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}
