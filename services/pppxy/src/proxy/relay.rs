//! Bidirectional byte relay with half-close propagation.
//!
//! Each direction copies until its source reports EOF or an error, then
//! shuts down the write side of its destination so the far end sees EOF
//! while the opposite direction keeps flowing. The relay returns only once
//! both directions have finished.

use std::fmt;
use std::io;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, error};

use super::classify::{classify, ErrorClass, IoOp};

/// Copy buffer size per direction.
const RELAY_BUFFER_SIZE: usize = 8192;

/// A writer that can signal "no more data" without closing the read side.
#[async_trait]
pub trait CloseWrite: AsyncWrite + Unpin + Send {
    /// Half-close: shut down the write direction only.
    async fn close_write(&mut self) -> io::Result<()>;
}

/// A duplex stream that can be split into an owned reader and a
/// half-closable writer.
pub trait HalfClose: Send + 'static {
    type Reader: AsyncRead + Unpin + Send + 'static;
    type Writer: CloseWrite + 'static;

    fn into_halves(self) -> (Self::Reader, Self::Writer);
}

#[async_trait]
impl CloseWrite for OwnedWriteHalf {
    async fn close_write(&mut self) -> io::Result<()> {
        // shutdown(SHUT_WR) on the underlying socket
        AsyncWriteExt::shutdown(self).await
    }
}

impl HalfClose for TcpStream {
    type Reader = OwnedReadHalf;
    type Writer = OwnedWriteHalf;

    fn into_halves(self) -> (Self::Reader, Self::Writer) {
        self.into_split()
    }
}

#[async_trait]
impl CloseWrite for WriteHalf<DuplexStream> {
    async fn close_write(&mut self) -> io::Result<()> {
        AsyncWriteExt::shutdown(self).await
    }
}

impl HalfClose for DuplexStream {
    type Reader = ReadHalf<DuplexStream>;
    type Writer = WriteHalf<DuplexStream>;

    fn into_halves(self) -> (Self::Reader, Self::Writer) {
        tokio::io::split(self)
    }
}

/// Which way bytes were flowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToBackend => f.write_str("client->backend"),
            Direction::BackendToClient => f.write_str("backend->client"),
        }
    }
}

/// The error that ended one direction of a relay.
#[derive(Debug, Error)]
#[error("{op} failed: {source}")]
pub struct RelayError {
    pub op: IoOp,
    #[source]
    pub source: io::Error,
}

impl RelayError {
    fn new(op: IoOp, source: io::Error) -> Self {
        Self { op, source }
    }

    pub fn class(&self) -> ErrorClass {
        classify(self.op, &self.source)
    }
}

/// Outcome of one relay direction.
#[derive(Debug)]
pub struct RelayResult {
    pub direction: Direction,
    /// Bytes written to the destination.
    pub bytes: u64,
    /// `None` when the source reached EOF.
    pub error: Option<RelayError>,
}

/// Relay bytes between `client` and `backend` until both directions finish.
///
/// Returns `(client->backend, backend->client)`. Both streams are fully
/// closed when this returns.
pub async fn relay<A, B>(client: A, backend: B) -> (RelayResult, RelayResult)
where
    A: HalfClose,
    B: HalfClose,
{
    let (mut client_read, mut client_write) = client.into_halves();
    let (mut backend_read, mut backend_write) = backend.into_halves();

    let results = tokio::join!(
        pump(
            Direction::ClientToBackend,
            &mut client_read,
            &mut backend_write
        ),
        pump(
            Direction::BackendToClient,
            &mut backend_read,
            &mut client_write
        ),
    );

    // Only now, with both directions done, release the sockets
    drop((client_read, client_write));
    drop((backend_read, backend_write));

    results
}

/// Copy `reader` into `writer` until EOF or error, then half-close `writer`.
async fn pump<R, W>(direction: Direction, reader: &mut R, writer: &mut W) -> RelayResult
where
    R: AsyncRead + Unpin + Send,
    W: CloseWrite,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut bytes = 0u64;

    let error = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    break Some(RelayError::new(IoOp::Write, e));
                }
                bytes += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break Some(RelayError::new(IoOp::Read, e)),
        }
    };

    if let Err(e) = writer.close_write().await {
        match classify(IoOp::CloseWrite, &e) {
            // Peer already gone; races with the other direction's close
            ErrorClass::BenignShutdown => {}
            _ => error!(direction = %direction, error = %e, "Failed to close write on connection"),
        }
    }

    debug!(direction = %direction, bytes = bytes, "Relay direction finished");

    RelayResult {
        direction,
        bytes,
        error,
    }
}
