//! In-memory duplex pipes standing in for socket connections.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

use crate::net::connection::ConnectionId;

/// Which side of a logical connection an endpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeSide {
    /// Handed to `accept()` and served by the RPC server.
    Server,
    /// Returned to the dialer.
    Client,
}

impl std::fmt::Display for PipeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipeSide::Server => f.write_str("server"),
            PipeSide::Client => f.write_str("client"),
        }
    }
}

/// One endpoint of an in-memory duplex connection.
///
/// Bytes written here are read by the peer endpoint and vice versa. Dropping
/// (or shutting down) either endpoint ends the connection in both directions:
/// the peer observes EOF on read and `BrokenPipe` on write.
#[derive(Debug)]
pub struct PipeStream {
    inner: DuplexStream,
    id: ConnectionId,
    side: PipeSide,
}

/// Create a connected pair of pipe endpoints, `(server, client)`.
///
/// `buffer_size` bounds the bytes in flight per direction; a writer waits
/// once the peer has that many unread bytes.
pub fn pipe(buffer_size: usize) -> (PipeStream, PipeStream) {
    let (server, client) = tokio::io::duplex(buffer_size.max(1));
    let id = ConnectionId::new();

    tracing::trace!(connection_id = %id, buffer_size, "Pipe created");

    (
        PipeStream {
            inner: server,
            id,
            side: PipeSide::Server,
        },
        PipeStream {
            inner: client,
            id,
            side: PipeSide::Client,
        },
    )
}

impl PipeStream {
    /// Identifier shared by both endpoints of this pipe.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn side(&self) -> PipeSide {
        self.side
    }
}

impl AsyncRead for PipeStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PipeStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
