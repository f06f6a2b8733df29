use crate::config::TransportKind;
use crate::error::Result;
use crate::mux::MuxConnection;
use crate::stream::Stream;
use crate::transport::quic::QuicConnection;
use std::fmt;
use std::net::SocketAddr;
use tracing::debug;

/// Connection represents one session with a single peer
///
/// Produces any number of [`Stream`]s in both directions. How streams are
/// carried depends on the transport: native QUIC streams, or a yamux session
/// over a byte pipe for every other transport. Dropping the connection
/// closes it.
pub struct Connection {
    transport: TransportKind,
    inner: Inner,
}

enum Inner {
    Mux(MuxConnection),
    Quic(QuicConnection),
}

impl Connection {
    pub(crate) fn mux(transport: TransportKind, conn: MuxConnection) -> Self {
        Self {
            transport,
            inner: Inner::Mux(conn),
        }
    }

    pub(crate) fn quic(conn: QuicConnection) -> Self {
        Self {
            transport: TransportKind::Quic,
            inner: Inner::Quic(conn),
        }
    }

    /// Open a new stream to the peer
    ///
    /// Fails once the connection is closed. Both sides may open streams.
    pub async fn open_stream(&self) -> Result<Stream> {
        match &self.inner {
            Inner::Mux(c) => c.open_stream().await,
            Inner::Quic(c) => c.open_stream().await,
        }
    }

    /// Wait for the peer to open a stream
    ///
    /// Returns a closed error as soon as the connection closes, including
    /// for calls already waiting.
    pub async fn accept_stream(&self) -> Result<Stream> {
        match &self.inner {
            Inner::Mux(c) => c.accept_stream().await,
            Inner::Quic(c) => c.accept_stream().await,
        }
    }

    /// Close the connection and every stream on it. Idempotent.
    pub fn close(&self) {
        debug!(transport = %self.transport, peer = ?self.peer_addr(), "Closing connection");
        match &self.inner {
            Inner::Mux(c) => c.close(),
            Inner::Quic(c) => c.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match &self.inner {
            Inner::Mux(c) => c.is_closed(),
            Inner::Quic(c) => c.is_closed(),
        }
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Local address, if known
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.inner {
            Inner::Mux(c) => c.local_addr(),
            Inner::Quic(c) => c.local_addr(),
        }
    }

    /// Remote peer address, if known
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match &self.inner {
            Inner::Mux(c) => c.peer_addr(),
            Inner::Quic(c) => Some(c.peer_addr()),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("transport", &self.transport)
            .field("local", &self.local_addr())
            .field("peer", &self.peer_addr())
            .field("closed", &self.is_closed())
            .finish()
    }
}
