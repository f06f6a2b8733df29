use crate::backlog::ShutdownSignal;
use crate::config::{TransportKind, TunnelConfig};
use crate::connection::Connection;
use crate::error::Result;
use crate::transport::{http2, kcp, quic, tcp, websocket};
use rustls::pki_types::CertificateDer;
use std::fmt;
use std::net::SocketAddr;
use tracing::debug;

/// Listener accepts tunnel connections on one local address
///
/// Any number of tasks may wait in [`Listener::accept`] at once. Closing the
/// listener (explicitly or by dropping it) fails every pending and future
/// accept with a closed error.
pub struct Listener {
    transport: TransportKind,
    inner: Inner,
}

enum Inner {
    Tcp(tcp::TcpTunnel),
    Kcp(kcp::KcpTunnel),
    Quic(quic::QuicTunnel),
    Http2(http2::H2Tunnel),
    Ws(websocket::WsTunnel),
}

impl Listener {
    /// Bind `addr` (`host:port`) with the transport selected in `config`
    ///
    /// An address that does not resolve is a configuration error; failing
    /// to bind a resolved address is a bind error.
    pub async fn bind(config: &TunnelConfig, addr: &str) -> Result<Self> {
        let inner = match config.transport {
            TransportKind::Tcp => Inner::Tcp(tcp::TcpTunnel::bind(config, addr).await?),
            TransportKind::Kcp => Inner::Kcp(kcp::KcpTunnel::bind(config, addr).await?),
            TransportKind::Quic => Inner::Quic(quic::QuicTunnel::bind(config, addr).await?),
            TransportKind::H2 => Inner::Http2(http2::H2Tunnel::bind(config, addr).await?),
            TransportKind::Ws => Inner::Ws(websocket::WsTunnel::bind(config, addr).await?),
        };
        Ok(Self {
            transport: config.transport,
            inner,
        })
    }

    /// Wait for the next peer and establish its connection
    ///
    /// Session setup (TLS or HTTP/2 handshake, KCP preamble) runs per peer
    /// in the background. Finished connections and setup failures are
    /// returned in the order they complete, so a failed setup is reported
    /// to one caller without holding up the others.
    pub async fn accept(&self) -> Result<Connection> {
        match &self.inner {
            Inner::Tcp(l) => l.accept().await,
            Inner::Kcp(l) => l.accept().await,
            Inner::Quic(l) => l.accept().await,
            Inner::Http2(l) => l.accept().await,
            Inner::Ws(l) => l.accept().await,
        }
    }

    /// Stop listening. Idempotent.
    pub fn close(&self) {
        let first = match &self.inner {
            Inner::Tcp(l) => l.close(),
            Inner::Kcp(l) => l.close(),
            Inner::Quic(l) => l.close(),
            Inner::Http2(l) => l.close(),
            Inner::Ws(l) => l.close(),
        };
        if first {
            debug!(transport = %self.transport, local = %self.local_addr(), "Listener closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.signal().is_triggered()
    }

    fn signal(&self) -> &ShutdownSignal {
        match &self.inner {
            Inner::Tcp(l) => l.signal(),
            Inner::Kcp(l) => l.signal(),
            Inner::Quic(l) => l.signal(),
            Inner::Http2(l) => l.signal(),
            Inner::Ws(l) => l.signal(),
        }
    }

    /// Bound address, with port 0 resolved
    pub fn local_addr(&self) -> SocketAddr {
        match &self.inner {
            Inner::Tcp(l) => l.local_addr(),
            Inner::Kcp(l) => l.local_addr(),
            Inner::Quic(l) => l.local_addr(),
            Inner::Http2(l) => l.local_addr(),
            Inner::Ws(l) => l.local_addr(),
        }
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Certificate chain presented to QUIC clients; empty for other transports
    ///
    /// Dialers can trust it through `QuicConfig::trusted_certs` when the
    /// listener generated a self-signed certificate.
    pub fn certificate_chain(&self) -> &[CertificateDer<'static>] {
        match &self.inner {
            Inner::Quic(l) => l.certificate_chain(),
            _ => &[],
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("transport", &self.transport)
            .field("local", &self.local_addr())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Dialer establishes tunnel connections with the transport in its config
#[derive(Debug, Clone)]
pub struct Dialer {
    config: TunnelConfig,
}

impl Dialer {
    pub fn new(config: TunnelConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Connect to `addr` (`host:port`)
    ///
    /// Resolution, socket and handshake failures are all reported as
    /// connect errors.
    pub async fn dial(&self, addr: &str) -> Result<Connection> {
        match self.config.transport {
            TransportKind::Tcp => tcp::dial(&self.config, addr).await,
            TransportKind::Kcp => kcp::dial(&self.config, addr).await,
            TransportKind::Quic => quic::dial(&self.config, addr).await,
            TransportKind::H2 => http2::dial(&self.config, addr).await,
            TransportKind::Ws => websocket::dial(&self.config, addr).await,
        }
    }
}
