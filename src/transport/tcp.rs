//! Plain TCP: one socket per connection, streams multiplexed by yamux.

use super::{resolve_dial, resolve_listen, run_accept_loop};
use crate::backlog::{Backlog, ShutdownSignal};
use crate::config::{TransportKind, TunnelConfig};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::mux::MuxConnection;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace};
use yamux::Mode;

pub(crate) type TcpBacklog = Backlog<io::Result<(TcpStream, SocketAddr)>>;

/// Bind a TCP socket, reporting an unusable address as a config error.
pub(crate) async fn bind_socket(addr: &str) -> Result<(TcpListener, SocketAddr)> {
    let resolved = resolve_listen(addr).await?;
    let listener = TcpListener::bind(resolved).await.map_err(|source| Error::Bind {
        addr: addr.to_string(),
        source,
    })?;
    let local = listener.local_addr()?;
    Ok((listener, local))
}

/// Bind a TCP socket and start its accept loop.
pub(crate) async fn listen(addr: &str, capacity: usize) -> Result<(Arc<TcpBacklog>, SocketAddr)> {
    let (listener, local) = bind_socket(addr).await?;

    let backlog = Arc::new(Backlog::new(capacity));
    tokio::spawn(run_accept_loop(listener, backlog.clone()));
    Ok((backlog, local))
}

/// Connect a TCP socket, reporting every failure as a connect error.
pub(crate) async fn connect(addr: &str) -> Result<(TcpStream, SocketAddr)> {
    let remote = resolve_dial(addr).await?;
    let tcp = TcpStream::connect(remote)
        .await
        .map_err(|e| Error::connect(addr, e))?;
    if let Err(e) = tcp.set_nodelay(true) {
        trace!("set_nodelay failed: {}", e);
    }
    Ok((tcp, remote))
}

/// Listening side of the TCP transport.
pub struct TcpTunnel {
    config: TunnelConfig,
    backlog: Arc<TcpBacklog>,
    local: SocketAddr,
}

impl TcpTunnel {
    pub async fn bind(config: &TunnelConfig, addr: &str) -> Result<Self> {
        let (backlog, local) = listen(addr, config.backlog).await?;
        debug!(%local, "TCP tunnel listening");
        Ok(Self {
            config: config.clone(),
            backlog,
            local,
        })
    }

    pub async fn accept(&self) -> Result<Connection> {
        let (tcp, peer) = self.backlog.pop().await??;
        if let Err(e) = tcp.set_nodelay(true) {
            trace!("set_nodelay failed: {}", e);
        }
        let local = tcp.local_addr().ok().or(Some(self.local));
        debug!(%peer, "Accepted TCP connection");

        let mux = MuxConnection::new(
            tcp,
            &self.config,
            Mode::Server,
            local,
            Some(peer),
            ShutdownSignal::new(),
        );
        Ok(Connection::mux(TransportKind::Tcp, mux))
    }

    pub fn close(&self) -> bool {
        self.backlog.close(None)
    }

    pub fn signal(&self) -> &ShutdownSignal {
        self.backlog.signal()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

pub async fn dial(config: &TunnelConfig, addr: &str) -> Result<Connection> {
    let (tcp, remote) = connect(addr).await?;
    let local = tcp.local_addr().ok();
    debug!(%remote, "TCP connection established");

    let mux = MuxConnection::new(
        tcp,
        config,
        Mode::Client,
        local,
        Some(remote),
        ShutdownSignal::new(),
    );
    Ok(Connection::mux(TransportKind::Tcp, mux))
}
