//! TCP port forwarding through a tunnel.
//!
//! Two forwarding directions:
//!
//! - [`LocalForward`]: binds a local TCP port and carries each accepted TCP
//!   connection over a new stream on a shared tunnel connection.
//! - [`RemoteForward`]: accepts tunnel connections, and pipes every stream
//!   on them to a fixed TCP target.
//!
//! # Example
//!
//! ```rust,ignore
//! use qtunnel::{Dialer, LocalForward, TransportKind, TunnelConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let dialer = Dialer::new(TunnelConfig::new(TransportKind::Kcp));
//! let forward = LocalForward::bind(dialer, "127.0.0.1:9055", "tunnel.example:4000").await?;
//! forward.run(CancellationToken::new()).await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::listener::{Dialer, Listener};
use crate::stream::Stream;

// ── LocalForward ────────────────────────────────────────────────────────────

/// Tunnel connection shared by all forwarded TCP connections, re-dialed
/// once it is found closed.
struct SharedTunnel {
    dialer: Dialer,
    remote: String,
    current: Mutex<Option<Arc<Connection>>>,
}

impl SharedTunnel {
    async fn connection(&self) -> Result<Arc<Connection>> {
        let mut current = self.current.lock().await;
        if let Some(conn) = current.as_ref() {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
            debug!("LocalForward: tunnel to {} closed, re-dialing", self.remote);
        }
        let conn = Arc::new(self.dialer.dial(&self.remote).await?);
        info!(
            "LocalForward: tunnel to {} established over {}",
            self.remote,
            conn.transport()
        );
        *current = Some(conn.clone());
        Ok(conn)
    }

    async fn open_stream(&self) -> Result<Stream> {
        let conn = self.connection().await?;
        match conn.open_stream().await {
            Ok(stream) => Ok(stream),
            Err(e) if e.is_closed() => self.connection().await?.open_stream().await,
            Err(e) => Err(e),
        }
    }
}

/// Forward local TCP connections through a tunnel.
pub struct LocalForward {
    listener: TcpListener,
    local: SocketAddr,
    tunnel: Arc<SharedTunnel>,
}

impl LocalForward {
    /// Bind the local TCP port. The tunnel is dialed on first use.
    pub async fn bind(dialer: Dialer, bind_addr: &str, remote: impl Into<String>) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| Error::Bind {
                addr: bind_addr.to_string(),
                source,
            })?;
        let local = listener.local_addr()?;
        Ok(Self {
            listener,
            local,
            tunnel: Arc::new(SharedTunnel {
                dialer,
                remote: remote.into(),
                current: Mutex::new(None),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Run the forwarder until `cancel` is triggered.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            "LocalForward: listening on {} -> {} ({})",
            self.local,
            self.tunnel.remote,
            self.tunnel.dialer.config().transport
        );

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    let (tcp, peer_addr) = result?;
                    debug!("LocalForward: accepted TCP from {}", peer_addr);

                    let tunnel = self.tunnel.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = forward_local(tcp, tunnel, cancel).await {
                            warn!("LocalForward: connection from {} failed: {}", peer_addr, e);
                        }
                    });
                }
                _ = cancel.cancelled() => {
                    info!("LocalForward: shutting down");
                    if let Some(conn) = self.tunnel.current.lock().await.take() {
                        conn.close();
                    }
                    return Ok(());
                }
            }
        }
    }
}

// ── RemoteForward ───────────────────────────────────────────────────────────

/// Forward every stream arriving on a tunnel listener to a TCP target.
pub struct RemoteForward {
    listener: Listener,
    target_addr: SocketAddr,
}

impl RemoteForward {
    pub fn new(listener: Listener, target_addr: SocketAddr) -> Self {
        Self {
            listener,
            target_addr,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Run the forwarder until `cancel` is triggered.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            "RemoteForward: listening on {} ({}) -> tcp://{}",
            self.listener.local_addr(),
            self.listener.transport(),
            self.target_addr
        );

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    let conn = match result {
                        Ok(conn) => conn,
                        Err(e) if e.is_closed() => return Err(e),
                        Err(e) => {
                            warn!("RemoteForward: accept failed: {}", e);
                            continue;
                        }
                    };
                    debug!("RemoteForward: tunnel from {:?}", conn.peer_addr());

                    let target_addr = self.target_addr;
                    let cancel = cancel.clone();
                    tokio::spawn(serve_connection(conn, target_addr, cancel));
                }
                _ = cancel.cancelled() => {
                    info!("RemoteForward: shutting down");
                    self.listener.close();
                    return Ok(());
                }
            }
        }
    }
}

async fn serve_connection(conn: Connection, target_addr: SocketAddr, cancel: CancellationToken) {
    loop {
        tokio::select! {
            result = conn.accept_stream() => {
                match result {
                    Ok(stream) => {
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = forward_remote(stream, target_addr, cancel).await {
                                warn!("RemoteForward: stream to {} failed: {}", target_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        debug!("RemoteForward: tunnel from {:?} ended: {}", conn.peer_addr(), e);
                        return;
                    }
                }
            }
            _ = cancel.cancelled() => {
                conn.close();
                return;
            }
        }
    }
}

// ── internal handlers ───────────────────────────────────────────────────────

async fn forward_local(
    mut tcp: TcpStream,
    tunnel: Arc<SharedTunnel>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut stream = tunnel.open_stream().await?;
    debug!("LocalForward: opened stream {}", stream.id());

    tokio::select! {
        result = copy_bidirectional(&mut tcp, &mut stream) => {
            match result {
                Ok((up, down)) => debug!("LocalForward: done  up={} down={}", up, down),
                Err(e) => debug!("LocalForward: copy error: {}", e),
            }
        }
        _ = cancel.cancelled() => {
            debug!("LocalForward: cancelled");
        }
    }

    let _ = stream.shutdown().await;
    Ok(())
}

async fn forward_remote(
    mut stream: Stream,
    target_addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    let mut tcp = TcpStream::connect(target_addr)
        .await
        .map_err(|e| Error::connect(target_addr.to_string(), e))?;
    debug!("RemoteForward: connected to {}", target_addr);

    tokio::select! {
        result = copy_bidirectional(&mut stream, &mut tcp) => {
            match result {
                Ok((down, up)) => debug!("RemoteForward: done  down={} up={}", down, up),
                Err(e) => debug!("RemoteForward: copy error: {}", e),
            }
        }
        _ = cancel.cancelled() => {
            debug!("RemoteForward: cancelled");
        }
    }

    let _ = stream.shutdown().await;
    Ok(())
}
