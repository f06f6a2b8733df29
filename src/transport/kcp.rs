//! Reliable UDP (KCP) with yamux on top of each session.
//!
//! A KCP session only reaches the listener once the dialer sends data, and
//! yamux stays silent until a stream is written. The dialer therefore opens
//! every session with a short preamble that the listener consumes.

use super::{resolve_dial, resolve_listen, run_setup_loop, Acceptor};
use crate::backlog::{Backlog, ShutdownSignal};
use crate::config::{TransportKind, TunnelConfig};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::mux::MuxConnection;
use std::fmt::Display;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_kcp::{KcpListener, KcpStream};
use tracing::debug;
use yamux::Mode;

const PREAMBLE: &[u8; 4] = b"QTK1";

fn kcp_io(e: impl Display) -> io::Error {
    io::Error::other(e.to_string())
}

impl Acceptor for KcpListener {
    type Unit = (KcpStream, SocketAddr);

    async fn next_inbound(&mut self) -> Option<io::Result<Self::Unit>> {
        Some(self.accept().await.map_err(kcp_io))
    }
}

/// Listening side of the KCP transport.
pub struct KcpTunnel {
    backlog: Arc<Backlog<Result<Connection>>>,
    local: SocketAddr,
}

impl KcpTunnel {
    pub async fn bind(config: &TunnelConfig, addr: &str) -> Result<Self> {
        let resolved = resolve_listen(addr).await?;
        let listener = KcpListener::bind(config.kcp.clone(), resolved)
            .await
            .map_err(|e| Error::Bind {
                addr: addr.to_string(),
                source: kcp_io(e),
            })?;
        let local = listener.local_addr()?;
        debug!(%local, "KCP tunnel listening");

        let backlog = Arc::new(Backlog::new(config.backlog));
        let config = config.clone();
        tokio::spawn(run_setup_loop(listener, backlog.clone(), move |(stream, peer)| {
            establish(stream, peer, local, config.clone())
        }));
        Ok(Self { backlog, local })
    }

    pub async fn accept(&self) -> Result<Connection> {
        self.backlog.pop().await?
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

/// Check the session preamble and start the server-side mux session.
async fn establish(
    mut stream: KcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    config: TunnelConfig,
) -> Result<Connection> {
    let mut preamble = [0u8; 4];
    stream.read_exact(&mut preamble).await?;
    if &preamble != PREAMBLE {
        return Err(Error::Protocol(format!("bad session preamble from {}", peer)));
    }
    debug!(%peer, "Accepted KCP session");

    let mux = MuxConnection::new(
        stream,
        &config,
        Mode::Server,
        Some(local),
        Some(peer),
        ShutdownSignal::new(),
    );
    Ok(Connection::mux(TransportKind::Kcp, mux))
}

pub async fn dial(config: &TunnelConfig, addr: &str) -> Result<Connection> {
    let remote = resolve_dial(addr).await?;
    let mut stream = KcpStream::connect(&config.kcp, remote)
        .await
        .map_err(|e| Error::connect(addr, kcp_io(e)))?;
    stream
        .write_all(PREAMBLE)
        .await
        .map_err(|e| Error::connect(addr, e))?;
    stream.flush().await.map_err(|e| Error::connect(addr, e))?;
    debug!(%remote, "KCP session established");

    let mux = MuxConnection::new(
        stream,
        config,
        Mode::Client,
        None,
        Some(remote),
        ShutdownSignal::new(),
    );
    Ok(Connection::mux(TransportKind::Kcp, mux))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::time::Duration;

    #[tokio::test]
    async fn test_bad_preamble_fails_only_its_accept() {
        let config = TunnelConfig::new(TransportKind::Kcp);
        let listener = KcpTunnel::bind(&config, "127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        let mut rogue = KcpStream::connect(&config.kcp, addr).await.unwrap();
        rogue.write_all(b"GET ").await.unwrap();
        rogue.flush().await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("Timeout waiting for setup failure")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);

        let _client = dial(&config, &addr.to_string()).await.unwrap();
        let server = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("Timeout accepting good session")
            .unwrap();
        assert_eq!(server.transport(), TransportKind::Kcp);
    }
}
