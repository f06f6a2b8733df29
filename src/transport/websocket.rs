//! WebSocket: binary messages adapted to a byte stream, then yamux.
//!
//! Every upgraded peer is held by its handler task until the connection
//! built from it closes or the listener closes, whichever happens first.
//! Closing the listener therefore also closes the connections it accepted.

use super::tcp;
use super::{Acceptor, ACCEPT_BACKOFF, HANDSHAKE_TIMEOUT};
use crate::adapter::MessageAdapter;
use crate::backlog::{Backlog, ShutdownSignal};
use crate::config::{TransportKind, TunnelConfig};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::mux::MuxConnection;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};
use yamux::Mode;

/// An upgraded peer waiting for `accept()`.
struct Handoff {
    ws: WebSocketStream<TcpStream>,
    local: Option<SocketAddr>,
    peer: SocketAddr,
    /// Fires when the connection built from this peer closes
    signal: ShutdownSignal,
}

type WsBacklog = Backlog<io::Result<Handoff>>;

/// Listening side of the WebSocket transport.
pub struct WsTunnel {
    config: TunnelConfig,
    backlog: Arc<WsBacklog>,
    local: SocketAddr,
}

impl WsTunnel {
    pub async fn bind(config: &TunnelConfig, addr: &str) -> Result<Self> {
        let (listener, local) = tcp::bind_socket(addr).await?;
        debug!(%local, "WebSocket tunnel listening");

        let backlog = Arc::new(Backlog::new(config.backlog));
        tokio::spawn(serve(listener, backlog.clone()));
        Ok(Self {
            config: config.clone(),
            backlog,
            local,
        })
    }

    pub async fn accept(&self) -> Result<Connection> {
        let handoff = self.backlog.pop().await??;
        debug!(peer = %handoff.peer, "Accepted WebSocket connection");

        let mux = MuxConnection::new(
            MessageAdapter::new(handoff.ws),
            &self.config,
            Mode::Server,
            handoff.local,
            Some(handoff.peer),
            handoff.signal,
        );
        Ok(Connection::mux(TransportKind::Ws, mux))
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

/// Accept TCP sockets and hand each to its own upgrade handler.
async fn serve(mut listener: TcpListener, backlog: Arc<WsBacklog>) {
    let signal = backlog.signal().clone();
    loop {
        let next = tokio::select! {
            biased;
            _ = signal.triggered() => break,
            next = listener.next_inbound() => next,
        };
        match next {
            Some(Ok((tcp, peer))) => {
                tokio::spawn(handle(tcp, peer, backlog.clone()));
            }
            Some(Err(e)) => {
                warn!("Accept failed: {}", e);
                if backlog.push(Err(e)).await.is_err() {
                    break;
                }
                tokio::select! {
                    _ = signal.triggered() => break,
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
            None => break,
        }
    }
    debug!("WebSocket accept loop stopped");
}

async fn handle(tcp: TcpStream, peer: SocketAddr, backlog: Arc<WsBacklog>) {
    let listener_signal = backlog.signal().clone();
    let local = tcp.local_addr().ok();

    let upgraded = tokio::select! {
        _ = listener_signal.triggered() => return,
        upgraded = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(tcp)) => upgraded,
    };
    let ws = match upgraded {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!(%peer, "WebSocket upgrade failed: {}", e);
            return;
        }
        Err(_) => {
            debug!(%peer, "WebSocket upgrade timed out");
            return;
        }
    };

    let signal = listener_signal.child();
    let handoff = Handoff {
        ws,
        local,
        peer,
        signal: signal.clone(),
    };
    if backlog.push(Ok(handoff)).await.is_err() {
        trace!(%peer, "Listener closed before handoff");
        return;
    }

    signal.triggered().await;
    trace!(%peer, "WebSocket handler released");
}

pub async fn dial(config: &TunnelConfig, addr: &str) -> Result<Connection> {
    let (tcp, remote) = tcp::connect(addr).await?;
    let local = tcp.local_addr().ok();

    let url = format!("ws://{}/", remote);
    let (ws, response) = tokio_tungstenite::client_async(url, tcp)
        .await
        .map_err(|e| Error::connect(addr, e))?;
    debug!(%remote, status = %response.status(), "WebSocket connection established");

    let mux = MuxConnection::new(
        MessageAdapter::new(ws),
        config,
        Mode::Client,
        local,
        Some(remote),
        ShutdownSignal::new(),
    );
    Ok(Connection::mux(TransportKind::Ws, mux))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_listener_close_releases_accepted_connections() {
        let config = TunnelConfig::new(TransportKind::Ws);
        let listener = WsTunnel::bind(&config, "127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().to_string();

        let client = dial(&config, &addr).await.unwrap();
        let server = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("Timeout accepting connection")
            .unwrap();
        assert!(!server.is_closed());

        listener.close();
        let err = tokio::time::timeout(Duration::from_secs(5), server.accept_stream())
            .await
            .expect("listener close should reach accepted connections")
            .unwrap_err();
        assert!(err.is_closed());
        drop(client);
    }

    #[tokio::test]
    async fn test_failed_upgrade_is_not_queued() {
        let config = TunnelConfig::new(TransportKind::Ws);
        let listener = WsTunnel::bind(&config, "127.0.0.1:0").await.unwrap();

        let mut raw = TcpStream::connect(listener.local_addr()).await.unwrap();
        raw.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();

        let pending = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(pending.is_err(), "plain HTTP request must not produce a connection");
    }

    #[tokio::test]
    async fn test_silent_socket_does_not_block_accept() {
        let config = TunnelConfig::new(TransportKind::Ws);
        let listener = WsTunnel::bind(&config, "127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        let _silent = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = dial(&config, &addr.to_string()).await.unwrap();
        let server = tokio::time::timeout(Duration::from_secs(3), listener.accept())
            .await
            .expect("accept should not wait on the silent socket")
            .unwrap();
        assert_eq!(server.peer_addr(), client.local_addr());
    }
}
