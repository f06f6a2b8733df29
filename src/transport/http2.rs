//! HTTP/2 over TCP: one long-lived POST exchange per connection, carrying a
//! yamux session.
//!
//! The dialer sends a single request and waits for the response headers.
//! From then on the request body and the response body form one byte pipe
//! in each direction, and either side opens streams through yamux.

use super::{run_setup_loop, tcp, HANDSHAKE_TIMEOUT};
use crate::backlog::{Backlog, ShutdownSignal};
use crate::config::{TransportKind, TunnelConfig};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::mux::MuxConnection;
use bytes::{Buf, Bytes};
use futures::future::poll_fn;
use futures::ready;
use http::{Method, Request, Response};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};
use yamux::Mode;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Stream and connection window. The h2 default of 64 KiB caps a tunnel
/// carrying many streams.
const WINDOW_SIZE: u32 = 4 * 1024 * 1024;

fn h2_to_io(e: ::h2::Error) -> io::Error {
    if e.is_io() {
        match e.into_io() {
            Some(e) => e,
            None => io::Error::new(io::ErrorKind::BrokenPipe, "HTTP/2 I/O error"),
        }
    } else {
        io::Error::new(io::ErrorKind::BrokenPipe, e)
    }
}

// ── Tunnel pipe ─────────────────────────────────────────────────────────────

/// Request or response body pair of the tunnel exchange.
struct H2Stream {
    send: ::h2::SendStream<Bytes>,
    recv: ::h2::RecvStream,
    /// Unread part of the last DATA frame
    pending: Bytes,
}

impl H2Stream {
    fn new(send: ::h2::SendStream<Bytes>, recv: ::h2::RecvStream) -> Self {
        Self {
            send,
            recv,
            pending: Bytes::new(),
        }
    }
}

impl AsyncRead for H2Stream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }

            match ready!(this.recv.poll_data(cx)) {
                Some(Ok(data)) => {
                    let _ = this.recv.flow_control().release_capacity(data.len());
                    this.pending = data;
                }
                Some(Err(e)) => return Poll::Ready(Err(h2_to_io(e))),
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for H2Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        this.send.reserve_capacity(buf.len());
        let mut available = this.send.capacity();
        while available == 0 {
            match ready!(this.send.poll_capacity(cx)) {
                Some(Ok(n)) => available = n,
                Some(Err(e)) => return Poll::Ready(Err(h2_to_io(e))),
                None => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "HTTP/2 stream closed",
                    )))
                }
            }
        }

        let n = available.min(buf.len());
        this.send
            .send_data(Bytes::copy_from_slice(&buf[..n]), false)
            .map_err(h2_to_io)?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the connection task as soon as they are sent
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.send.reserve_capacity(0);
        this.send.send_data(Bytes::new(), true).map_err(h2_to_io)?;
        Poll::Ready(Ok(()))
    }
}

// ── Accepting side ──────────────────────────────────────────────────────────

/// Server handshake on one accepted socket. Completes once the tunnel
/// request has arrived and been answered.
async fn establish(tcp: TcpStream, peer: SocketAddr, config: TunnelConfig) -> Result<Connection> {
    let local = tcp.local_addr().ok();
    let mut conn = ::h2::server::Builder::new()
        .initial_window_size(WINDOW_SIZE)
        .initial_connection_window_size(WINDOW_SIZE)
        .handshake::<_, Bytes>(tcp)
        .await?;

    let (request, mut respond) = match conn.accept().await {
        Some(next) => next?,
        None => {
            return Err(Error::Protocol(format!(
                "{} closed before sending the tunnel request",
                peer
            )))
        }
    };
    let send = respond.send_response(Response::new(()), false)?;
    let pipe = H2Stream::new(send, request.into_body());

    let signal = ShutdownSignal::new();
    tokio::spawn(serve(conn, signal.clone()));
    debug!(%peer, "Accepted HTTP/2 tunnel");

    let mux = MuxConnection::new(pipe, &config, Mode::Server, local, Some(peer), signal);
    Ok(Connection::mux(TransportKind::H2, mux))
}

/// Drive the server connection, refusing any request after the first.
async fn serve(mut conn: ::h2::server::Connection<TcpStream, Bytes>, signal: ShutdownSignal) {
    loop {
        let next = tokio::select! {
            biased;
            _ = signal.triggered() => break,
            next = conn.accept() => next,
        };
        match next {
            Some(Ok((_, mut respond))) => {
                trace!("Refusing extra HTTP/2 request");
                respond.send_reset(::h2::Reason::REFUSED_STREAM);
            }
            Some(Err(e)) => {
                warn!("HTTP/2 connection failed: {}", e);
                signal.trigger(Some(e.into()));
                return;
            }
            None => {
                debug!("HTTP/2 connection ended");
                signal.trigger(None);
                return;
            }
        }
    }

    // Keep the connection alive while the mux flushes its close
    conn.graceful_shutdown();
    match tokio::time::timeout(CLOSE_TIMEOUT, poll_fn(|cx| conn.poll_closed(cx))).await {
        Ok(Ok(())) => trace!("HTTP/2 connection closed"),
        Ok(Err(e)) => trace!("HTTP/2 close error: {}", e),
        Err(_) => trace!("HTTP/2 close timed out"),
    }
}

/// Listening side of the HTTP/2 transport.
pub struct H2Tunnel {
    backlog: Arc<Backlog<Result<Connection>>>,
    local: SocketAddr,
}

impl H2Tunnel {
    pub async fn bind(config: &TunnelConfig, addr: &str) -> Result<Self> {
        let (listener, local) = tcp::bind_socket(addr).await?;
        debug!(%local, "HTTP/2 tunnel listening");

        let backlog = Arc::new(Backlog::new(config.backlog));
        let config = config.clone();
        tokio::spawn(run_setup_loop(listener, backlog.clone(), move |(tcp, peer)| {
            establish(tcp, peer, config.clone())
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

// ── Dialing side ────────────────────────────────────────────────────────────

/// Drive the client connection until it ends or the mux session closes.
async fn drive(conn: ::h2::client::Connection<TcpStream, Bytes>, signal: ShutdownSignal) {
    tokio::pin!(conn);
    tokio::select! {
        result = &mut conn => {
            match result {
                Ok(()) => {
                    debug!("HTTP/2 connection ended");
                    signal.trigger(None);
                }
                Err(e) => {
                    warn!("HTTP/2 connection failed: {}", e);
                    signal.trigger(Some(e.into()));
                }
            }
            return;
        }
        _ = signal.triggered() => {}
    }

    // The connection finishes once the tunnel exchange is done
    if tokio::time::timeout(CLOSE_TIMEOUT, conn).await.is_err() {
        trace!("HTTP/2 close timed out");
    }
}

/// Client handshake and the tunnel request.
async fn open_tunnel(tcp: TcpStream, remote: SocketAddr, signal: &ShutdownSignal) -> Result<H2Stream> {
    let (requests, conn) = ::h2::client::Builder::new()
        .initial_window_size(WINDOW_SIZE)
        .initial_connection_window_size(WINDOW_SIZE)
        .handshake::<_, Bytes>(tcp)
        .await?;
    tokio::spawn(drive(conn, signal.clone()));

    let mut requests = requests.ready().await?;
    let request = Request::builder()
        .method(Method::POST)
        .uri(format!("http://{}/", remote))
        .body(())
        .map_err(|e| Error::Protocol(e.to_string()))?;
    let (response, send) = requests.send_request(request, false)?;

    let response = response.await?;
    if !response.status().is_success() {
        return Err(Error::Protocol(format!(
            "tunnel rejected with status {}",
            response.status()
        )));
    }
    Ok(H2Stream::new(send, response.into_body()))
}

pub async fn dial(config: &TunnelConfig, addr: &str) -> Result<Connection> {
    let (tcp, remote) = tcp::connect(addr).await?;
    let local = tcp.local_addr().ok();

    let signal = ShutdownSignal::new();
    let pipe = match tokio::time::timeout(HANDSHAKE_TIMEOUT, open_tunnel(tcp, remote, &signal)).await {
        Ok(Ok(pipe)) => pipe,
        Ok(Err(e)) => {
            signal.trigger(None);
            return Err(Error::connect(addr, e));
        }
        Err(_) => {
            signal.trigger(None);
            return Err(Error::connect(addr, Error::Timeout { written: 0 }));
        }
    };
    debug!(%remote, "HTTP/2 tunnel established");

    let mux = MuxConnection::new(pipe, config, Mode::Client, local, Some(remote), signal);
    Ok(Connection::mux(TransportKind::H2, mux))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn pair() -> (H2Tunnel, Connection, Connection) {
        let config = TunnelConfig::new(TransportKind::H2);
        let listener = H2Tunnel::bind(&config, "127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().to_string();

        let (client, server) = tokio::join!(dial(&config, &addr), listener.accept());
        (listener, client.unwrap(), server.unwrap())
    }

    #[tokio::test]
    async fn test_large_transfer_respects_flow_control() {
        let (_listener, client, server) = pair().await;

        let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
        let mut out = client.open_stream().await.unwrap();
        let writer = tokio::spawn({
            let payload = payload.clone();
            async move {
                out.write_all(&payload).await.unwrap();
                out.shutdown().await.unwrap();
                out
            }
        });

        let mut inc = tokio::time::timeout(Duration::from_secs(5), server.accept_stream())
            .await
            .expect("Timeout accepting stream")
            .unwrap();
        let mut got = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), inc.read_to_end(&mut got))
            .await
            .expect("Timeout reading payload")
            .unwrap();
        assert_eq!(got, payload);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_accepting_side_opens_streams() {
        let (_listener, client, server) = pair().await;

        let mut out = server.open_stream().await.unwrap();
        out.write_all(b"from server").await.unwrap();
        out.shutdown().await.unwrap();

        let mut inc = tokio::time::timeout(Duration::from_secs(5), client.accept_stream())
            .await
            .expect("Timeout accepting server stream")
            .unwrap();
        let mut got = Vec::new();
        inc.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"from server");
    }

    #[tokio::test]
    async fn test_silent_socket_does_not_block_accept() {
        let config = TunnelConfig::new(TransportKind::H2);
        let listener = H2Tunnel::bind(&config, "127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        // Connects but never speaks HTTP/2
        let _silent = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = dial(&config, &addr.to_string()).await.unwrap();
        let server = tokio::time::timeout(Duration::from_secs(3), listener.accept())
            .await
            .expect("accept should not wait on the silent socket")
            .unwrap();
        assert_eq!(server.peer_addr(), client.local_addr());
    }

    #[tokio::test]
    async fn test_peer_close_ends_accept_stream() {
        let (_listener, client, server) = pair().await;

        client.close();
        let err = tokio::time::timeout(Duration::from_secs(5), server.accept_stream())
            .await
            .expect("peer close should reach the server")
            .unwrap_err();
        assert!(err.is_closed());
    }
}
