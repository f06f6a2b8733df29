//! yamux session over a single byte stream.
//!
//! A driver task owns the [`yamux::Connection`]. Outbound opens reach it over
//! a channel; inbound streams go into a [`Backlog`] that `accept_stream`
//! drains. Closing the session (locally, by the peer, or through the shared
//! signal) ends the driver, which closes the yamux connection and with it
//! every stream.

use crate::backlog::{Backlog, ShutdownSignal};
use crate::config::TunnelConfig;
use crate::error::{Error, Result};
use crate::stream::Stream;
use futures::future::poll_fn;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt};
use tracing::{debug, trace, warn};
use yamux::Mode;

/// Upper bound on the graceful yamux close during teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type Opener = oneshot::Sender<std::result::Result<yamux::Stream, yamux::ConnectionError>>;

/// Many logical streams over one byte stream.
pub struct MuxConnection {
    opener: mpsc::Sender<Opener>,
    inbound: Arc<Backlog<yamux::Stream>>,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
}

impl MuxConnection {
    /// Start a session on `io`. `Mode::Server` on the accepting side,
    /// `Mode::Client` on the dialing side.
    ///
    /// The session closes when `signal` fires, so a listener can tear down
    /// the sessions it handed out by passing a child of its own signal.
    pub fn new<T>(
        io: T,
        config: &TunnelConfig,
        mode: Mode,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        signal: ShutdownSignal,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let conn = yamux::Connection::new(io.compat(), config.mux.to_yamux(), mode);
        let inbound = Arc::new(Backlog::with_signal(config.backlog, signal));
        let (opener, commands) = mpsc::channel(64);

        debug!(?mode, ?remote, "Mux session started");
        tokio::spawn(drive(conn, commands, inbound.clone()));

        Self {
            opener,
            inbound,
            local,
            remote,
        }
    }

    /// Open a new logical stream.
    pub async fn open_stream(&self) -> Result<Stream> {
        let signal = self.inbound.signal();
        if signal.is_triggered() {
            return Err(signal.error());
        }

        let (tx, rx) = oneshot::channel();
        self.opener.send(tx).await.map_err(|_| signal.error())?;

        let stream = tokio::select! {
            biased;
            _ = signal.triggered() => return Err(signal.error()),
            result = rx => result.map_err(|_| signal.error())??,
        };
        trace!(id = %stream.id(), "Opened mux stream");
        Ok(self.wrap(stream))
    }

    /// Wait for the peer to open a stream.
    pub async fn accept_stream(&self) -> Result<Stream> {
        let stream = self.inbound.pop().await?;
        trace!(id = %stream.id(), "Accepted mux stream");
        Ok(self.wrap(stream))
    }

    /// Close the session. Idempotent.
    pub fn close(&self) {
        if self.inbound.close(None) {
            debug!(remote = ?self.remote, "Mux session closing");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inbound.is_closed()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn wrap(&self, stream: yamux::Stream) -> Stream {
        let id = u64::from(stream.id().val());
        Stream::new(stream.compat(), id, self.local, self.remote)
    }
}

impl Drop for MuxConnection {
    fn drop(&mut self) {
        self.inbound.close(None);
    }
}

enum Event {
    Inbound(yamux::Stream),
    Closed(Option<yamux::ConnectionError>),
}

/// Serve queued opens, then drive the session until an inbound stream or
/// the end of the connection.
fn poll_session<T>(
    conn: &mut yamux::Connection<T>,
    commands: &mut mpsc::Receiver<Opener>,
    waiting: &mut VecDeque<Opener>,
    cx: &mut Context<'_>,
) -> Poll<Event>
where
    T: futures::AsyncRead + futures::AsyncWrite + Unpin,
{
    loop {
        match commands.poll_recv(cx) {
            Poll::Ready(Some(opener)) => waiting.push_back(opener),
            Poll::Ready(None) => return Poll::Ready(Event::Closed(None)),
            Poll::Pending => break,
        }
    }

    while !waiting.is_empty() {
        match conn.poll_new_outbound(cx) {
            Poll::Ready(result) => {
                if let Some(opener) = waiting.pop_front() {
                    let _ = opener.send(result);
                }
            }
            Poll::Pending => break,
        }
    }

    match conn.poll_next_inbound(cx) {
        Poll::Ready(Some(Ok(stream))) => Poll::Ready(Event::Inbound(stream)),
        Poll::Ready(Some(Err(e))) => Poll::Ready(Event::Closed(Some(e))),
        Poll::Ready(None) => Poll::Ready(Event::Closed(None)),
        Poll::Pending => Poll::Pending,
    }
}

async fn drive<T>(
    mut conn: yamux::Connection<T>,
    mut commands: mpsc::Receiver<Opener>,
    inbound: Arc<Backlog<yamux::Stream>>,
) where
    T: futures::AsyncRead + futures::AsyncWrite + Unpin,
{
    let signal = inbound.signal().clone();
    let mut waiting = VecDeque::new();

    let reason = loop {
        let event = tokio::select! {
            biased;
            _ = signal.triggered() => break None,
            event = poll_fn(|cx| poll_session(&mut conn, &mut commands, &mut waiting, cx)) => event,
        };
        match event {
            Event::Inbound(stream) => {
                // Blocks while the backlog is full
                if let Err(stream) = inbound.push(stream).await {
                    trace!(id = %stream.id(), "Dropping inbound stream on closed session");
                }
            }
            Event::Closed(reason) => break reason,
        }
    };

    match &reason {
        Some(e) => warn!("Mux session failed: {}", e),
        None => debug!("Mux session ended"),
    }
    signal.trigger(reason.map(Error::Mux));

    commands.close();
    while let Ok(opener) = commands.try_recv() {
        waiting.push_back(opener);
    }
    for opener in waiting.drain(..) {
        let _ = opener.send(Err(yamux::ConnectionError::Closed));
    }

    match tokio::time::timeout(CLOSE_TIMEOUT, poll_fn(|cx| conn.poll_close(cx))).await {
        Ok(Ok(())) => trace!("Mux session closed"),
        Ok(Err(e)) => trace!("Mux close error: {}", e),
        Err(_) => trace!("Mux close timed out"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn session_pair() -> (MuxConnection, MuxConnection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let cfg = TunnelConfig::default();
        let client = MuxConnection::new(a, &cfg, Mode::Client, None, None, ShutdownSignal::new());
        let server = MuxConnection::new(b, &cfg, Mode::Server, None, None, ShutdownSignal::new());
        (client, server)
    }

    #[tokio::test]
    async fn test_open_and_accept() {
        let (client, server) = session_pair();

        let mut out = client.open_stream().await.unwrap();
        out.write_all(b"ping").await.unwrap();

        let mut inc = tokio::time::timeout(Duration::from_secs(5), server.accept_stream())
            .await
            .expect("Timeout accepting stream")
            .unwrap();
        let mut buf = [0u8; 4];
        inc.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        inc.write_all(b"pong").await.unwrap();
        out.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_both_sides_can_open() {
        let (client, server) = session_pair();

        let mut from_server = server.open_stream().await.unwrap();
        from_server.write_all(b"hi").await.unwrap();

        let mut at_client = tokio::time::timeout(Duration::from_secs(5), client.accept_stream())
            .await
            .expect("Timeout accepting stream")
            .unwrap();
        let mut buf = [0u8; 2];
        at_client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_close_unblocks_accept_stream() {
        let (_client, server) = session_pair();
        let server = Arc::new(server);

        let waiter = tokio::spawn({
            let server = server.clone();
            async move { server.accept_stream().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        server.close();
        server.close();

        let err = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("accept_stream should unblock")
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
        assert!(server.is_closed());
        assert!(server.open_stream().await.is_err());
    }

    #[tokio::test]
    async fn test_peer_close_ends_session() {
        let (client, server) = session_pair();
        client.close();

        let err = tokio::time::timeout(Duration::from_secs(5), server.accept_stream())
            .await
            .expect("peer close should end accept_stream")
            .unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn test_parent_signal_closes_session() {
        let (a, _b) = tokio::io::duplex(1024);
        let parent = ShutdownSignal::new();
        let conn = MuxConnection::new(
            a,
            &TunnelConfig::default(),
            Mode::Server,
            None,
            None,
            parent.child(),
        );

        parent.trigger(None);
        let err = tokio::time::timeout(Duration::from_secs(5), conn.accept_stream())
            .await
            .expect("parent shutdown should reach the session")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Closed);
    }
}
