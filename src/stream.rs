use crate::deadline::{DeadlineTimer, Deadlines};
use crate::error::{Error, Result};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Byte stream that a transport hands out as one logical channel.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Individual bidirectional stream within a [`Connection`](crate::Connection)
///
/// Implements AsyncRead + AsyncWrite for standard Rust async I/O. The
/// concrete transport stream (yamux or QUIC) is erased; read and write
/// deadlines are enforced here so every transport honors them the same way.
pub struct Stream {
    /// Transport-level stream
    inner: Pin<Box<dyn Io + 'static>>,

    /// Stream identifier as assigned by the transport
    id: u64,

    /// Local address of the owning connection, if known
    local: Option<SocketAddr>,

    /// Remote address of the owning connection, if known
    remote: Option<SocketAddr>,

    /// Deadlines shared with [`Stream::deadlines`] handles
    deadlines: Deadlines,

    read_timer: DeadlineTimer,
    write_timer: DeadlineTimer,
}

impl Stream {
    /// Wrap a transport stream
    pub fn new<S>(inner: S, id: u64, local: Option<SocketAddr>, remote: Option<SocketAddr>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            inner: Box::pin(inner),
            id,
            local,
            remote,
            deadlines: Deadlines::new(),
            read_timer: DeadlineTimer::default(),
            write_timer: DeadlineTimer::default(),
        }
    }

    /// Get stream ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get local address
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    /// Get remote peer address
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Handle for changing deadlines from another task, including while a
    /// read or write on this stream is blocked.
    pub fn deadlines(&self) -> Deadlines {
        self.deadlines.clone()
    }

    /// Set both read and write deadlines. `None` disables them.
    pub fn set_deadline(&self, at: Option<Instant>) {
        self.deadlines.set_deadline(at);
    }

    pub fn set_read_deadline(&self, at: Option<Instant>) {
        self.deadlines.set_read_deadline(at);
    }

    pub fn set_write_deadline(&self, at: Option<Instant>) {
        self.deadlines.set_write_deadline(at);
    }

    /// Write the whole buffer, reporting how much the transport accepted.
    ///
    /// If the write deadline fires part-way, returns
    /// [`Error::Timeout`] carrying the number of bytes already written.
    pub async fn send_all(&mut self, buf: &[u8]) -> Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            match self.write(&buf[written..]).await {
                Ok(0) => return Err(Error::Closed),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    return Err(Error::Timeout { written })
                }
                Err(e) => return Err(e.into()),
            }
        }
        match self.flush().await {
            Ok(()) => Ok(written),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(Error::Timeout { written }),
            Err(e) => Err(e.into()),
        }
    }

    /// Graceful close: flush and signal end-of-stream to the peer.
    pub async fn close(&mut self) -> Result<()> {
        self.shutdown().await?;
        Ok(())
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("inner", &"<opaque>")
            .finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(err) = this.read_timer.poll_read(&this.deadlines, cx) {
            return Poll::Ready(Err(err));
        }
        this.inner.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Poll::Ready(err) = this.write_timer.poll_write(&this.deadlines, cx) {
            return Poll::Ready(Err(err));
        }
        this.inner.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(err) = this.write_timer.poll_write(&this.deadlines, cx) {
            return Poll::Ready(Err(err));
        }
        this.inner.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().inner.as_mut().poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn pair(max_buf: usize) -> (Stream, Stream) {
        let (a, b) = tokio::io::duplex(max_buf);
        (Stream::new(a, 1, None, None), Stream::new(b, 1, None, None))
    }

    #[tokio::test]
    async fn test_stream_data_delivery() {
        let (mut a, mut b) = pair(1024);
        a.write_all(b"hello").await.unwrap();

        let mut buf = [0u8; 16];
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_read_deadline_exceeded() {
        let (_a, mut b) = pair(1024);
        b.set_read_deadline(Some(Instant::now() + Duration::from_millis(30)));

        let mut buf = [0u8; 16];
        let err = tokio::time::timeout(Duration::from_secs(2), b.read(&mut buf))
            .await
            .expect("read should time out on its own")
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_cleared_deadline_allows_read() {
        let (mut a, mut b) = pair(1024);
        b.set_read_deadline(Some(Instant::now()));
        let mut buf = [0u8; 16];
        assert!(b.read(&mut buf).await.is_err());

        b.set_read_deadline(None);
        a.write_all(b"later").await.unwrap();
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"later");
    }

    #[tokio::test]
    async fn test_deadline_set_from_other_task_unblocks_read() {
        let (_a, mut b) = pair(1024);
        let deadlines = b.deadlines();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            b.read(&mut buf).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        deadlines.set_read_deadline(Some(Instant::now()));

        let err = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("blocked read should observe new deadline")
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_send_all_reports_partial_write_on_deadline() {
        // The peer never reads, so the pipe accepts exactly its buffer size.
        let (mut a, _b) = pair(1024);
        a.set_write_deadline(Some(Instant::now() + Duration::from_millis(50)));

        let payload = vec![7u8; 64 * 1024];
        let err = a.send_all(&payload).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        match err {
            Error::Timeout { written } => {
                assert_eq!(written, 1024);
                assert!(written <= payload.len());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_close_signals_eof() {
        let (mut a, mut b) = pair(1024);
        a.write_all(b"bye").await.unwrap();
        a.close().await.unwrap();

        let mut out = Vec::new();
        b.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"bye");
    }
}
