//! Byte-stream view of a WebSocket message stream.
//!
//! Each `poll_write` becomes exactly one binary message. Reads serve bytes
//! left over from the previous message before waiting for the next one, so a
//! reader with a small buffer never loses the tail of a large message.
//!
//! The adapter carries no deadlines of its own. It is owned by the mux
//! driver, and callers time out through the per-stream deadlines instead.

use bytes::{Buf, Bytes};
use futures::{ready, Sink, Stream as _};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::trace;

/// `AsyncRead + AsyncWrite` over a [`WebSocketStream`].
pub struct MessageAdapter<S> {
    inner: WebSocketStream<S>,
    /// Unread tail of the last message
    pending: Bytes,
}

impl<S> MessageAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
        }
    }
}

fn ws_to_io(e: tungstenite::Error) -> io::Error {
    match e {
        tungstenite::Error::Io(e) => e,
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, e)
        }
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

impl<S> AsyncRead for MessageAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => this.pending = data,
                Some(Ok(Message::Close(frame))) => {
                    trace!(?frame, "websocket closed by peer");
                    return Poll::Ready(Ok(()));
                }
                // Control frames and text are not part of the byte stream
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Poll::Ready(Err(ws_to_io(e))),
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl<S> AsyncWrite for MessageAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let mut sink = Pin::new(&mut this.inner);
        ready!(sink.as_mut().poll_ready(cx)).map_err(ws_to_io)?;
        sink.start_send(Message::binary(Bytes::copy_from_slice(buf)))
            .map_err(ws_to_io)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx).map_err(ws_to_io)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match ready!(Pin::new(&mut self.get_mut().inner).poll_close(cx)) {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(ws_to_io(e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use rand::Rng;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(1 << 20);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (client, server)
    }

    #[tokio::test]
    async fn test_arbitrary_messages_arbitrary_reads() {
        let (mut client, server) = ws_pair().await;
        let mut reader = MessageAdapter::new(server);
        let mut rng = rand::thread_rng();

        let mut expected = Vec::new();
        for _ in 0..64 {
            let len = rng.gen_range(1..4096);
            let msg: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            expected.extend_from_slice(&msg);
            client.feed(Message::binary(msg)).await.unwrap();
        }
        client.flush().await.unwrap();

        let mut got = Vec::with_capacity(expected.len());
        while got.len() < expected.len() {
            let mut buf = vec![0u8; rng.gen_range(1..700)];
            let n = reader.read(&mut buf).await.unwrap();
            assert!(n > 0);
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_small_reads_keep_message_tail() {
        let (mut client, server) = ws_pair().await;
        let mut reader = MessageAdapter::new(server);

        client.send(Message::binary(b"abcdefgh".to_vec())).await.unwrap();

        let mut buf = [0u8; 3];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"def");

        let mut rest = [0u8; 8];
        let n = reader.read(&mut rest).await.unwrap();
        assert_eq!(&rest[..n], b"gh");
    }

    #[tokio::test]
    async fn test_each_write_is_one_message() {
        let (client, mut server) = ws_pair().await;
        let mut writer = MessageAdapter::new(client);

        writer.write_all(b"first").await.unwrap();
        writer.write_all(b"second").await.unwrap();
        writer.flush().await.unwrap();

        assert_eq!(server.next().await.unwrap().unwrap(), Message::binary(b"first".to_vec()));
        assert_eq!(server.next().await.unwrap().unwrap(), Message::binary(b"second".to_vec()));
    }

    #[tokio::test]
    async fn test_non_binary_messages_skipped() {
        let (mut client, server) = ws_pair().await;
        let mut reader = MessageAdapter::new(server);

        client.send(Message::text("ignored")).await.unwrap();
        client.send(Message::binary(b"data".to_vec())).await.unwrap();

        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"data");
    }

    #[tokio::test]
    async fn test_close_reads_as_eof() {
        let (mut client, server) = ws_pair().await;
        let mut reader = MessageAdapter::new(server);

        client.close(None).await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }
}
