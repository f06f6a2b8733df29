//! Multi-transport stream tunnels
//!
//! This crate carries many independent byte streams between two hosts over
//! one tunnel connection. The same API works over five transports:
//!
//! - `tcp`: yamux over a plain TCP socket
//! - `kcp`: yamux over a KCP session on UDP
//! - `quic`: native QUIC bidirectional streams (TLS 1.3)
//! - `h2`: yamux over one long-lived HTTP/2 request per connection
//! - `ws`: yamux over binary WebSocket messages
//!
//! Every [`Stream`] implements `AsyncRead` and `AsyncWrite`, and carries
//! optional read and write deadlines.
//!
//! # Architecture
//!
//! ```text
//! Application / LocalForward / RemoteForward
//!     ↓
//! Listener, Dialer → Connection → Stream
//!     ↓
//! yamux session | QUIC
//!     ↓
//! TCP | KCP | HTTP/2 | WebSocket | UDP
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use qtunnel::{Dialer, Listener, TransportKind, TunnelConfig};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! #[tokio::main]
//! async fn main() -> qtunnel::Result<()> {
//!     let config = TunnelConfig::new(TransportKind::Kcp);
//!
//!     // Accept tunnels
//!     let listener = Listener::bind(&config, "127.0.0.1:4000").await?;
//!     tokio::spawn(async move {
//!         let conn = listener.accept().await?;
//!         let mut stream = conn.accept_stream().await?;
//!         let mut buf = vec![0u8; 1024];
//!         let n = stream.read(&mut buf).await?;
//!         stream.write_all(&buf[..n]).await?;
//!         qtunnel::Result::Ok(())
//!     });
//!
//!     // Dial and open a stream
//!     let conn = Dialer::new(config).dial("127.0.0.1:4000").await?;
//!     let mut stream = conn.open_stream().await?;
//!     stream.write_all(b"hello").await?;
//!
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod backlog;
pub mod config;
pub mod connection;
pub mod deadline;
pub mod error;
pub mod forward;
pub mod listener;
pub mod mux;
pub mod stream;

mod transport;

// Re-export main types
pub use adapter::MessageAdapter;
pub use backlog::{Backlog, ShutdownSignal, DEFAULT_BACKLOG};
pub use config::{MuxConfig, QuicConfig, TransportKind, TunnelConfig};
pub use connection::Connection;
pub use deadline::Deadlines;
pub use error::{Error, ErrorKind, Result};
pub use forward::{LocalForward, RemoteForward};
pub use listener::{Dialer, Listener};
pub use mux::MuxConnection;
pub use stream::Stream;
