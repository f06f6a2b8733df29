use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors that can occur in tunnel operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Listener could not bind its local address
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Dial failed, including handshake rejection by the remote side
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: Box<Error>,
    },

    /// Invalid configuration (unparseable address, bad certificate, ...)
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Listener, connection or stream closed cleanly
    #[error("Connection closed")]
    Closed,

    /// Closed because of an earlier failure; every waiter sees the same reason
    #[error("Connection closed: {0}")]
    Shutdown(Arc<Error>),

    /// Deadline exceeded. `written` is the number of bytes the transport
    /// accepted before a write timed out (always 0 for reads).
    #[error("Deadline exceeded ({written} bytes written)")]
    Timeout { written: usize },

    /// Malformed data from the peer
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Multiplexer session error
    #[error("Multiplexer error: {0}")]
    Mux(#[from] yamux::ConnectionError),

    /// QUIC connection error
    #[error("QUIC error: {0}")]
    Quic(#[from] quinn::ConnectionError),

    /// HTTP/2 error
    #[error("HTTP/2 error: {0}")]
    Http2(#[from] h2::Error),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Bind,
    Connect,
    Closed,
    Timeout,
    Protocol,
    Config,
    Io,
}

impl Error {
    /// Wrap a dial-time failure.
    pub fn connect(addr: impl Into<String>, source: impl Into<Error>) -> Self {
        Error::Connect {
            addr: addr.into(),
            source: Box::new(source.into()),
        }
    }

    /// Classify this error. Wrapped library errors keep their original value;
    /// only the kind is derived.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(e) => io_kind(e),
            Error::Bind { .. } => ErrorKind::Bind,
            Error::Connect { .. } => ErrorKind::Connect,
            Error::Config(_) => ErrorKind::Config,
            Error::Closed | Error::Shutdown(_) => ErrorKind::Closed,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Mux(e) => match e {
                yamux::ConnectionError::Closed => ErrorKind::Closed,
                yamux::ConnectionError::Io(e) => io_kind(e),
                _ => ErrorKind::Protocol,
            },
            Error::Quic(e) => match e {
                quinn::ConnectionError::LocallyClosed
                | quinn::ConnectionError::ApplicationClosed(_)
                | quinn::ConnectionError::ConnectionClosed(_)
                | quinn::ConnectionError::Reset => ErrorKind::Closed,
                quinn::ConnectionError::TimedOut => ErrorKind::Timeout,
                _ => ErrorKind::Protocol,
            },
            Error::Http2(e) => {
                if e.is_io() {
                    ErrorKind::Io
                } else if e.is_go_away() || e.is_reset() {
                    ErrorKind::Closed
                } else {
                    ErrorKind::Protocol
                }
            }
            Error::WebSocket(e) => match e {
                tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                    ErrorKind::Closed
                }
                tungstenite::Error::Io(e) => io_kind(e),
                _ => ErrorKind::Protocol,
            },
        }
    }

    /// Whether this error reports a closed listener, connection or stream.
    pub fn is_closed(&self) -> bool {
        self.kind() == ErrorKind::Closed
    }
}

fn io_kind(e: &io::Error) -> ErrorKind {
    match e.kind() {
        io::ErrorKind::TimedOut => ErrorKind::Timeout,
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof => ErrorKind::Closed,
        io::ErrorKind::InvalidData => ErrorKind::Protocol,
        _ => ErrorKind::Io,
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            other => {
                let kind = match other.kind() {
                    ErrorKind::Timeout => io::ErrorKind::TimedOut,
                    ErrorKind::Closed => io::ErrorKind::BrokenPipe,
                    ErrorKind::Protocol => io::ErrorKind::InvalidData,
                    ErrorKind::Config => io::ErrorKind::InvalidInput,
                    ErrorKind::Bind => io::ErrorKind::AddrInUse,
                    ErrorKind::Connect => io::ErrorKind::ConnectionRefused,
                    ErrorKind::Io => io::ErrorKind::Other,
                };
                io::Error::new(kind, other)
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
